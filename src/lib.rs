//! Передача файлов между двумя устройствами напрямую по WebRTC.
//! Rendezvous-хранилище нужно только на время рукопожатия.

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod rendezvous;
pub mod room;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod utils;

pub use commands::BridgePeer;
pub use config::Config;
pub use error::{Error, Result};
pub use logger::{Emitter, SessionUpdate};
pub use session::{Role, SessionState};
pub use signaling::{Handshake, Negotiator};
