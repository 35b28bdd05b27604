pub mod channel;
pub mod connection;
pub mod data_channel;
pub mod loopback;
pub mod transport;
pub mod types;

pub use channel::ChannelAdapter;
pub use connection::WebRtcPeer;
pub use loopback::{LoopbackChannel, LoopbackOptions, LoopbackPeer};
pub use transport::{ChannelEvent, ConnectionEvent, DataChannel, PeerConnection};
pub use types::{ConnectionState, Frame, IceCandidate, SdpKind, ServerConfig, SessionDescription};
