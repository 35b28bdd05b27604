use crate::session::{SessionEvent, SessionState};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Ошибки обмена через rendezvous-хранилище до появления прямого канала
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("room {0} expired")]
    RoomExpired(String),

    #[error("room {0} already has an answer")]
    RoomAlreadyAnswered(String),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),

    #[error("room {0} has no usable offer")]
    MalformedRoom(String),

    #[error("rendezvous store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Нарушения протокола фреймов; обрабатываются на уровне одного файла
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("binary frame received with no preceding meta")]
    UnexpectedBinary,

    #[error("end frame received with no preceding meta")]
    UnexpectedEnd,

    #[error("unknown control frame kind {0:?}")]
    UnknownControl(String),

    #[error("malformed control frame: {0}")]
    MalformedControl(String),

    #[error("meta for {next:?} received while {current:?} is still accumulating")]
    MetaWhileAccumulating { current: String, next: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("persistent sink denied: {0}")]
    Denied(String),

    #[error("persistent sink unavailable")]
    Unavailable,

    #[error("storage io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition: {event:?} in state {from:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] InvalidTransition),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Ошибки, после которых сессию можно только перезапустить вручную
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Signaling(_) | Error::Transport(_) | Error::Config(_)
        )
    }
}
