//! Контракт транспорта: соединение с обменом offer/answer/кандидатами
//! и один двунаправленный упорядоченный надёжный канал поверх него.

use crate::error::TransportError;
use crate::peer::types::{ConnectionState, Frame, IceCandidate, SessionDescription};
use crate::utils::BoxFuture;
use std::sync::Arc;

/// События канала
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(Frame),
    /// Буфер опустился до порога, заданного `set_buffered_amount_low_threshold`
    BufferedAmountLow,
    Closed,
    Failed(String),
}

pub type ChannelEventHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    /// Ставит фрейм в очередь отправки, порядок сохраняется
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Сколько байт поставлено в очередь, но ещё не ушло к пиру
    fn buffered_amount(&self) -> BoxFuture<'_, usize>;

    fn set_buffered_amount_low_threshold(&self, threshold: usize) -> BoxFuture<'_, ()>;

    /// Регистрирует обработчик всех событий канала. События, случившиеся
    /// до подписки (например, open), должны быть доставлены.
    fn subscribe(&self, handler: ChannelEventHandler) -> BoxFuture<'_, ()>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// События соединения
#[derive(Clone)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    /// Канал, открытый удалённой стороной (приходит отвечающему)
    DataChannel(Arc<dyn DataChannel>),
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            ConnectionEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            ConnectionEvent::StateChanged(st) => f.debug_tuple("StateChanged").field(st).finish(),
        }
    }
}

pub type ConnectionEventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

pub trait PeerConnection: Send + Sync {
    /// Создаёт offer и применяет его как локальное описание
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    /// Создаёт answer и применяет его как локальное описание
    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    fn add_ice_candidate(&self, candidate: IceCandidate)
        -> BoxFuture<'_, Result<(), TransportError>>;

    fn create_data_channel(
        &self,
        label: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn DataChannel>, TransportError>>;

    fn subscribe(&self, handler: ConnectionEventHandler);

    fn close(&self) -> BoxFuture<'_, ()>;
}
