//! Транспорт внутри процесса: пара соединений и пара каналов с
//! упорядоченной надёжной доставкой. Буфер отправки опустошается
//! фоновой задачей, поэтому backpressure ведёт себя как у настоящего канала.
//! Используется в тестах и локальных демо.

use crate::error::TransportError;
use crate::logger::log;
use crate::peer::transport::{
    ChannelEvent, ChannelEventHandler, ConnectionEvent, ConnectionEventHandler, DataChannel,
    PeerConnection,
};
use crate::peer::types::{ConnectionState, Frame, IceCandidate, SdpKind, SessionDescription};
use crate::utils::{lock, random_id, BoxFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackOptions {
    /// Задержка доставки одного фрейма; ноль - только уступить планировщику
    pub drain_interval: Duration,
}

/// Доставляет события подписчику; до подписки копит их
struct Dispatcher<E> {
    inner: Mutex<DispatchState<E>>,
}

struct DispatchState<E> {
    handler: Option<Arc<dyn Fn(E) + Send + Sync>>,
    backlog: Vec<E>,
}

impl<E> Dispatcher<E> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(DispatchState {
                handler: None,
                backlog: Vec::new(),
            }),
        }
    }

    // обработчик вызывается под замком, чтобы не перепутать порядок с backlog
    fn dispatch(&self, event: E) {
        let mut state = lock(&self.inner);
        match &state.handler {
            Some(handler) => handler(event),
            None => state.backlog.push(event),
        }
    }

    fn subscribe(&self, handler: Arc<dyn Fn(E) + Send + Sync>) {
        let mut state = lock(&self.inner);
        for event in state.backlog.drain(..) {
            handler(event);
        }
        state.handler = Some(handler);
    }
}

pub struct LoopbackChannel {
    label: String,
    outbox: mpsc::UnboundedSender<Frame>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    max_buffered: AtomicUsize,
    sent_frames: AtomicUsize,
    open: AtomicBool,
    closed: AtomicBool,
    peer: OnceLock<Weak<LoopbackChannel>>,
    events: Dispatcher<ChannelEvent>,
}

impl LoopbackChannel {
    /// Создаёт связанную пару концов канала. Нужен запущенный tokio runtime.
    pub fn pair(label: &str, options: LoopbackOptions) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(Self::new(label, tx_a));
        let b = Arc::new(Self::new(label, tx_b));
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));

        tokio::spawn(pump(rx_a, Arc::downgrade(&a), Arc::downgrade(&b), options));
        tokio::spawn(pump(rx_b, Arc::downgrade(&b), Arc::downgrade(&a), options));
        (a, b)
    }

    fn new(label: &str, outbox: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            label: label.to_string(),
            outbox,
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            max_buffered: AtomicUsize::new(0),
            sent_frames: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            peer: OnceLock::new(),
            events: Dispatcher::new(),
        }
    }

    fn peer(&self) -> Option<Arc<LoopbackChannel>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    /// Открывает оба конца канала
    pub fn open(&self) {
        if let Some(peer) = self.peer() {
            peer.mark_open();
        }
        self.mark_open();
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::Acquire) && !self.open.swap(true, Ordering::AcqRel) {
            self.events.dispatch(ChannelEvent::Opened);
        }
    }

    fn mark_closed(&self, event: ChannelEvent) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events.dispatch(event);
        }
    }

    /// Обрывает оба конца с ошибкой транспорта
    pub fn fail(&self, reason: &str) {
        if let Some(peer) = self.peer() {
            peer.mark_closed(ChannelEvent::Failed(reason.to_string()));
        }
        self.mark_closed(ChannelEvent::Failed(reason.to_string()));
    }

    /// Максимум буфера сразу после постановки фрейма в очередь
    pub fn max_buffered(&self) -> usize {
        self.max_buffered.load(Ordering::Acquire)
    }

    pub fn sent_frames(&self) -> usize {
        self.sent_frames.load(Ordering::Acquire)
    }

    fn on_drained(&self, len: usize) {
        let prev = self.buffered.fetch_sub(len, Ordering::AcqRel);
        let now = prev.saturating_sub(len);
        let threshold = self.low_threshold.load(Ordering::Acquire);
        if prev > threshold && now <= threshold {
            self.events.dispatch(ChannelEvent::BufferedAmountLow);
        }
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    from: Weak<LoopbackChannel>,
    to: Weak<LoopbackChannel>,
    options: LoopbackOptions,
) {
    while let Some(frame) = rx.recv().await {
        if options.drain_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(options.drain_interval).await;
        }
        let len = frame.len();
        match to.upgrade() {
            Some(to) if !to.closed.load(Ordering::Acquire) => {
                to.events.dispatch(ChannelEvent::Message(frame))
            }
            _ => break,
        }
        match from.upgrade() {
            Some(from) => from.on_drained(len),
            None => break,
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::ConnectionClosed);
            }
            if !self.open.load(Ordering::Acquire) {
                return Err(TransportError::ConnectionFailed("channel is not open".into()));
            }
            let len = frame.len();
            let now = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
            self.max_buffered.fetch_max(now, Ordering::AcqRel);
            self.sent_frames.fetch_add(1, Ordering::AcqRel);
            self.outbox
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed)
        })
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.buffered.load(Ordering::Acquire) })
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.low_threshold.store(threshold, Ordering::Release) })
    }

    fn subscribe(&self, handler: ChannelEventHandler) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.events.subscribe(handler) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(peer) = self.peer() {
                peer.mark_closed(ChannelEvent::Closed);
            }
            self.mark_closed(ChannelEvent::Closed);
        })
    }
}

#[derive(Default)]
struct SideState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    remote_descriptions_applied: usize,
    channels_created: usize,
}

struct LinkState {
    sides: [SideState; 2],
    // (кто создал, конец создателя, конец второй стороны)
    channel: Option<(usize, Arc<LoopbackChannel>, Arc<LoopbackChannel>)>,
    connected: bool,
    closed: bool,
}

struct Link {
    state: Mutex<LinkState>,
    events: [Dispatcher<ConnectionEvent>; 2],
    options: LoopbackOptions,
}

impl Link {
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        lock(&self.state)
    }
}

/// Одна сторона соединения внутри процесса
pub struct LoopbackPeer {
    index: usize,
    link: Arc<Link>,
}

impl LoopbackPeer {
    /// Пара связанных соединений: первое - для инициатора, второе - для отвечающего
    pub fn pair(options: LoopbackOptions) -> (Arc<Self>, Arc<Self>) {
        let link = Arc::new(Link {
            state: Mutex::new(LinkState {
                sides: [SideState::default(), SideState::default()],
                channel: None,
                connected: false,
                closed: false,
            }),
            events: [Dispatcher::new(), Dispatcher::new()],
            options,
        });
        (
            Arc::new(Self {
                index: 0,
                link: link.clone(),
            }),
            Arc::new(Self { index: 1, link }),
        )
    }

    pub fn remote_descriptions_applied(&self) -> usize {
        self.link.lock().sides[self.index].remote_descriptions_applied
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.link.lock().sides[self.index].remote_candidates.clone()
    }

    pub fn channels_created(&self) -> usize {
        self.link.lock().sides[self.index].channels_created
    }

    /// Канал на этой стороне, если он уже существует
    pub fn channel(&self) -> Option<Arc<LoopbackChannel>> {
        let state = self.link.lock();
        state.channel.as_ref().map(|(creator, own, other)| {
            if *creator == self.index {
                own.clone()
            } else {
                other.clone()
            }
        })
    }

    /// Имитирует отказ транспорта на обеих сторонах
    pub fn fail(&self, reason: &str) {
        let channel = {
            let mut state = self.link.lock();
            state.closed = true;
            state.channel.as_ref().map(|(_, own, _)| own.clone())
        };
        if let Some(channel) = channel {
            channel.fail(reason);
        }
        for events in &self.link.events {
            events.dispatch(ConnectionEvent::StateChanged(ConnectionState::Failed));
        }
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.index + 1,
                50000 + self.index
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn set_local(&self, kind: SdpKind) -> Result<SessionDescription, TransportError> {
        let desc = {
            let mut state = self.link.lock();
            if state.closed {
                return Err(TransportError::ConnectionClosed);
            }
            let side = &mut state.sides[self.index];
            if kind == SdpKind::Answer && side.remote.is_none() {
                return Err(TransportError::ConnectionFailed(
                    "cannot answer without a remote offer".into(),
                ));
            }
            let desc = SessionDescription {
                kind,
                sdp: format!("v=0\r\no=loopback {} 2 IN IP4 127.0.0.1\r\n", random_id()),
            };
            side.local = Some(desc.clone());
            desc
        };
        self.link.events[self.index].dispatch(ConnectionEvent::LocalCandidate(self.local_candidate()));
        self.try_connect();
        Ok(desc)
    }

    /// Соединяется, когда обе стороны обменялись описаниями и кандидатами
    fn try_connect(&self) {
        let channel = {
            let mut state = self.link.lock();
            let ready = !state.connected
                && !state.closed
                && state.sides.iter().all(|side| {
                    side.local.is_some() && side.remote.is_some() && !side.remote_candidates.is_empty()
                });
            if !ready {
                return;
            }
            state.connected = true;
            state.channel.clone()
        };
        log("Loopback link connected");
        for events in &self.link.events {
            events.dispatch(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
        if let Some((creator, own, other)) = channel {
            let remote: Arc<dyn DataChannel> = other;
            self.link.events[1 - creator].dispatch(ConnectionEvent::DataChannel(remote));
            own.open();
        }
    }
}

impl PeerConnection for LoopbackPeer {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move { self.set_local(SdpKind::Offer) })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move { self.set_local(SdpKind::Answer) })
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.link.lock();
                if state.closed {
                    return Err(TransportError::ConnectionClosed);
                }
                let side = &mut state.sides[self.index];
                side.remote = Some(desc);
                side.remote_descriptions_applied += 1;
            }
            self.try_connect();
            Ok(())
        })
    }

    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.link.lock();
                let side = &mut state.sides[self.index];
                if side.remote.is_none() {
                    return Err(TransportError::ConnectionFailed(
                        "remote description not set".into(),
                    ));
                }
                side.remote_candidates.push(candidate);
            }
            self.try_connect();
            Ok(())
        })
    }

    fn create_data_channel(
        &self,
        label: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn DataChannel>, TransportError>> {
        let label = label.to_string();
        Box::pin(async move {
            let mut state = self.link.lock();
            if state.closed {
                return Err(TransportError::ConnectionClosed);
            }
            if state.channel.is_some() {
                return Err(TransportError::ConnectionFailed(
                    "loopback link carries a single channel".into(),
                ));
            }
            let (own, other) = LoopbackChannel::pair(&label, self.link.options);
            state.channel = Some((self.index, own.clone(), other));
            state.sides[self.index].channels_created += 1;
            let own: Arc<dyn DataChannel> = own;
            Ok(own)
        })
    }

    fn subscribe(&self, handler: ConnectionEventHandler) {
        self.link.events[self.index].subscribe(handler);
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let channel = {
                let mut state = self.link.lock();
                if state.closed {
                    return;
                }
                state.closed = true;
                state.channel.as_ref().map(|(_, own, _)| own.clone())
            };
            if let Some(channel) = channel {
                channel.close().await;
            }
            for events in &self.link.events {
                events.dispatch(ConnectionEvent::StateChanged(ConnectionState::Closed));
            }
        })
    }
}
