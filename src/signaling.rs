//! Согласование сессии через rendezvous-хранилище: offer/answer и
//! trickle-кандидаты, пока прямого канала ещё нет.

use crate::config::Config;
use crate::error::{Error, SignalingError, TransportError};
use crate::logger::{dump_candidate, log};
use crate::peer::channel::ChannelAdapter;
use crate::peer::transport::{ConnectionEvent, DataChannel, PeerConnection};
use crate::peer::types::{ConnectionState, IceCandidate};
use crate::rendezvous::{CandidateWatch, RendezvousClient, RoomWatch};
use crate::room::{normalize_room_code, Room, RoomManager};
use crate::session::Role;
use crate::utils::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct Negotiator {
    client: RendezvousClient,
    rooms: RoomManager,
    channel_label: String,
    high_watermark: usize,
    low_watermark: usize,
    handshake_timeout: Option<Duration>,
}

impl Negotiator {
    pub fn new(client: RendezvousClient, config: &Config) -> Self {
        Self {
            client,
            rooms: RoomManager::new(config.room_ttl),
            channel_label: config.channel_label.clone(),
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            handshake_timeout: config.handshake_timeout,
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// A-сторона: выдаём код, создаём канал и offer, пишем комнату
    pub async fn initiate(&self, pc: Arc<dyn PeerConnection>) -> Result<Handshake, Error> {
        let code = self.rooms.issue_code();
        self.initiate_room(&code, pc).await
    }

    /// То же с уже выданным кодом. Комната, на которую уже ответили,
    /// не переиспользуется; на уникальность код не проверяется.
    pub async fn initiate_room(
        &self,
        code: &str,
        pc: Arc<dyn PeerConnection>,
    ) -> Result<Handshake, Error> {
        let code = normalize_room_code(code)?;
        if let Some(existing) = self.client.get_room(&code).await? {
            if existing.answer.is_some() {
                return Err(SignalingError::RoomAlreadyAnswered(code).into());
            }
        }
        let events = subscribe_events(pc.as_ref());

        let channel = pc.create_data_channel(&self.channel_label).await?;
        let offer = pc.create_offer().await?;
        self.client.create_room(&code, &offer, now_ms()).await?;

        let room_watch = self.client.watch_room(&code).await?;
        let candidates = self
            .client
            .watch_candidates(&code, Role::Responder)
            .await?;
        log(&format!("Room {code} is waiting for a responder"));

        Ok(self.handshake(
            Role::Initiator,
            code,
            pc,
            events,
            Some(channel),
            Some(room_watch),
            candidates,
            false,
        ))
    }

    /// B-сторона: читаем комнату, проверяем TTL, отвечаем на offer.
    /// Offer не применяется, если комната не найдена, истекла или уже
    /// получила answer.
    pub async fn join(
        &self,
        entered_code: &str,
        pc: Arc<dyn PeerConnection>,
    ) -> Result<Handshake, Error> {
        let code = normalize_room_code(entered_code)?;
        let room = self.lookup(&code).await?;
        let offer = room
            .offer
            .ok_or_else(|| SignalingError::MalformedRoom(code.clone()))?;

        let events = subscribe_events(pc.as_ref());
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer().await?;
        self.client.write_answer(&code, &answer).await?;

        let candidates = self
            .client
            .watch_candidates(&code, Role::Initiator)
            .await?;
        log(&format!("Answered room {code}"));

        Ok(self.handshake(
            Role::Responder,
            code,
            pc,
            events,
            None,
            None,
            candidates,
            true,
        ))
    }

    async fn lookup(&self, code: &str) -> Result<Room, SignalingError> {
        let room = self
            .client
            .get_room(code)
            .await?
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        self.rooms.check_join(&room, now_ms())?;
        if room.answer.is_some() {
            return Err(SignalingError::RoomAlreadyAnswered(code.to_string()));
        }
        Ok(room)
    }

    #[allow(clippy::too_many_arguments)]
    fn handshake(
        &self,
        role: Role,
        code: String,
        pc: Arc<dyn PeerConnection>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        channel: Option<Arc<dyn DataChannel>>,
        room_watch: Option<RoomWatch>,
        candidates: CandidateWatch,
        remote_applied: bool,
    ) -> Handshake {
        Handshake {
            role,
            code,
            pc,
            client: self.client.clone(),
            events,
            channel,
            room_watch,
            candidates: Some(candidates),
            remote_applied,
            pending_candidates: Vec::new(),
            high_watermark: self.high_watermark,
            low_watermark: self.low_watermark,
            timeout: self.handshake_timeout,
        }
    }
}

fn subscribe_events(pc: &dyn PeerConnection) -> mpsc::UnboundedReceiver<ConnectionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    pc.subscribe(Arc::new(move |event| {
        let _ = tx.send(event);
    }));
    rx
}

/// Рукопожатие в процессе: комната записана, ждём открытия канала
pub struct Handshake {
    role: Role,
    code: String,
    pc: Arc<dyn PeerConnection>,
    client: RendezvousClient,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    channel: Option<Arc<dyn DataChannel>>,
    room_watch: Option<RoomWatch>,
    candidates: Option<CandidateWatch>,
    remote_applied: bool,
    /// Кандидаты, полученные до установки remote description
    pending_candidates: Vec<IceCandidate>,
    high_watermark: usize,
    low_watermark: usize,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("code", &self.code)
            .field("remote_applied", &self.remote_applied)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room_code(&self) -> &str {
        &self.code
    }

    pub fn peer(&self) -> Arc<dyn PeerConnection> {
        self.pc.clone()
    }

    /// Ждёт открытия канала. При ошибке или таймауте соединение закрывается.
    pub async fn established(self) -> Result<ChannelAdapter, Error> {
        let pc = self.pc.clone();
        let code = self.code.clone();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run()).await {
                Ok(result) => result,
                Err(_) => {
                    log(&format!("Handshake for room {code} timed out after {limit:?}"));
                    Err(SignalingError::HandshakeTimeout(limit).into())
                }
            },
            None => self.run().await,
        };
        if let Err(e) = &result {
            log(&format!("Handshake for room {code} failed: {e}"));
            pc.close().await;
        }
        result
    }

    async fn run(mut self) -> Result<ChannelAdapter, Error> {
        let mut adapter = match self.channel.take() {
            Some(dc) => Some(self.attach(dc).await),
            None => None,
        };

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ConnectionEvent::LocalCandidate(candidate)) => {
                        self.client
                            .append_candidate(&self.code, self.role, &candidate)
                            .await?;
                    }
                    Some(ConnectionEvent::DataChannel(dc)) => {
                        if adapter.is_none() {
                            adapter = Some(self.attach(dc).await);
                        } else {
                            log(&format!("Ignoring extra data channel '{}'", dc.label()));
                        }
                    }
                    Some(ConnectionEvent::StateChanged(ConnectionState::Failed)) => {
                        return Err(TransportError::ConnectionFailed(
                            "peer connection failed during handshake".into(),
                        )
                        .into());
                    }
                    Some(ConnectionEvent::StateChanged(ConnectionState::Closed)) | None => {
                        return Err(TransportError::ConnectionClosed.into());
                    }
                    Some(ConnectionEvent::StateChanged(state)) => {
                        log(&format!("Handshake for room {}: connection {:?}", self.code, state));
                    }
                },
                room = next_room(&mut self.room_watch) => match room {
                    Some(room) => self.on_room_snapshot(room).await?,
                    None => self.room_watch = None,
                },
                candidate = next_candidate(&mut self.candidates) => match candidate {
                    Some(candidate) => self.on_remote_candidate(candidate).await,
                    None => self.candidates = None,
                },
                opened = wait_opened(&mut adapter) => {
                    opened?;
                    log(&format!("Room {} connected as {:?}", self.code, self.role));
                    return adapter.ok_or_else(|| TransportError::ConnectionClosed.into());
                }
            }
        }
    }

    async fn attach(&self, dc: Arc<dyn DataChannel>) -> ChannelAdapter {
        ChannelAdapter::attach(dc, self.high_watermark, self.low_watermark).await
    }

    /// Ответ применяется ровно один раз, повторные снимки игнорируются
    async fn on_room_snapshot(&mut self, room: Room) -> Result<(), Error> {
        let Some(answer) = room.answer else {
            return Ok(());
        };
        if self.remote_applied {
            return Ok(());
        }
        self.remote_applied = true;
        log(&format!("Applying answer from room {}", self.code));
        self.pc.set_remote_description(answer).await?;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            log("Applying pending candidate");
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        dump_candidate("REMOTE", &candidate);
        if self.remote_applied {
            self.apply_candidate(candidate).await;
        } else {
            log("Remote description not set yet, queuing candidate");
            self.pending_candidates.push(candidate);
        }
    }

    // один плохой кандидат не должен ронять рукопожатие
    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            log(&format!("Failed to add ICE candidate: {e}"));
        }
    }
}

async fn next_room(watch: &mut Option<RoomWatch>) -> Option<Room> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn next_candidate(watch: &mut Option<CandidateWatch>) -> Option<IceCandidate> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_opened(adapter: &mut Option<ChannelAdapter>) -> Result<(), TransportError> {
    match adapter {
        Some(adapter) => adapter.wait_open().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::{LoopbackOptions, LoopbackPeer};
    use crate::peer::types::SessionDescription;
    use crate::rendezvous::{MemoryStore, RendezvousStore};
    use serde_json::json;

    fn setup(config: &Config) -> (Arc<MemoryStore>, Negotiator) {
        let store = Arc::new(MemoryStore::new());
        let negotiator = Negotiator::new(RendezvousClient::new(store.clone()), config);
        (store, negotiator)
    }

    #[tokio::test]
    async fn initiator_and_responder_open_a_channel() {
        let (store, negotiator) = setup(&Config::default());
        let (a, b) = LoopbackPeer::pair(LoopbackOptions::default());

        let offering = negotiator.initiate(a.clone()).await.unwrap();
        let code = offering.room_code().to_string();
        assert_eq!(store.document_count(), 1);

        let answering = negotiator.join(&code.to_lowercase(), b.clone()).await.unwrap();
        let (left, right) = tokio::join!(offering.established(), answering.established());
        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(left.label(), "fileTransfer");
        assert_eq!(right.label(), "fileTransfer");

        assert_eq!(a.remote_descriptions_applied(), 1);
        assert_eq!(b.remote_descriptions_applied(), 1);
        assert!(!a.remote_candidates().is_empty());
        assert!(!b.remote_candidates().is_empty());
        // записи комнаты не удаляются после соединения
        assert_eq!(store.document_count(), 1);
    }

    #[tokio::test]
    async fn answer_is_applied_once_despite_repeated_snapshots() {
        let (store, negotiator) = setup(&Config::default());
        let (a, b) = LoopbackPeer::pair(LoopbackOptions::default());
        let offering = negotiator.initiate(a.clone()).await.unwrap();
        let code = offering.room_code().to_string();
        let answering = negotiator.join(&code, b).await.unwrap();

        // лишние уведомления о том же документе
        let key = format!("rooms/{code}");
        store.update(&key, json!({"touched": 1})).await.unwrap();
        store.update(&key, json!({"touched": 2})).await.unwrap();

        let (left, right) = tokio::join!(offering.established(), answering.established());
        left.unwrap();
        right.unwrap();
        assert_eq!(a.remote_descriptions_applied(), 1);
    }

    #[tokio::test]
    async fn joining_unknown_room_fails_without_touching_the_peer() {
        let (_store, negotiator) = setup(&Config::default());
        let (_a, b) = LoopbackPeer::pair(LoopbackOptions::default());
        let err = negotiator.join("ZZZZZZ", b.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::RoomNotFound(ref code)) if code == "ZZZZZZ"
        ));
        assert_eq!(b.remote_descriptions_applied(), 0);
        assert_eq!(b.channels_created(), 0);
    }

    #[tokio::test]
    async fn joining_expired_room_never_applies_the_offer() {
        let (store, negotiator) = setup(&Config::default());
        let stale = now_ms() - 25 * 60 * 60 * 1000;
        RendezvousClient::new(store.clone())
            .create_room("OLD123", &SessionDescription::offer("v=0"), stale)
            .await
            .unwrap();

        let (_a, b) = LoopbackPeer::pair(LoopbackOptions::default());
        let err = negotiator.join("OLD123", b.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::RoomExpired(_))
        ));
        assert_eq!(b.remote_descriptions_applied(), 0);
    }

    #[tokio::test]
    async fn invalid_code_is_rejected_before_lookup() {
        let (_store, negotiator) = setup(&Config::default());
        let (_a, b) = LoopbackPeer::pair(LoopbackOptions::default());
        let err = negotiator.join("AB1", b).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::InvalidRoomCode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_room_times_out() {
        let config = Config {
            handshake_timeout: Some(Duration::from_secs(5)),
            ..Config::default()
        };
        let (_store, negotiator) = setup(&config);
        let (a, _b) = LoopbackPeer::pair(LoopbackOptions::default());
        let offering = negotiator.initiate(a).await.unwrap();

        let err = offering.established().await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::HandshakeTimeout(d)) if d == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn transport_failure_during_handshake_is_reported() {
        let (_store, negotiator) = setup(&Config::default());
        let (a, _b) = LoopbackPeer::pair(LoopbackOptions::default());
        let offering = negotiator.initiate(a.clone()).await.unwrap();
        a.fail("ice failed");

        let err = offering.established().await.err().unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn second_responder_is_turned_away() {
        let (store, negotiator) = setup(&Config::default());
        let (a, b) = LoopbackPeer::pair(LoopbackOptions::default());
        let offering = negotiator.initiate(a).await.unwrap();
        let code = offering.room_code().to_string();
        let _answering = negotiator.join(&code, b).await.unwrap();

        let client = RendezvousClient::new(store.clone());
        let first = client.get_room(&code).await.unwrap().unwrap().answer;
        assert!(first.is_some());

        let (_c, d) = LoopbackPeer::pair(LoopbackOptions::default());
        let err = negotiator.join(&code, d.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::RoomAlreadyAnswered(ref c)) if *c == code
        ));
        assert_eq!(d.remote_descriptions_applied(), 0);
        assert_eq!(client.get_room(&code).await.unwrap().unwrap().answer, first);
    }

    #[tokio::test]
    async fn answered_code_is_not_reused_by_an_initiator() {
        let (store, negotiator) = setup(&Config::default());
        let client = RendezvousClient::new(store.clone());
        client
            .create_room("TAKEN1", &SessionDescription::offer("o"), now_ms())
            .await
            .unwrap();
        client
            .write_answer("TAKEN1", &SessionDescription::answer("a"))
            .await
            .unwrap();

        let (a, _b) = LoopbackPeer::pair(LoopbackOptions::default());
        let err = negotiator.initiate_room("TAKEN1", a.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::RoomAlreadyAnswered(_))
        ));
        assert_eq!(a.channels_created(), 0);
        let room = client.get_room("TAKEN1").await.unwrap().unwrap();
        assert_eq!(room.offer, Some(SessionDescription::offer("o")));
        assert_eq!(room.answer, Some(SessionDescription::answer("a")));
    }
}
