//! Внешние операции пира: создать комнату, подключиться, отправить,
//! принять, выгрузить, очистить, сбросить. Состояние принадлежит
//! экземпляру `BridgePeer`, глобальных переменных нет.

pub mod receive_api;
pub mod send_api;
pub mod util_api;

use crate::config::Config;
use crate::error::{ConfigError, InvalidTransition};
use crate::logger::{log, Emitter};
use crate::peer::channel::ChannelAdapter;
use crate::peer::transport::PeerConnection;
use crate::rendezvous::{RendezvousClient, RendezvousStore};
use crate::session::{Role, Session, SessionEvent, Transition};
use crate::signaling::Negotiator;
use crate::transfer::{ReceivedQueue, StorageProvider};
use crate::utils::lock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Сессия, разделяемая с обработчиками событий соединения
pub(crate) struct SessionCell {
    session: Mutex<Option<Session>>,
    /// Растёт с каждой новой сессией; события старых соединений отбрасываются
    generation: AtomicU64,
    emitter: Emitter,
}

impl SessionCell {
    fn begin(&self, role: Role, room_code: &str) {
        log(&format!("New {:?} session for room {room_code}", role));
        let mut guard = lock(&self.session);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *guard = Some(Session::new(role, room_code));
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn end(&self) -> Option<Session> {
        lock(&self.session).take()
    }

    /// Применяет событие и сообщает о переходе наружу
    fn apply(&self, event: SessionEvent) -> Result<Option<Transition>, InvalidTransition> {
        let (role, result) = {
            let mut guard = lock(&self.session);
            let Some(session) = guard.as_mut() else {
                return Ok(None);
            };
            (session.role(), session.handle(event))
        };
        if let Ok(Some(transition)) = &result {
            self.emitter.emit_state(role, *transition);
        }
        result
    }

    /// Для событий, которые приходят из фоновых обработчиков
    fn apply_logged(&self, event: SessionEvent) {
        if let Err(e) = self.apply(event) {
            log(&format!("Session event ignored: {e}"));
        }
    }

    fn fail_generation(&self, generation: u64, reason: &str) {
        if self.generation() == generation {
            self.fail(reason);
        }
    }

    fn fail(&self, reason: &str) {
        if matches!(self.apply(SessionEvent::Failed), Ok(Some(_))) {
            self.emitter.emit_error(reason);
        }
    }
}

pub struct BridgePeer {
    config: Config,
    negotiator: Negotiator,
    storage: Arc<dyn StorageProvider>,
    cell: Arc<SessionCell>,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    channel: tokio::sync::Mutex<Option<ChannelAdapter>>,
    queue: Mutex<ReceivedQueue>,
}

impl BridgePeer {
    pub fn new(
        config: Config,
        store: Arc<dyn RendezvousStore>,
        storage: Arc<dyn StorageProvider>,
        emitter: Emitter,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let negotiator = Negotiator::new(RendezvousClient::new(store), &config);
        Ok(Self {
            config,
            negotiator,
            storage,
            cell: Arc::new(SessionCell {
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                emitter,
            }),
            peer: Mutex::new(None),
            channel: tokio::sync::Mutex::new(None),
            queue: Mutex::new(ReceivedQueue::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emitter(&self) -> &Emitter {
        &self.cell.emitter
    }
}
