use crate::peer::types::IceCandidate;
use crate::session::{Role, SessionState, Transition};
use crate::transfer::{ReceivedFileEntry, TransferProgress};
use serde::Serialize;
use tokio::sync::mpsc;

/// Логирование с временными метками
pub fn log(msg: &str) {
    // Проверяем конфигурацию логирования
    if crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING {
        let now = chrono::Local::now();
        println!("RUST: [{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), msg);
    }
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    log(&format!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    ));
}

/// Уведомления наружу (для интерфейса или вызывающего кода)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionUpdate {
    RoomCreated { code: String },
    StateChanged { role: Role, from: SessionState, to: SessionState },
    Progress(TransferProgress),
    FileSent { name: String },
    FileReceived(ReceivedFileEntry),
    FileAborted { name: Option<String>, reason: String },
    Error { reason: String },
}

/// Отправитель уведомлений; без подписчика только пишет в лог
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    tx: Option<mpsc::UnboundedSender<SessionUpdate>>,
}

impl Emitter {
    pub fn new(tx: mpsc::UnboundedSender<SessionUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn emit(&self, update: SessionUpdate) {
        if let Some(tx) = &self.tx {
            if tx.send(update).is_err() {
                log("Update receiver dropped, update discarded");
            }
        }
    }

    pub fn emit_room_created(&self, code: &str) {
        log(&format!("emit_room_created: {code}"));
        self.emit(SessionUpdate::RoomCreated { code: code.into() });
    }

    pub fn emit_state(&self, role: Role, transition: Transition) {
        log(&format!(
            "emit_state ({:?}): {:?} -> {:?}",
            role, transition.from, transition.to
        ));
        self.emit(SessionUpdate::StateChanged {
            role,
            from: transition.from,
            to: transition.to,
        });
    }

    // прогресс идёт на каждый фрейм, поэтому без записи в лог
    pub fn emit_progress(&self, progress: TransferProgress) {
        self.emit(SessionUpdate::Progress(progress));
    }

    pub fn emit_file_sent(&self, name: &str) {
        log(&format!("emit_file_sent: {name}"));
        self.emit(SessionUpdate::FileSent { name: name.into() });
    }

    pub fn emit_file_received(&self, entry: &ReceivedFileEntry) {
        log(&format!(
            "emit_file_received: {} ({} bytes, {:?})",
            entry.name,
            entry.size,
            entry.storage_kind()
        ));
        self.emit(SessionUpdate::FileReceived(entry.clone()));
    }

    pub fn emit_file_aborted(&self, name: Option<&str>, reason: &str) {
        log(&format!("emit_file_aborted: {:?}: {}", name, reason));
        self.emit(SessionUpdate::FileAborted {
            name: name.map(str::to_string),
            reason: reason.into(),
        });
    }

    pub fn emit_error(&self, reason: &str) {
        log(&format!("emit_error: {reason}"));
        self.emit(SessionUpdate::Error {
            reason: reason.into(),
        });
    }
}
