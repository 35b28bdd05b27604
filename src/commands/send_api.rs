use crate::commands::BridgePeer;
use crate::error::{Result, TransportError};
use crate::logger::log;
use crate::peer::transport::PeerConnection;
use crate::session::{Role, SessionEvent};
use crate::signaling::Handshake;
use crate::transfer::{ChunkedSender, OutgoingFile, SendUpdate};
use std::sync::Arc;

impl BridgePeer {
    /// A-сторона: новая комната со свежим кодом
    pub async fn create_room(&self, pc: Arc<dyn PeerConnection>) -> Result<Handshake> {
        let code = self.negotiator.rooms().issue_code();
        self.open_room(&code, pc).await
    }

    /// A-сторона с заранее выданным кодом
    pub async fn open_room(&self, code: &str, pc: Arc<dyn PeerConnection>) -> Result<Handshake> {
        self.replace_peer(Some(pc.clone())).await;
        self.cell.begin(Role::Initiator, code);
        self.cell.apply(SessionEvent::HandshakeStarted)?;

        match self.negotiator.initiate_room(code, pc).await {
            Ok(handshake) => {
                self.emitter().emit_room_created(handshake.room_code());
                Ok(handshake)
            }
            Err(e) => {
                self.cell.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Отправляет пачку файлов по открытому каналу.
    /// Возвращает число отправленных файлов.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<usize> {
        let guard = self.channel.lock().await;
        let Some(channel) = guard.as_ref() else {
            log("send_files called without an open channel");
            return Err(TransportError::ConnectionClosed.into());
        };

        let cell = &self.cell;
        let emitter = self.emitter();
        let sender = ChunkedSender::from_config(channel, &self.config);
        let result = sender
            .send_batch(files, |update| match update {
                SendUpdate::FileStarted { .. } => cell.apply_logged(SessionEvent::FileStarted),
                SendUpdate::Progress(progress) => emitter.emit_progress(progress),
                SendUpdate::FileSent { meta, .. } => {
                    cell.apply_logged(SessionEvent::FileFinished);
                    emitter.emit_file_sent(&meta.name);
                }
            })
            .await;

        match result {
            Ok(sent) => {
                self.cell.apply(SessionEvent::BatchFinished)?;
                Ok(sent)
            }
            Err(e) if e.is_terminal() => {
                self.cell.fail(&e.to_string());
                Err(e)
            }
            Err(e) => {
                // ошибка чтения: канал жив, но пачка прервана
                emitter.emit_file_aborted(None, &e.to_string());
                self.cell.apply_logged(SessionEvent::FileAborted);
                Err(e)
            }
        }
    }
}
