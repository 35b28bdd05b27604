use crate::commands::BridgePeer;
use crate::error::{Error, Result, TransportError};
use crate::logger::log;
use crate::peer::transport::PeerConnection;
use crate::room::normalize_room_code;
use crate::session::{Role, SessionEvent};
use crate::signaling::Handshake;
use crate::transfer::{DirectoryExporter, ReceiveUpdate, ReceivedFileEntry, Receiver, Retriever};
use crate::utils::lock;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

impl BridgePeer {
    /// B-сторона: подключение к комнате по введённому коду
    pub async fn join_room(&self, code: &str, pc: Arc<dyn PeerConnection>) -> Result<Handshake> {
        self.replace_peer(Some(pc.clone())).await;
        let shown = normalize_room_code(code).unwrap_or_else(|_| code.trim().to_string());
        self.cell.begin(Role::Responder, &shown);
        self.cell.apply(SessionEvent::HandshakeStarted)?;

        match self.negotiator.join(code, pc).await {
            Ok(handshake) => Ok(handshake),
            Err(e) => {
                self.cell.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Принимает файлы, пока канал открыт. Всегда завершается ошибкой
    /// транспорта: при закрытии канала или его обрыве.
    pub async fn receive(&self) -> Result<()> {
        let channel = self
            .channel
            .lock()
            .await
            .take()
            .ok_or(TransportError::ConnectionClosed)?;
        let mut receiver = Receiver::new(channel, self.storage.clone());
        log("Receiving files");

        loop {
            let update = match receiver.next().await {
                Ok(update) => update,
                Err(e) => {
                    self.cell.fail(&e.to_string());
                    return Err(e.into());
                }
            };
            match update {
                ReceiveUpdate::FileStarted(_) => self.cell.apply_logged(SessionEvent::FileStarted),
                ReceiveUpdate::Progress(progress) => self.emitter().emit_progress(progress),
                ReceiveUpdate::FileCompleted(file) => {
                    let entry = lock(&self.queue).push(file);
                    self.cell.apply_logged(SessionEvent::FileFinished);
                    self.emitter().emit_file_received(&entry);
                }
                ReceiveUpdate::FileAborted { name, reason } => {
                    self.emitter().emit_file_aborted(name.as_deref(), &reason);
                    if name.is_some() {
                        self.cell.apply_logged(SessionEvent::FileAborted);
                    }
                }
            }
        }
    }

    /// Принятые файлы в порядке приёма
    pub fn received_files(&self) -> Vec<ReceivedFileEntry> {
        lock(&self.queue).entries().to_vec()
    }

    pub fn blob(&self, reference: &str) -> Option<Bytes> {
        lock(&self.queue).blob(reference)
    }

    /// Выгружает все файлы из памяти, соблюдая паузу между выгрузками
    pub async fn download_all(&self, retriever: &dyn Retriever) -> Result<Vec<PathBuf>> {
        // снимок, чтобы не держать замок на время пауз
        let snapshot = lock(&self.queue).clone();
        snapshot
            .retrieve_all(retriever, self.config.retrieval_delay)
            .await
            .map_err(Error::from)
    }

    pub async fn download_all_to(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let exporter = DirectoryExporter::new(dir.as_ref());
        self.download_all(&exporter).await
    }

    /// Очищает очередь и освобождает содержимое в памяти; повторный вызов безопасен
    pub fn clear_queue(&self) {
        lock(&self.queue).clear();
    }

    pub fn retained_blobs(&self) -> usize {
        lock(&self.queue).retained_blobs()
    }
}
