use crate::error::{StorageError, TransportError};
use crate::logger::log;
use crate::peer::channel::ChannelAdapter;
use crate::peer::transport::ChannelEvent;
use crate::transfer::reassembly::{CompletedFile, FileContent, Reassembler, SinkKind, Step};
use crate::transfer::storage::{FileSink, SinkAcquisition, StorageProvider};
use crate::transfer::{FileMeta, TransferProgress};
use crate::utils::BoxFuture;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveUpdate {
    FileStarted(FileMeta),
    Progress(TransferProgress),
    FileCompleted(CompletedFile),
    /// `name == None`: отброшен кадр вне файла
    FileAborted { name: Option<String>, reason: String },
}

/// Запрос приёмника для файла `index`
struct Acquisition {
    index: usize,
    name: String,
    decision: BoxFuture<'static, SinkAcquisition>,
}

/// Открытый постоянный приёмник файла `index`
struct DiskTarget {
    index: usize,
    name: String,
    sink: Box<dyn FileSink>,
}

/// Принимающая сторона: читает кадры из канала, запрашивает хранилище
/// и исполняет шаги сборщика
pub struct Receiver {
    channel: ChannelAdapter,
    storage: Arc<dyn StorageProvider>,
    reassembler: Reassembler,
    sink: Option<DiskTarget>,
    acquisition: Option<Acquisition>,
    updates: VecDeque<ReceiveUpdate>,
}

impl Receiver {
    pub fn new(channel: ChannelAdapter, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            channel,
            storage,
            reassembler: Reassembler::new(),
            sink: None,
            acquisition: None,
            updates: VecDeque::new(),
        }
    }

    /// Следующее событие приёма. Ошибка означает, что канал закрыт
    /// или оборвался; незавершённые файлы при этом прерываются.
    pub async fn next(&mut self) -> Result<ReceiveUpdate, TransportError> {
        loop {
            if let Some(update) = self.updates.pop_front() {
                return Ok(update);
            }

            let acquisition = &mut self.acquisition;
            let channel = &mut self.channel;
            tokio::select! {
                decision = async {
                    match acquisition.as_mut() {
                        Some(pending) => pending.decision.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(pending) = self.acquisition.take() {
                        self.on_decision(pending.index, pending.name, decision).await;
                    }
                }
                event = channel.next_event() => match event {
                    Some(ChannelEvent::Message(frame)) => {
                        let steps = self.reassembler.on_frame(frame);
                        self.execute(steps).await;
                    }
                    Some(ChannelEvent::Failed(reason)) => {
                        return Err(self.shutdown(TransportError::ConnectionFailed(reason)));
                    }
                    Some(ChannelEvent::Closed) | None => {
                        return Err(self.shutdown(TransportError::ConnectionClosed));
                    }
                    Some(other) => log(&format!("Receiver ignoring {:?}", other)),
                },
            }
        }
    }

    async fn on_decision(&mut self, index: usize, name: String, decision: SinkAcquisition) {
        let kind = match decision {
            SinkAcquisition::Available(sink) => {
                self.sink = Some(DiskTarget { index, name, sink });
                SinkKind::Disk
            }
            SinkAcquisition::Unavailable(e) => {
                log(&format!("Persistent sink for {name} unavailable ({e}), keeping file in memory"));
                SinkKind::Memory
            }
        };
        let steps = self.reassembler.on_storage(index, kind);
        self.execute(steps).await;
    }

    async fn execute(&mut self, steps: Vec<Step>) {
        // файл, запись которого сорвалась; его оставшиеся шаги пропускаются
        let mut failed: Option<usize> = None;
        for step in steps {
            match step {
                Step::AcquireStorage { index, meta } => {
                    self.acquisition = Some(Acquisition {
                        index,
                        name: meta.name.clone(),
                        decision: self.storage.acquire(&meta),
                    });
                    self.updates.push_back(ReceiveUpdate::FileStarted(meta));
                }
                Step::WriteToDisk { index, .. } | Step::FinishDisk { index, .. }
                    if failed == Some(index) => {}
                Step::Progress(progress) if failed == Some(progress.file_index) => {}
                Step::WriteToDisk { index, chunk } => {
                    if let Err(e) = self.write(index, chunk).await {
                        self.abort_disk_file(index, e);
                        failed = Some(index);
                    }
                }
                Step::Progress(progress) => {
                    self.updates.push_back(ReceiveUpdate::Progress(progress));
                }
                Step::FinishDisk { index, meta, size } => {
                    let target = match self.sink.take() {
                        Some(target) if target.index == index => target,
                        other => {
                            self.sink = other;
                            self.abort_file(Some(meta.name), StorageError::Unavailable.to_string());
                            continue;
                        }
                    };
                    match target.sink.close().await {
                        Ok(path) => {
                            self.updates.push_back(ReceiveUpdate::FileCompleted(CompletedFile {
                                meta,
                                size,
                                content: FileContent::Disk(path),
                            }));
                        }
                        Err(e) => self.abort_file(Some(meta.name), e.to_string()),
                    }
                }
                Step::Completed(file) => {
                    self.updates.push_back(ReceiveUpdate::FileCompleted(file));
                }
                Step::Aborted { name, error } => {
                    if name.is_some() {
                        // брошенный приёмник сам удаляет недописанный файл
                        self.sink = None;
                    }
                    self.abort_file(name, error.to_string());
                }
            }
        }
    }

    async fn write(&mut self, index: usize, chunk: Bytes) -> Result<(), StorageError> {
        match self.sink.as_mut() {
            Some(target) if target.index == index => target.sink.write(chunk).await,
            _ => Err(StorageError::Unavailable),
        }
    }

    fn abort_disk_file(&mut self, index: usize, error: StorageError) {
        let name = match self.sink.take() {
            Some(target) if target.index == index => Some(target.name),
            other => {
                self.sink = other;
                None
            }
        };
        self.reassembler.discard(index);
        self.abort_file(name, error.to_string());
    }

    fn abort_file(&mut self, name: Option<String>, reason: String) {
        log(&format!("Receive aborted for {:?}: {}", name, reason));
        self.updates
            .push_back(ReceiveUpdate::FileAborted { name, reason });
    }

    fn shutdown(&mut self, error: TransportError) -> TransportError {
        for meta in self.reassembler.abort() {
            log(&format!("Channel lost while receiving {}", meta.name));
        }
        self.sink = None;
        self.acquisition = None;
        error
    }
}
