//! Сборка файлов из потока кадров. Автомат ничего не ждёт и не пишет сам:
//! на каждый кадр он возвращает список шагов, которые выполняет вызывающий.
//!
//! Пока решение о хранилище не принято, байты файла копятся в очереди,
//! чтобы потом воспроизвести их в выбранный приёмник в том же порядке.
//! Решения запрашиваются строго по одному, в порядке прихода файлов:
//! файл, получивший end раньше решения, ждёт его и не мешает следующему.

use crate::error::ProtocolError;
use crate::peer::types::Frame;
use crate::transfer::frame::ControlMessage;
use crate::transfer::{FileMeta, TransferProgress};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Disk,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Уже записан приёмником
    Disk(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub meta: FileMeta,
    /// Сколько байтов реально пришло; с `meta.size` не сверяется
    pub size: u64,
    pub content: FileContent,
}

/// `index` - порядковый номер файла в сессии, тот же, что в `TransferProgress`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Запросить приёмник и потом вызвать `on_storage` с тем же индексом
    AcquireStorage { index: usize, meta: FileMeta },
    WriteToDisk { index: usize, chunk: Bytes },
    Progress(TransferProgress),
    /// Закрыть постоянный приёмник и считать файл принятым
    FinishDisk {
        index: usize,
        meta: FileMeta,
        size: u64,
    },
    Completed(CompletedFile),
    /// `name == None`: кадр отброшен, ни один файл не пострадал
    Aborted {
        name: Option<String>,
        error: ProtocolError,
    },
}

/// Файл, для которого ещё нет решения о хранилище
struct Incoming {
    index: usize,
    meta: FileMeta,
    buffered: Vec<Bytes>,
    received: u64,
    end_seen: bool,
}

enum Target {
    Disk,
    Memory(Vec<Bytes>),
}

enum Phase {
    Idle,
    Accumulating {
        index: usize,
        meta: FileMeta,
        target: Target,
        received: u64,
    },
    /// Файл прерван на приёме; его кадры до end поглощаются молча
    Discarding { index: usize },
}

pub struct Reassembler {
    /// Решение запрошено для первого; открытым может быть только последний.
    /// Пока очередь не пуста, фаза - `Idle`.
    waiting: VecDeque<Incoming>,
    phase: Phase,
    files_started: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            phase: Phase::Idle,
            files_started: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && matches!(self.phase, Phase::Idle)
    }

    /// Есть файлы без решения о хранилище
    pub fn is_pending(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn files_started(&self) -> usize {
        self.files_started
    }

    pub fn on_frame(&mut self, frame: Frame) -> Vec<Step> {
        match frame {
            Frame::Text(text) => match ControlMessage::decode(&text) {
                Ok(ControlMessage::Meta(meta)) => self.on_meta(meta),
                Ok(ControlMessage::End) => self.on_end(),
                Err(error) => vec![Step::Aborted { name: None, error }],
            },
            Frame::Binary(chunk) => self.on_binary(chunk),
        }
    }

    /// Решение о хранилище для файла `index`. Накопленные байты
    /// воспроизводятся в выбранный приёмник по порядку. Решение для
    /// прерванного файла игнорируется.
    pub fn on_storage(&mut self, index: usize, kind: SinkKind) -> Vec<Step> {
        if self.waiting.front().map(|f| f.index) != Some(index) {
            return Vec::new();
        }
        let Some(file) = self.waiting.pop_front() else {
            return Vec::new();
        };

        let mut steps = Vec::new();
        let target = match kind {
            SinkKind::Disk => {
                steps.extend(
                    file.buffered
                        .into_iter()
                        .map(|chunk| Step::WriteToDisk { index, chunk }),
                );
                Target::Disk
            }
            SinkKind::Memory => Target::Memory(file.buffered),
        };

        if file.end_seen {
            steps.push(finalize(index, file.meta, target, file.received));
            if let Some(next) = self.waiting.front() {
                steps.push(Step::AcquireStorage {
                    index: next.index,
                    meta: next.meta.clone(),
                });
            }
        } else {
            // открытый файл всегда последний в очереди
            self.phase = Phase::Accumulating {
                index,
                meta: file.meta,
                target,
                received: file.received,
            };
        }
        steps
    }

    /// Прерывает файл `index` после ошибки записи. Оставшиеся кадры
    /// файла до его end будут отброшены без отчётов.
    pub fn discard(&mut self, index: usize) {
        if matches!(self.phase, Phase::Accumulating { index: current, .. } if current == index) {
            self.phase = Phase::Discarding { index };
        }
    }

    /// Сбрасывает все незавершённые файлы (обрыв канала)
    pub fn abort(&mut self) -> Vec<FileMeta> {
        let mut dropped: Vec<FileMeta> = self.waiting.drain(..).map(|f| f.meta).collect();
        if let Phase::Accumulating { meta, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            dropped.insert(0, meta);
        }
        dropped
    }

    fn on_meta(&mut self, meta: FileMeta) -> Vec<Step> {
        let mut steps = Vec::new();
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Accumulating { meta: current, .. } => {
                steps.push(meta_while_accumulating(current, &meta));
            }
            Phase::Discarding { .. } | Phase::Idle => {}
        }
        if self.waiting.back().is_some_and(|f| !f.end_seen) {
            if let Some(open) = self.waiting.pop_back() {
                steps.push(meta_while_accumulating(open.meta, &meta));
            }
        }

        self.files_started += 1;
        let index = self.files_started;
        if self.waiting.is_empty() {
            steps.push(Step::AcquireStorage {
                index,
                meta: meta.clone(),
            });
        }
        steps.push(Step::Progress(progress_for(&meta, 0, index)));
        self.waiting.push_back(Incoming {
            index,
            meta,
            buffered: Vec::new(),
            received: 0,
            end_seen: false,
        });
        steps
    }

    fn on_end(&mut self) -> Vec<Step> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Accumulating {
                index,
                meta,
                target,
                received,
            } => return vec![finalize(index, meta, target, received)],
            Phase::Discarding { .. } => return Vec::new(),
            Phase::Idle => {}
        }
        match self.waiting.back_mut() {
            // завершение откладывается до решения о хранилище
            Some(open) if !open.end_seen => {
                open.end_seen = true;
                Vec::new()
            }
            _ => vec![Step::Aborted {
                name: None,
                error: ProtocolError::UnexpectedEnd,
            }],
        }
    }

    fn on_binary(&mut self, chunk: Bytes) -> Vec<Step> {
        let len = chunk.len() as u64;
        match &mut self.phase {
            Phase::Accumulating {
                index,
                meta,
                target,
                received,
            } => {
                *received += len;
                let progress = progress_for(meta, *received, *index);
                return match target {
                    Target::Disk => vec![
                        Step::WriteToDisk {
                            index: *index,
                            chunk,
                        },
                        Step::Progress(progress),
                    ],
                    Target::Memory(chunks) => {
                        chunks.push(chunk);
                        vec![Step::Progress(progress)]
                    }
                };
            }
            Phase::Discarding { .. } => return Vec::new(),
            Phase::Idle => {}
        }
        match self.waiting.back_mut() {
            Some(open) if !open.end_seen => {
                open.buffered.push(chunk);
                open.received += len;
                vec![Step::Progress(progress_for(
                    &open.meta,
                    open.received,
                    open.index,
                ))]
            }
            _ => vec![Step::Aborted {
                name: None,
                error: ProtocolError::UnexpectedBinary,
            }],
        }
    }
}

fn meta_while_accumulating(current: FileMeta, next: &FileMeta) -> Step {
    Step::Aborted {
        error: ProtocolError::MetaWhileAccumulating {
            current: current.name.clone(),
            next: next.name.clone(),
        },
        name: Some(current.name),
    }
}

fn progress_for(meta: &FileMeta, received: u64, file_index: usize) -> TransferProgress {
    TransferProgress {
        bytes_transferred: received,
        file_size: meta.size,
        file_index,
        total_files: None,
    }
}

fn finalize(index: usize, meta: FileMeta, target: Target, received: u64) -> Step {
    match target {
        Target::Disk => Step::FinishDisk {
            index,
            meta,
            size: received,
        },
        Target::Memory(chunks) => {
            let mut blob = BytesMut::with_capacity(received as usize);
            for chunk in chunks {
                blob.extend_from_slice(&chunk);
            }
            Step::Completed(CompletedFile {
                meta,
                size: received,
                content: FileContent::Memory(blob.freeze()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_frame(name: &str, size: u64) -> Frame {
        ControlMessage::Meta(FileMeta::new(name, size, "text/plain"))
            .encode()
            .unwrap()
    }

    fn end_frame() -> Frame {
        ControlMessage::End.encode().unwrap()
    }

    fn bin(data: &'static [u8]) -> Frame {
        Frame::Binary(Bytes::from_static(data))
    }

    fn completed(steps: &[Step]) -> Option<&CompletedFile> {
        steps.iter().find_map(|s| match s {
            Step::Completed(file) => Some(file),
            _ => None,
        })
    }

    fn acquired(steps: &[Step]) -> Option<(usize, &str)> {
        steps.iter().find_map(|s| match s {
            Step::AcquireStorage { index, meta } => Some((*index, meta.name.as_str())),
            _ => None,
        })
    }

    fn write(index: usize, data: &'static [u8]) -> Step {
        Step::WriteToDisk {
            index,
            chunk: Bytes::from_static(data),
        }
    }

    #[test]
    fn bytes_before_storage_decision_are_replayed_in_order() {
        let mut r = Reassembler::new();
        let steps = r.on_frame(meta_frame("a.txt", 6));
        assert_eq!(acquired(&steps), Some((1, "a.txt")));

        r.on_frame(bin(b"ab"));
        r.on_frame(bin(b"cd"));
        assert!(r.is_pending());

        let steps = r.on_storage(1, SinkKind::Disk);
        assert_eq!(steps, vec![write(1, b"ab"), write(1, b"cd")]);

        let steps = r.on_frame(bin(b"ef"));
        assert_eq!(steps[0], write(1, b"ef"));

        let steps = r.on_frame(end_frame());
        assert!(matches!(
            &steps[..],
            [Step::FinishDisk { index: 1, meta, size: 6 }] if meta.name == "a.txt"
        ));
        assert!(r.is_idle());
    }

    #[test]
    fn memory_fallback_concatenates_everything() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 6));
        r.on_frame(bin(b"ab"));
        assert!(r.on_storage(1, SinkKind::Memory).is_empty());
        r.on_frame(bin(b"cd"));
        r.on_frame(bin(b"ef"));

        let steps = r.on_frame(end_frame());
        let file = completed(&steps).unwrap();
        assert_eq!(file.size, 6);
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"abcdef")));
    }

    #[test]
    fn end_before_storage_decision_finishes_after_it() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 2));
        r.on_frame(bin(b"hi"));
        assert!(r.on_frame(end_frame()).is_empty());

        // после end байты уже не принимаются
        let steps = r.on_frame(bin(b"!!"));
        assert!(matches!(
            &steps[..],
            [Step::Aborted { name: None, error: ProtocolError::UnexpectedBinary }]
        ));

        let steps = r.on_storage(1, SinkKind::Memory);
        let file = completed(&steps).unwrap();
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"hi")));
        assert!(r.is_idle());
    }

    #[test]
    fn next_file_waits_for_the_previous_decision() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 2));
        r.on_frame(bin(b"hi"));
        r.on_frame(end_frame());

        // решение по a.txt ещё не пришло, b.txt встаёт в очередь
        let steps = r.on_frame(meta_frame("b.txt", 3));
        assert!(!steps.iter().any(|s| matches!(s, Step::Aborted { .. })));
        assert_eq!(acquired(&steps), None);
        r.on_frame(bin(b"abc"));
        assert!(r.on_frame(end_frame()).is_empty());

        let steps = r.on_storage(1, SinkKind::Memory);
        let file = completed(&steps).unwrap();
        assert_eq!(file.meta.name, "a.txt");
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"hi")));
        assert_eq!(acquired(&steps), Some((2, "b.txt")));

        let steps = r.on_storage(2, SinkKind::Disk);
        assert_eq!(steps[0], write(2, b"abc"));
        assert!(matches!(
            &steps[1],
            Step::FinishDisk { index: 2, meta, size: 3 } if meta.name == "b.txt"
        ));
        assert!(r.is_idle());
    }

    #[test]
    fn stale_decision_is_ignored() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 10));
        r.on_frame(bin(b"part"));
        // a.txt ещё открыт: новый meta прерывает его
        let steps = r.on_frame(meta_frame("b.txt", 2));
        assert!(matches!(&steps[0], Step::Aborted { name: Some(n), .. } if n == "a.txt"));
        assert_eq!(acquired(&steps), Some((2, "b.txt")));

        assert!(r.on_storage(1, SinkKind::Memory).is_empty());
        assert!(r.is_pending());
        r.on_frame(bin(b"ok"));
        r.on_frame(end_frame());
        let steps = r.on_storage(2, SinkKind::Memory);
        assert_eq!(completed(&steps).unwrap().meta.name, "b.txt");
    }

    #[test]
    fn discarded_file_swallows_its_remaining_frames() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.bin", 6));
        r.on_storage(1, SinkKind::Disk);
        r.on_frame(bin(b"ab"));

        r.discard(1);
        assert!(r.on_frame(bin(b"cd")).is_empty());
        assert!(r.on_frame(bin(b"ef")).is_empty());
        assert!(r.on_frame(end_frame()).is_empty());
        assert!(r.is_idle());

        // следующий файл принимается как обычно
        let steps = r.on_frame(meta_frame("b.txt", 1));
        assert_eq!(acquired(&steps), Some((2, "b.txt")));
    }

    #[test]
    fn stray_frames_are_reported_and_dropped() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.on_frame(bin(b"x")),
            vec![Step::Aborted {
                name: None,
                error: ProtocolError::UnexpectedBinary
            }]
        );
        assert_eq!(
            r.on_frame(end_frame()),
            vec![Step::Aborted {
                name: None,
                error: ProtocolError::UnexpectedEnd
            }]
        );
        assert!(r.is_idle());
        assert_eq!(r.files_started(), 0);
    }

    #[test]
    fn unknown_control_does_not_disturb_current_file() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 2));
        r.on_storage(1, SinkKind::Memory);
        r.on_frame(bin(b"h"));

        let steps = r.on_frame(Frame::Text(r#"{"type":"pause"}"#.into()));
        assert_eq!(
            steps,
            vec![Step::Aborted {
                name: None,
                error: ProtocolError::UnknownControl("pause".into())
            }]
        );

        r.on_frame(bin(b"i"));
        let steps = r.on_frame(end_frame());
        assert_eq!(
            completed(&steps).unwrap().content,
            FileContent::Memory(Bytes::from_static(b"hi"))
        );
    }

    #[test]
    fn second_meta_aborts_the_unfinished_file() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("first.txt", 10));
        r.on_storage(1, SinkKind::Memory);
        r.on_frame(bin(b"partial"));

        let steps = r.on_frame(meta_frame("second.txt", 2));
        assert_eq!(
            steps[0],
            Step::Aborted {
                name: Some("first.txt".into()),
                error: ProtocolError::MetaWhileAccumulating {
                    current: "first.txt".into(),
                    next: "second.txt".into(),
                },
            }
        );
        assert_eq!(acquired(&steps), Some((2, "second.txt")));
        assert_eq!(r.files_started(), 2);

        r.on_storage(2, SinkKind::Memory);
        r.on_frame(bin(b"ok"));
        let steps = r.on_frame(end_frame());
        let file = completed(&steps).unwrap();
        assert_eq!(file.meta.name, "second.txt");
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"ok")));
    }

    #[test]
    fn abort_drops_every_unfinished_file() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 1));
        r.on_frame(end_frame());
        r.on_frame(meta_frame("b.txt", 1));

        let names: Vec<_> = r.abort().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert!(r.is_idle());
    }

    #[test]
    fn progress_tracks_bytes_and_file_index() {
        let mut r = Reassembler::new();
        r.on_frame(meta_frame("a.txt", 4));
        r.on_storage(1, SinkKind::Memory);
        let steps = r.on_frame(bin(b"ab"));
        assert_eq!(
            steps,
            vec![Step::Progress(TransferProgress {
                bytes_transferred: 2,
                file_size: 4,
                file_index: 1,
                total_files: None,
            })]
        );
    }
}
