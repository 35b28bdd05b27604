//! Выбор хранилища для входящего файла. Постоянный приёмник может
//! отсутствовать или быть отклонён, тогда файл копится в памяти.

use crate::error::StorageError;
use crate::logger::log;
use crate::transfer::FileMeta;
use crate::utils::BoxFuture;
use bytes::Bytes;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Disk,
    Memory,
}

/// Открытый постоянный приёмник одного файла
pub trait FileSink: Send {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Закрывает приёмник; данные уже лежат на месте, возвращается путь
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<PathBuf, StorageError>>;
}

pub enum SinkAcquisition {
    Available(Box<dyn FileSink>),
    Unavailable(StorageError),
}

impl std::fmt::Debug for SinkAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkAcquisition::Available(_) => f.write_str("Available(..)"),
            SinkAcquisition::Unavailable(e) => write!(f, "Unavailable({e:?})"),
        }
    }
}

/// Источник постоянных приёмников; решение принимается раз на файл
/// и может прийти позже первых байтов
pub trait StorageProvider: Send + Sync {
    fn acquire(&self, meta: &FileMeta) -> BoxFuture<'static, SinkAcquisition>;
}

/// Пишет файлы в каталог
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl StorageProvider for DirectoryStorage {
    fn acquire(&self, meta: &FileMeta) -> BoxFuture<'static, SinkAcquisition> {
        let dir = self.dir.clone();
        let name = meta.name.clone();
        Box::pin(async move {
            match create_unique(&dir, &name).await {
                Ok((file, path)) => {
                    log(&format!("Writing {name} to {}", path.display()));
                    SinkAcquisition::Available(Box::new(DiskSink::new(file, path)))
                }
                Err(e) => {
                    log(&format!("Disk sink for {name} unavailable: {e}"));
                    SinkAcquisition::Unavailable(e)
                }
            }
        })
    }
}

/// Всегда отказывает: все файлы собираются в памяти
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOnlyStorage;

impl StorageProvider for MemoryOnlyStorage {
    fn acquire(&self, _meta: &FileMeta) -> BoxFuture<'static, SinkAcquisition> {
        Box::pin(async { SinkAcquisition::Unavailable(StorageError::Unavailable) })
    }
}

/// Недописанный файл удаляется, если приёмник брошен без `close`
struct DiskSink {
    file: Option<File>,
    path: PathBuf,
    closed: bool,
}

impl DiskSink {
    fn new(file: File, path: PathBuf) -> Self {
        Self {
            file: Some(file),
            path,
            closed: false,
        }
    }
}

impl FileSink for DiskSink {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let file = self.file.as_mut().ok_or(StorageError::Unavailable)?;
            file.write_all(&chunk).await?;
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<PathBuf, StorageError>> {
        Box::pin(async move {
            let mut sink = *self;
            let mut file = sink.file.take().ok_or(StorageError::Unavailable)?;
            file.flush().await?;
            file.sync_all().await?;
            sink.closed = true;
            Ok(sink.path.clone())
        })
    }
}

impl Drop for DiskSink {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        drop(self.file.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => log(&format!("Removed partial file {}", self.path.display())),
            Err(e) => log(&format!(
                "Failed to remove partial file {}: {e}",
                self.path.display()
            )),
        }
    }
}

/// Имя от удалённой стороны не должно выводить за пределы каталога
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

fn numbered(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

/// Создаёт новый файл в `dir`, не перезаписывая существующие:
/// `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`...
pub(crate) async fn create_unique(dir: &Path, name: &str) -> Result<(File, PathBuf), StorageError> {
    tokio::fs::create_dir_all(dir).await?;
    let base = sanitize_file_name(name);
    let mut candidate = base.clone();
    let mut n = 0;
    loop {
        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                n += 1;
                candidate = numbered(&base, n);
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(StorageError::Denied(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
    }
}
