use crate::error::StorageError;
use crate::logger::log;
use crate::transfer::reassembly::{CompletedFile, FileContent};
use crate::transfer::storage::{create_unique, StorageKind};
use crate::utils::{random_id, BoxFuture};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FileReference {
    /// Файл уже записан, получать нечего
    Disk { path: PathBuf },
    /// Ссылка на содержимое в памяти очереди
    Memory { blob: String },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFileEntry {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub reference: FileReference,
}

impl ReceivedFileEntry {
    pub fn storage_kind(&self) -> StorageKind {
        match self.reference {
            FileReference::Disk { .. } => StorageKind::Disk,
            FileReference::Memory { .. } => StorageKind::Memory,
        }
    }
}

/// Выгрузка файла из памяти наружу (в каталог, в браузер и т.п.)
pub trait Retriever: Send + Sync {
    fn retrieve<'a>(
        &'a self,
        entry: &'a ReceivedFileEntry,
        content: Bytes,
    ) -> BoxFuture<'a, Result<PathBuf, StorageError>>;
}

/// Очередь принятых файлов сессии в порядке приёма.
/// Записи удаляются только через `clear`.
#[derive(Debug, Clone, Default)]
pub struct ReceivedQueue {
    entries: Vec<ReceivedFileEntry>,
    blobs: HashMap<String, Bytes>,
}

impl ReceivedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, file: CompletedFile) -> ReceivedFileEntry {
        let reference = match file.content {
            FileContent::Disk(path) => FileReference::Disk { path },
            FileContent::Memory(content) => {
                let blob = format!("blob:{}", random_id());
                self.blobs.insert(blob.clone(), content);
                FileReference::Memory { blob }
            }
        };
        let entry = ReceivedFileEntry {
            name: file.meta.name,
            mime: file.meta.mime,
            size: file.size,
            reference,
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> &[ReceivedFileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn blob(&self, reference: &str) -> Option<Bytes> {
        self.blobs.get(reference).cloned()
    }

    /// Сколько содержимого в памяти ещё удерживается
    pub fn retained_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Освобождает содержимое и очищает очередь; повторный вызов ничего не делает
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log(&format!(
                "Clearing {} received files ({} in memory)",
                self.entries.len(),
                self.blobs.len()
            ));
        }
        self.entries.clear();
        self.blobs.clear();
    }

    /// Выгружает все файлы из памяти по очереди с паузой между вызовами.
    /// Записанные на диск файлы пропускаются.
    pub async fn retrieve_all(
        &self,
        retriever: &dyn Retriever,
        delay: Duration,
    ) -> Result<Vec<PathBuf>, StorageError> {
        let mut retrieved = Vec::new();
        for entry in &self.entries {
            let FileReference::Memory { blob } = &entry.reference else {
                continue;
            };
            let Some(content) = self.blob(blob) else {
                log(&format!("Blob for {} already released", entry.name));
                continue;
            };
            if !retrieved.is_empty() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retrieved.push(retriever.retrieve(entry, content).await?);
        }
        Ok(retrieved)
    }
}

/// Сохраняет файлы из памяти в каталог
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Retriever for DirectoryExporter {
    fn retrieve<'a>(
        &'a self,
        entry: &'a ReceivedFileEntry,
        content: Bytes,
    ) -> BoxFuture<'a, Result<PathBuf, StorageError>> {
        Box::pin(async move {
            let (mut file, path) = create_unique(&self.dir, &entry.name).await?;
            file.write_all(&content).await?;
            file.flush().await?;
            log(&format!("Exported {} to {}", entry.name, path.display()));
            Ok(path)
        })
    }
}
