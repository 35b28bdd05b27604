//! Передача файлов по открытому каналу: кадры, отправитель, сборка на
//! стороне получателя и очередь принятых файлов.

pub mod frame;
pub mod queue;
pub mod reassembly;
pub mod receiver;
pub mod sender;
pub mod storage;

pub use frame::ControlMessage;
pub use queue::{DirectoryExporter, FileReference, ReceivedFileEntry, ReceivedQueue, Retriever};
pub use reassembly::{CompletedFile, FileContent, Reassembler, SinkKind, Step};
pub use receiver::{ReceiveUpdate, Receiver};
pub use sender::{ChunkedSender, OutgoingFile, SendUpdate};
pub use storage::{
    DirectoryStorage, FileSink, MemoryOnlyStorage, SinkAcquisition, StorageKind, StorageProvider,
};

use serde::{Deserialize, Serialize};

/// Описание файла, которое отправитель шлёт перед его байтами
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime: mime.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub file_size: u64,
    /// Номер файла, начиная с 1
    pub file_index: usize,
    /// Получатель заранее не знает размер пачки
    pub total_files: Option<usize>,
}

impl TransferProgress {
    /// Процент для отображения, не больше 100
    pub fn percent(&self) -> u8 {
        if self.file_size == 0 {
            return 100;
        }
        let pct = self.bytes_transferred.saturating_mul(100) / self.file_size;
        pct.min(100) as u8
    }
}

/// MIME по расширению; неизвестное расширение даёт пустую строку,
/// как у браузерного File.type
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        let progress = TransferProgress {
            bytes_transferred: 1_250_000,
            file_size: 2_500_000,
            file_index: 1,
            total_files: Some(1),
        };
        assert_eq!(progress.percent(), 50);

        let empty = TransferProgress {
            bytes_transferred: 0,
            file_size: 0,
            file_index: 1,
            total_files: None,
        };
        assert_eq!(empty.percent(), 100);
    }

    #[test]
    fn mime_guess_ignores_case() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("archive.unknown"), "");
        assert_eq!(guess_mime("README"), "");
    }
}
