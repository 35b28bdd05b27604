use crate::config::Config;
use crate::error::{Error, StorageError};
use crate::logger::log;
use crate::peer::channel::ChannelAdapter;
use crate::peer::types::Frame;
use crate::transfer::frame::ControlMessage;
use crate::transfer::{guess_mime, FileMeta, TransferProgress};
use bytes::Bytes;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Файл в очереди на отправку: описание и источник байтов
pub struct OutgoingFile {
    pub meta: FileMeta,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl OutgoingFile {
    pub fn from_reader(meta: FileMeta, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            meta,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, content: Bytes) -> Self {
        let meta = FileMeta::new(name, content.len() as u64, mime);
        Self::from_reader(meta, Cursor::new(content))
    }

    /// Открывает файл с диска; MIME угадывается по расширению
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = guess_mime(&name);
        Ok(Self::from_reader(FileMeta::new(name, size, mime), file))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendUpdate {
    FileStarted { index: usize, meta: FileMeta },
    Progress(TransferProgress),
    FileSent { index: usize, meta: FileMeta },
}

/// Последовательная отправка пачки файлов по одному открытому каналу
pub struct ChunkedSender<'a> {
    channel: &'a ChannelAdapter,
    chunk_size: usize,
    settle_delay: Duration,
}

impl<'a> ChunkedSender<'a> {
    pub fn new(channel: &'a ChannelAdapter, chunk_size: usize, settle_delay: Duration) -> Self {
        Self {
            channel,
            chunk_size: chunk_size.max(1),
            settle_delay,
        }
    }

    pub fn from_config(channel: &'a ChannelAdapter, config: &Config) -> Self {
        Self::new(channel, config.chunk_size, config.settle_delay)
    }

    /// Отправляет файлы строго по очереди. Первая ошибка прерывает
    /// текущий файл и все оставшиеся; возвращает число отправленных файлов.
    pub async fn send_batch(
        &self,
        files: Vec<OutgoingFile>,
        mut on_update: impl FnMut(SendUpdate),
    ) -> Result<usize, Error> {
        let total = files.len();
        log(&format!("Sending batch of {total} files"));

        for (i, file) in files.into_iter().enumerate() {
            if i > 0 && !self.settle_delay.is_zero() {
                // у кадров нет номеров, так что end и следующий meta разводим по времени
                tokio::time::sleep(self.settle_delay).await;
            }
            let index = i + 1;
            let meta = file.meta.clone();
            on_update(SendUpdate::FileStarted {
                index,
                meta: meta.clone(),
            });
            self.send_file(file, index, total, &mut on_update).await?;
            on_update(SendUpdate::FileSent { index, meta });
        }
        Ok(total)
    }

    async fn send_file(
        &self,
        file: OutgoingFile,
        index: usize,
        total: usize,
        on_update: &mut impl FnMut(SendUpdate),
    ) -> Result<(), Error> {
        let OutgoingFile { meta, mut reader } = file;
        log(&format!(
            "Sending {} ({} bytes, {:?}) [{index}/{total}]",
            meta.name, meta.size, meta.mime
        ));
        self.send_paced(ControlMessage::Meta(meta.clone()).encode()?)
            .await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            let n = read_chunk(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            self.send_paced(Frame::Binary(Bytes::copy_from_slice(&buf[..n])))
                .await?;
            sent += n as u64;
            on_update(SendUpdate::Progress(TransferProgress {
                bytes_transferred: sent,
                file_size: meta.size,
                file_index: index,
                total_files: Some(total),
            }));
        }

        if sent != meta.size {
            log(&format!(
                "{}: announced {} bytes but read {}",
                meta.name, meta.size, sent
            ));
        }
        self.send_paced(ControlMessage::End.encode()?).await?;
        Ok(())
    }

    /// Перед каждым кадром ждём, пока буфер не опустится до high watermark;
    /// так буфер не превышает его больше чем на один кадр
    async fn send_paced(&self, frame: Frame) -> Result<(), Error> {
        self.channel.wait_for_capacity().await?;
        self.channel.send(frame).await?;
        Ok(())
    }
}

/// Читает до заполнения буфера или конца файла
async fn read_chunk(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::peer::loopback::{LoopbackChannel, LoopbackOptions};
    use crate::peer::transport::ChannelEvent;

    async fn open_pair(high: usize, low: usize, options: LoopbackOptions) -> (ChannelAdapter, ChannelAdapter, std::sync::Arc<LoopbackChannel>) {
        let (a, b) = LoopbackChannel::pair("fileTransfer", options);
        a.open();
        let mut tx = ChannelAdapter::attach(a.clone(), high, low).await;
        let mut rx = ChannelAdapter::attach(b, high, low).await;
        tx.wait_open().await.unwrap();
        rx.wait_open().await.unwrap();
        (tx, rx, a)
    }

    fn text(frame: &ChannelEvent) -> Option<ControlMessage> {
        match frame {
            ChannelEvent::Message(Frame::Text(t)) => ControlMessage::decode(t).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn file_is_framed_as_meta_chunks_end() {
        let (tx, mut rx, _) = open_pair(1024, 256, LoopbackOptions::default()).await;
        let content = Bytes::from(vec![7u8; 10]);
        let sender = ChunkedSender::new(&tx, 4, Duration::ZERO);

        let mut updates = Vec::new();
        let sent = sender
            .send_batch(
                vec![OutgoingFile::from_bytes("a.bin", "", content)],
                |u| updates.push(u),
            )
            .await
            .unwrap();
        assert_eq!(sent, 1);

        let first = rx.next_event().await.unwrap();
        assert_eq!(
            text(&first),
            Some(ControlMessage::Meta(FileMeta::new("a.bin", 10, "")))
        );
        let mut sizes = Vec::new();
        for _ in 0..3 {
            match rx.next_event().await.unwrap() {
                ChannelEvent::Message(Frame::Binary(b)) => sizes.push(b.len()),
                other => panic!("expected binary frame, got {other:?}"),
            }
        }
        assert_eq!(sizes, [4, 4, 2]);
        assert_eq!(text(&rx.next_event().await.unwrap()), Some(ControlMessage::End));

        let progress: Vec<u64> = updates
            .iter()
            .filter_map(|u| match u {
                SendUpdate::Progress(p) => Some(p.bytes_transferred),
                _ => None,
            })
            .collect();
        assert_eq!(progress, [4, 8, 10]);
        assert!(matches!(updates.last(), Some(SendUpdate::FileSent { index: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_amount_stays_within_one_chunk_of_high_watermark() {
        let options = LoopbackOptions {
            drain_interval: Duration::from_millis(1),
        };
        let (tx, _rx, raw) = open_pair(64 * 1024, 16 * 1024, options).await;
        let sender = ChunkedSender::new(&tx, 16 * 1024, Duration::ZERO);

        let content = Bytes::from(vec![1u8; 1024 * 1024]);
        sender
            .send_batch(vec![OutgoingFile::from_bytes("big.bin", "", content)], |_| {})
            .await
            .unwrap();

        assert!(raw.max_buffered() > 0);
        assert!(raw.max_buffered() <= 64 * 1024 + 16 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_separates_files() {
        let (tx, _rx, _) = open_pair(1024 * 1024, 1024, LoopbackOptions::default()).await;
        let sender = ChunkedSender::new(&tx, 1024, Duration::from_millis(100));
        let files = vec![
            OutgoingFile::from_bytes("1.txt", "text/plain", Bytes::from_static(b"one")),
            OutgoingFile::from_bytes("2.txt", "text/plain", Bytes::from_static(b"two")),
        ];

        let start = tokio::time::Instant::now();
        let mut started = Vec::new();
        sender
            .send_batch(files, |u| {
                if let SendUpdate::FileStarted { index, .. } = u {
                    started.push((index, tokio::time::Instant::now() - start));
                }
            })
            .await
            .unwrap();

        assert_eq!(started[0].0, 1);
        assert!(started[0].1 < Duration::from_millis(100));
        assert_eq!(started[1].0, 2);
        assert!(started[1].1 >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn closed_channel_aborts_the_batch() {
        let (tx, _rx, raw) = open_pair(1024, 256, LoopbackOptions::default()).await;
        raw.fail("gone");
        tokio::task::yield_now().await;

        let sender = ChunkedSender::new(&tx, 4, Duration::ZERO);
        let mut started = 0;
        let err = sender
            .send_batch(
                vec![
                    OutgoingFile::from_bytes("1", "", Bytes::from_static(b"1")),
                    OutgoingFile::from_bytes("2", "", Bytes::from_static(b"2")),
                ],
                |u| {
                    if matches!(u, SendUpdate::FileStarted { .. }) {
                        started += 1;
                    }
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::ConnectionClosed)));
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn opens_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpegdata").unwrap();

        let file = OutgoingFile::open(&path).await.unwrap();
        assert_eq!(file.meta, FileMeta::new("photo.jpg", 8, "image/jpeg"));
    }
}
