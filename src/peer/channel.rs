use crate::error::TransportError;
use crate::logger::log;
use crate::peer::transport::{ChannelEvent, DataChannel};
use crate::peer::types::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Обёртка над единственным каналом соединения: отправка фреймов,
/// поток входящих событий и ожидание по водяным знакам буфера.
pub struct ChannelAdapter {
    channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    low_watermark: Arc<Notify>,
    closed: Arc<AtomicBool>,
    high_watermark: usize,
}

impl ChannelAdapter {
    pub async fn attach(
        channel: Arc<dyn DataChannel>,
        high_watermark: usize,
        low_watermark: usize,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let low_notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        channel.set_buffered_amount_low_threshold(low_watermark).await;

        let handler = {
            let low_notify = low_notify.clone();
            let closed = closed.clone();
            Arc::new(move |event: ChannelEvent| {
                match &event {
                    ChannelEvent::BufferedAmountLow => {
                        // notify_one сохраняет разрешение, если никто ещё не ждёт
                        low_notify.notify_one();
                        return;
                    }
                    ChannelEvent::Closed | ChannelEvent::Failed(_) => {
                        closed.store(true, Ordering::Release);
                        low_notify.notify_one();
                    }
                    _ => {}
                }
                let _ = tx.send(event);
            })
        };
        channel.subscribe(handler).await;
        log(&format!(
            "Channel '{}' attached (high={} low={})",
            channel.label(),
            high_watermark,
            low_watermark
        ));

        Self {
            channel,
            events,
            low_watermark: low_notify,
            closed,
            high_watermark,
        }
    }

    pub fn label(&self) -> String {
        self.channel.label()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.channel.send(frame).await
    }

    pub async fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount().await
    }

    /// Ждёт, пока буфер не опустится не выше high watermark.
    /// После пробуждения буфер перепроверяется: старое разрешение Notify
    /// не должно пропустить отправку при переполненном буфере.
    pub async fn wait_for_capacity(&self) -> Result<(), TransportError> {
        loop {
            if self.is_closed() {
                return Err(TransportError::ConnectionClosed);
            }
            let buffered = self.channel.buffered_amount().await;
            if buffered <= self.high_watermark {
                return Ok(());
            }
            self.low_watermark.notified().await;
        }
    }

    /// Следующее событие канала (кроме BufferedAmountLow). `None` - канал
    /// больше не выдаст событий.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Ждёт события open; сообщения до open не ожидаются
    pub async fn wait_open(&mut self) -> Result<(), TransportError> {
        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Opened) => {
                    log(&format!("Channel '{}' opened", self.channel.label()));
                    return Ok(());
                }
                Some(ChannelEvent::Failed(reason)) => {
                    return Err(TransportError::ConnectionFailed(reason))
                }
                Some(ChannelEvent::Closed) | None => return Err(TransportError::ConnectionClosed),
                Some(other) => log(&format!("Ignoring {:?} before channel open", other)),
            }
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::{LoopbackChannel, LoopbackOptions};
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_frames_in_order() {
        let (a, b) = LoopbackChannel::pair("t", LoopbackOptions::default());
        a.open();
        let mut tx = ChannelAdapter::attach(a, 1024, 256).await;
        let mut rx = ChannelAdapter::attach(b, 1024, 256).await;
        tx.wait_open().await.unwrap();
        rx.wait_open().await.unwrap();

        tx.send(Frame::Text("hello".into())).await.unwrap();
        tx.send(Frame::Binary(Bytes::from_static(b"\x01\x02"))).await.unwrap();

        assert_eq!(
            rx.next_event().await,
            Some(ChannelEvent::Message(Frame::Text("hello".into())))
        );
        assert_eq!(
            rx.next_event().await,
            Some(ChannelEvent::Message(Frame::Binary(Bytes::from_static(
                b"\x01\x02"
            ))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_wait_resumes_on_low_watermark() {
        let options = LoopbackOptions {
            drain_interval: Duration::from_millis(5),
        };
        let (a, b) = LoopbackChannel::pair("t", options);
        a.open();
        let tx = ChannelAdapter::attach(a.clone(), 100, 50).await;
        let _rx = ChannelAdapter::attach(b, 100, 50).await;

        for _ in 0..4 {
            tx.send(Frame::Binary(Bytes::from(vec![0u8; 60]))).await.unwrap();
        }
        assert!(tx.buffered_amount().await > 100);

        tx.wait_for_capacity().await.unwrap();
        assert!(tx.buffered_amount().await <= 100);
    }

    #[tokio::test]
    async fn capacity_wait_fails_once_closed() {
        let (a, b) = LoopbackChannel::pair("t", LoopbackOptions::default());
        a.open();
        let tx = ChannelAdapter::attach(a.clone(), 0, 0).await;
        drop(b);
        a.close().await;
        tokio::task::yield_now().await;
        assert_eq!(
            tx.send(Frame::Text("x".into())).await,
            Err(TransportError::ConnectionClosed)
        );
        assert_eq!(
            tx.wait_for_capacity().await,
            Err(TransportError::ConnectionClosed)
        );
    }
}
