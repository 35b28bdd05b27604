use crate::error::TransportError;
use crate::logger::log;
use crate::peer::transport::{ChannelEvent, ChannelEventHandler, DataChannel};
use crate::peer::types::Frame;
use crate::utils::BoxFuture;
use std::sync::Arc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Канал поверх RTCDataChannel
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let result = match frame {
                Frame::Text(text) => self.dc.send_text(text).await,
                Frame::Binary(data) => self.dc.send(&data).await,
            };
            result
                .map(|_| ())
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
        })
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.dc.buffered_amount().await })
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.dc.set_buffered_amount_low_threshold(threshold).await })
    }

    fn subscribe(&self, handler: ChannelEventHandler) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let on_low = handler.clone();
            self.dc
                .on_buffered_amount_low(Box::new(move || {
                    on_low(ChannelEvent::BufferedAmountLow);
                    Box::pin(async {})
                }))
                .await;

            let on_message = handler.clone();
            self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
                if !msg.is_string {
                    on_message(ChannelEvent::Message(Frame::Binary(msg.data)));
                } else {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => on_message(ChannelEvent::Message(Frame::Text(text))),
                        Err(e) => log(&format!("Dropping non UTF-8 text frame: {e}")),
                    }
                }
                Box::pin(async {})
            }));

            let on_error = handler.clone();
            self.dc.on_error(Box::new(move |e| {
                log(&format!("Data channel error: {e}"));
                on_error(ChannelEvent::Failed(e.to_string()));
                Box::pin(async {})
            }));

            let on_close = handler.clone();
            self.dc.on_close(Box::new(move || {
                log("Data channel closed");
                on_close(ChannelEvent::Closed);
                Box::pin(async {})
            }));

            // регистрируем open последним: если канал уже открыт,
            // обработчик вызовется сразу
            let label = self.dc.label().to_string();
            self.dc.on_open(Box::new(move || {
                log(&format!("Data channel '{label}' opened"));
                handler(ChannelEvent::Opened);
                Box::pin(async {})
            }));
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.dc.close().await {
                log(&format!("Failed to close data channel: {e}"));
            }
        })
    }
}
