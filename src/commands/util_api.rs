use crate::commands::BridgePeer;
use crate::error::Result;
use crate::logger::log;
use crate::peer::connection::WebRtcPeer;
use crate::peer::transport::{ConnectionEvent, PeerConnection};
use crate::peer::types::ConnectionState;
use crate::session::{Role, SessionEvent, SessionState};
use crate::signaling::Handshake;
use crate::utils::lock;
use std::sync::Arc;

impl BridgePeer {
    /// Соединение webrtc с ICE-серверами из конфигурации
    pub async fn new_webrtc_peer(&self) -> Result<Arc<dyn PeerConnection>> {
        let peer = WebRtcPeer::new(&self.config.ice_servers).await?;
        Ok(Arc::new(peer))
    }

    /// Доводит рукопожатие до открытого канала. После этого потеря
    /// соединения переводит сессию в error.
    pub async fn connect(&self, handshake: Handshake) -> Result<()> {
        let pc = handshake.peer();
        let channel = match handshake.established().await {
            Ok(channel) => channel,
            Err(e) => {
                self.cell.fail(&e.to_string());
                return Err(e);
            }
        };

        *self.channel.lock().await = Some(channel);
        self.cell.apply(SessionEvent::ChannelOpened)?;
        self.watch_connection(pc.as_ref());
        Ok(())
    }

    fn watch_connection(&self, pc: &dyn PeerConnection) {
        let cell = self.cell.clone();
        let generation = cell.generation();
        pc.subscribe(Arc::new(move |event| {
            if let ConnectionEvent::StateChanged(
                state @ (ConnectionState::Failed
                | ConnectionState::Disconnected
                | ConnectionState::Closed),
            ) = event
            {
                log(&format!("Connection state {:?}", state));
                cell.fail_generation(generation, &format!("connection {:?}", state).to_lowercase());
            }
        }));
    }

    pub fn state(&self) -> Option<SessionState> {
        lock(&self.cell.session).as_ref().map(|s| s.state())
    }

    /// Все состояния сессии по порядку, начиная с idle
    pub fn history(&self) -> Vec<SessionState> {
        lock(&self.cell.session)
            .as_ref()
            .map(|s| s.history().to_vec())
            .unwrap_or_default()
    }

    pub fn role(&self) -> Option<Role> {
        lock(&self.cell.session).as_ref().map(|s| s.role())
    }

    pub fn room_code(&self) -> Option<String> {
        lock(&self.cell.session)
            .as_ref()
            .map(|s| s.room_code().to_string())
    }

    /// Закрывает соединение и забывает сессию. Очередь принятых файлов
    /// остаётся до явной очистки.
    pub async fn reset(&self) {
        if let Some(session) = self.cell.end() {
            log(&format!(
                "Reset {:?} session for room {} in state {:?}",
                session.role(),
                session.room_code(),
                session.state()
            ));
        }
        self.replace_peer(None).await;
    }

    /// Новое соединение вытесняет старое вместе с его каналом.
    /// Соединение закрывается до захвата канала: идущая отправка держит
    /// канал и завершится только после закрытия.
    pub(crate) async fn replace_peer(&self, next: Option<Arc<dyn PeerConnection>>) {
        self.cell.end();
        let previous = std::mem::replace(&mut *lock(&self.peer), next);
        if let Some(previous) = previous {
            log("Closing previous peer connection");
            previous.close().await;
        }
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}
