use crate::error::TransportError;
use crate::logger::{dump_candidate, log};
use crate::peer::data_channel::WebRtcChannel;
use crate::peer::transport::{ConnectionEvent, ConnectionEventHandler, DataChannel, PeerConnection};
use crate::peer::types::{ConnectionState, IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::utils::{add_ice_url_scheme, BoxFuture};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

/// Соединение поверх webrtc-rs
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    pub async fn new(servers: &[ServerConfig]) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(rtc_config(servers))
            .await
            .map_err(failed)?;
        log(&format!(
            "Peer connection created with {} ICE servers",
            servers.len()
        ));
        Ok(Self { pc: Arc::new(pc) })
    }

    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            TransportError::ConnectionFailed("local description missing".into())
        })?;
        from_rtc(desc)
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::ConnectionFailed(format!(
                "unsupported sdp type {other:?}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(failed)
}

fn map_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

impl PeerConnection for WebRtcPeer {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let offer = self.pc.create_offer(None).await.map_err(failed)?;
            self.pc.set_local_description(offer).await.map_err(failed)?;
            // не ждём окончания сбора кандидатов - они уходят через trickle
            self.local_description().await
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let answer = self.pc.create_answer(None).await.map_err(failed)?;
            self.pc.set_local_description(answer).await.map_err(failed)?;
            self.local_description().await
        })
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let desc = to_rtc(desc)?;
            self.pc.set_remote_description(desc).await.map_err(failed)
        })
    }

    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            self.pc.add_ice_candidate(init).await.map_err(failed)
        })
    }

    fn create_data_channel(
        &self,
        label: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn DataChannel>, TransportError>> {
        let label = label.to_string();
        Box::pin(async move {
            let dc = self
                .pc
                .create_data_channel(&label, Some(RTCDataChannelInit::default()))
                .await
                .map_err(failed)?;
            let dc: Arc<dyn DataChannel> = Arc::new(WebRtcChannel::new(dc));
            Ok(dc)
        })
    }

    fn subscribe(&self, handler: ConnectionEventHandler) {
        let on_candidate = handler.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand.map(|c| c.to_json()) {
                    Some(Ok(init)) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        dump_candidate("LOCAL", &candidate);
                        on_candidate(ConnectionEvent::LocalCandidate(candidate));
                    }
                    Some(Err(e)) => log(&format!("Failed to serialize local candidate: {e}")),
                    // None означает конец сбора
                    None => log("ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }));

        let on_state = handler.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                log(&format!("Peer connection state changed to: {:?}", st));
                on_state(ConnectionEvent::StateChanged(map_state(st)));
                Box::pin(async {})
            }));

        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                log(&format!("Remote opened data channel '{}'", dc.label()));
                let dc: Arc<dyn DataChannel> = Arc::new(WebRtcChannel::new(dc));
                handler(ConnectionEvent::DataChannel(dc));
                Box::pin(async {})
            }));
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.pc.close().await {
                log(&format!("Failed to close peer connection: {e}"));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_all_servers_with_schemes() {
        let servers = vec![
            ServerConfig {
                id: "a".into(),
                r#type: "stun".into(),
                url: "stun.example.org:19302".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "turn:relay.example.org:3478".into(),
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ];
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:19302"]);
        assert_eq!(config.ice_servers[1].username, "u");
    }

    #[test]
    fn description_kinds_round_trip_through_rtc() {
        let desc = to_rtc(SessionDescription::answer("v=0\r\n")).unwrap();
        assert_eq!(desc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc(desc).unwrap(), SessionDescription::answer("v=0\r\n"));
    }
}
