use crate::error::SignalingError;
use crate::logger::log;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::rendezvous::{RendezvousStore, StoreError, Subscription};
use crate::room::Room;
use crate::session::Role;
use serde_json::json;
use std::sync::Arc;

impl From<StoreError> for SignalingError {
    fn from(e: StoreError) -> Self {
        SignalingError::Store(e.to_string())
    }
}

fn room_key(code: &str) -> String {
    format!("rooms/{code}")
}

/// Список кандидатов принадлежит роли, которая в него пишет
fn candidates_key(code: &str, writer: Role) -> String {
    let list = match writer {
        Role::Initiator => "callerCandidates",
        Role::Responder => "calleeCandidates",
    };
    format!("rooms/{code}/{list}")
}

/// Типизированный доступ к комнатам и спискам кандидатов
#[derive(Clone)]
pub struct RendezvousClient {
    store: Arc<dyn RendezvousStore>,
}

impl RendezvousClient {
    pub fn new(store: Arc<dyn RendezvousStore>) -> Self {
        Self { store }
    }

    /// Запись `{offer, createdAt}` от инициатора. В существующий документ
    /// поля сливаются, answer в нём не затирается.
    pub async fn create_room(
        &self,
        code: &str,
        offer: &SessionDescription,
        created_at: i64,
    ) -> Result<(), SignalingError> {
        let key = room_key(code);
        let doc = json!({ "offer": offer, "createdAt": created_at });
        match self.store.update(&key, doc.clone()).await {
            Ok(()) => log(&format!("Room {code} already existed, offer merged")),
            Err(StoreError::Missing(_)) => {
                self.store.put(&key, doc).await?;
                log(&format!("Room {code} written with offer"));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn get_room(&self, code: &str) -> Result<Option<Room>, SignalingError> {
        let Some(doc) = self.store.get(&room_key(code)).await? else {
            return Ok(None);
        };
        let mut room: Room = serde_json::from_value(doc)
            .map_err(|_| SignalingError::MalformedRoom(code.to_string()))?;
        room.code = code.to_string();
        Ok(Some(room))
    }

    /// Ответ пишется частичным обновлением, поле offer не трогается.
    /// Комната принимает только один answer.
    pub async fn write_answer(
        &self,
        code: &str,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let room = self
            .get_room(code)
            .await?
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        if room.answer.is_some() {
            return Err(SignalingError::RoomAlreadyAnswered(code.to_string()));
        }
        self.store
            .update(&room_key(code), json!({ "answer": answer }))
            .await
            .map_err(|e| match e {
                StoreError::Missing(_) => SignalingError::RoomNotFound(code.to_string()),
                other => other.into(),
            })?;
        log(&format!("Answer written to room {code}"));
        Ok(())
    }

    pub async fn append_candidate(
        &self,
        code: &str,
        writer: Role,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let entry = serde_json::to_value(candidate)
            .map_err(|e| SignalingError::Store(e.to_string()))?;
        self.store
            .append(&candidates_key(code, writer), entry)
            .await?;
        Ok(())
    }

    pub async fn watch_room(&self, code: &str) -> Result<RoomWatch, SignalingError> {
        let sub = self.store.subscribe(&room_key(code)).await?;
        Ok(RoomWatch {
            code: code.to_string(),
            sub,
        })
    }

    /// Подписка на кандидатов, которые пишет `writer`
    pub async fn watch_candidates(
        &self,
        code: &str,
        writer: Role,
    ) -> Result<CandidateWatch, SignalingError> {
        let sub = self
            .store
            .subscribe_collection(&candidates_key(code, writer))
            .await?;
        Ok(CandidateWatch { sub })
    }
}

pub struct RoomWatch {
    code: String,
    sub: Subscription,
}

impl RoomWatch {
    /// Следующий корректный снимок комнаты; битые снимки пропускаются
    pub async fn next(&mut self) -> Option<Room> {
        loop {
            let doc = self.sub.recv().await?;
            match serde_json::from_value::<Room>(doc) {
                Ok(mut room) => {
                    room.code = self.code.clone();
                    return Some(room);
                }
                Err(e) => log(&format!("Skipping malformed room snapshot: {e}")),
            }
        }
    }
}

pub struct CandidateWatch {
    sub: Subscription,
}

impl CandidateWatch {
    pub async fn next(&mut self) -> Option<IceCandidate> {
        loop {
            let entry = self.sub.recv().await?;
            match serde_json::from_value::<IceCandidate>(entry) {
                Ok(candidate) => return Some(candidate),
                Err(e) => log(&format!("Skipping malformed candidate: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::MemoryStore;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn answer_does_not_touch_offer() {
        let store = Arc::new(MemoryStore::new());
        let client = RendezvousClient::new(store);
        client
            .create_room("AB12CD", &SessionDescription::offer("o"), 42)
            .await
            .unwrap();
        client
            .write_answer("AB12CD", &SessionDescription::answer("a"))
            .await
            .unwrap();

        let room = client.get_room("AB12CD").await.unwrap().unwrap();
        assert_eq!(room.code, "AB12CD");
        assert_eq!(room.offer, Some(SessionDescription::offer("o")));
        assert_eq!(room.answer, Some(SessionDescription::answer("a")));
        assert_eq!(room.created_at, Some(42));
    }

    #[tokio::test]
    async fn room_takes_a_single_answer() {
        let client = RendezvousClient::new(Arc::new(MemoryStore::new()));
        client
            .create_room("AB12CD", &SessionDescription::offer("o"), 42)
            .await
            .unwrap();
        client
            .write_answer("AB12CD", &SessionDescription::answer("first"))
            .await
            .unwrap();

        assert_eq!(
            client
                .write_answer("AB12CD", &SessionDescription::answer("second"))
                .await,
            Err(SignalingError::RoomAlreadyAnswered("AB12CD".into()))
        );
        let room = client.get_room("AB12CD").await.unwrap().unwrap();
        assert_eq!(room.answer, Some(SessionDescription::answer("first")));
    }

    #[tokio::test]
    async fn rewriting_the_offer_keeps_the_answer() {
        let client = RendezvousClient::new(Arc::new(MemoryStore::new()));
        client
            .create_room("AB12CD", &SessionDescription::offer("old"), 1)
            .await
            .unwrap();
        client
            .write_answer("AB12CD", &SessionDescription::answer("a"))
            .await
            .unwrap();
        client
            .create_room("AB12CD", &SessionDescription::offer("new"), 2)
            .await
            .unwrap();

        let room = client.get_room("AB12CD").await.unwrap().unwrap();
        assert_eq!(room.offer, Some(SessionDescription::offer("new")));
        assert_eq!(room.answer, Some(SessionDescription::answer("a")));
        assert_eq!(room.created_at, Some(2));
    }

    #[tokio::test]
    async fn answer_to_missing_room_is_not_found() {
        let client = RendezvousClient::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            client
                .write_answer("NOPE00", &SessionDescription::answer("a"))
                .await,
            Err(SignalingError::RoomNotFound("NOPE00".into()))
        );
        assert_eq!(client.get_room("NOPE00").await, Ok(None));
    }

    #[tokio::test]
    async fn candidate_lists_are_partitioned_by_writer() {
        let store = Arc::new(MemoryStore::new());
        let client = RendezvousClient::new(store.clone());
        let mut from_responder = client
            .watch_candidates("AB12CD", Role::Responder)
            .await
            .unwrap();

        client
            .append_candidate("AB12CD", Role::Initiator, &candidate(1))
            .await
            .unwrap();
        client
            .append_candidate("AB12CD", Role::Responder, &candidate(2))
            .await
            .unwrap();

        assert_eq!(from_responder.next().await, Some(candidate(2)));
        assert_eq!(store.collection_len("rooms/AB12CD/callerCandidates"), 1);
        assert_eq!(store.collection_len("rooms/AB12CD/calleeCandidates"), 1);
    }

    #[test]
    fn candidates_use_browser_field_names() {
        let value = serde_json::to_value(candidate(3)).unwrap();
        assert!(value.get("sdpMid").is_some());
        assert!(value.get("sdpMLineIndex").is_some());
    }
}
