//! Выдача кодов комнат и проверка их срока жизни.
//!
//! Код - 6 символов base-36 в верхнем регистре. Уникальность среди уже
//! существующих комнат не проверяется, а записи комнат после завершения
//! сессии не удаляются.

use crate::error::SignalingError;
use crate::logger::log;
use crate::peer::types::SessionDescription;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ROOM_CODE_LEN: usize = 6;

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Документ комнаты в rendezvous-хранилище
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Идентификатор документа, в самом документе не хранится
    #[serde(skip)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Старые клиенты не пишут createdAt, такие комнаты не истекают
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RoomManager {
    ttl: Duration,
}

impl RoomManager {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn issue_code(&self) -> String {
        let code = generate_room_code();
        log(&format!("Issued room code {code}"));
        code
    }

    /// Проверка на стороне подключающегося; инициатор TTL не проверяет
    pub fn check_join(&self, room: &Room, now_ms: i64) -> Result<(), SignalingError> {
        let Some(created_at) = room.created_at else {
            return Ok(());
        };
        let age = now_ms.saturating_sub(created_at);
        if age > self.ttl.as_millis() as i64 {
            log(&format!(
                "Room {} expired: age {} ms > ttl {} ms",
                room.code,
                age,
                self.ttl.as_millis()
            ));
            return Err(SignalingError::RoomExpired(room.code.clone()));
        }
        Ok(())
    }
}

pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// Приводит введённый пользователем код к каноническому виду
pub fn normalize_room_code(input: &str) -> Result<String, SignalingError> {
    let code = input.trim().to_ascii_uppercase();
    if is_valid_room_code(&code) {
        Ok(code)
    } else {
        Err(SignalingError::InvalidRoomCode(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn room(created_at: Option<i64>) -> Room {
        Room {
            code: "AB12CD".into(),
            offer: None,
            answer: None,
            created_at,
        }
    }

    #[test]
    fn generated_codes_match_pattern() {
        for _ in 0..1000 {
            let code = generate_room_code();
            assert_eq!(code.len(), 6);
            assert!(
                code.chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()),
                "bad code {code}"
            );
            assert!(is_valid_room_code(&code));
        }
    }

    #[test]
    fn normalizes_entered_codes() {
        assert_eq!(normalize_room_code(" ab12cd ").unwrap(), "AB12CD");
        assert!(matches!(
            normalize_room_code("AB12C"),
            Err(SignalingError::InvalidRoomCode(_))
        ));
        assert!(normalize_room_code("AB-2CD").is_err());
    }

    #[test]
    fn join_within_ttl_is_allowed() {
        let rooms = RoomManager::new(Duration::from_millis(DAY_MS as u64));
        let now = 10 * DAY_MS;
        assert!(rooms.check_join(&room(Some(now - DAY_MS)), now).is_ok());
        assert!(rooms.check_join(&room(Some(now - 1000)), now).is_ok());
    }

    #[test]
    fn join_after_ttl_is_expired() {
        let rooms = RoomManager::new(Duration::from_millis(DAY_MS as u64));
        let now = 10 * DAY_MS;
        assert_eq!(
            rooms.check_join(&room(Some(now - DAY_MS - 1)), now),
            Err(SignalingError::RoomExpired("AB12CD".into()))
        );
    }

    #[test]
    fn rooms_without_timestamp_never_expire() {
        let rooms = RoomManager::new(Duration::from_millis(1));
        assert!(rooms.check_join(&room(None), i64::MAX).is_ok());
    }

    #[test]
    fn room_document_shape() {
        let doc = serde_json::json!({
            "offer": {"type": "offer", "sdp": "v=0"},
            "createdAt": 1700000000000i64
        });
        let parsed: Room = serde_json::from_value(doc).unwrap();
        assert!(parsed.answer.is_none());
        assert_eq!(parsed.created_at, Some(1_700_000_000_000));

        let back = serde_json::to_value(&parsed).unwrap();
        assert!(back.get("answer").is_none());
        assert!(back.get("code").is_none());
    }
}
