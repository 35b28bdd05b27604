// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Размер одного бинарного фрейма с содержимым файла
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Порог буфера канала, выше которого отправитель ждёт
pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;

/// Порог, при падении до которого канал сообщает "bufferedamountlow"
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;

/// Сколько живёт комната с момента создания
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Пауза между файлами пакета (end-фрейм не должен обгонять данные следующего файла)
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Пауза между выгрузками при "скачать всё"
pub const DEFAULT_RETRIEVAL_DELAY: Duration = Duration::from_millis(1500);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_CHANNEL_LABEL: &str = "fileTransfer";

/// Настройки одной пиринговой сессии
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<ServerConfig>,
    pub channel_label: String,
    pub chunk_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    #[serde(with = "millis")]
    pub room_ttl: Duration,
    #[serde(with = "millis")]
    pub retrieval_delay: Duration,
    /// `None` - ждать рукопожатие бесконечно
    #[serde(with = "opt_millis")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            settle_delay: DEFAULT_SETTLE_DELAY,
            room_ttl: DEFAULT_ROOM_TTL,
            retrieval_delay: DEFAULT_RETRIEVAL_DELAY,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "low_watermark {} is above high_watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid("server URL cannot be empty".into()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 16 * 1024);
        assert_eq!(config.room_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"chunk_size": 4096, "handshake_timeout": null}"#)
            .expect("valid config");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.low_watermark, DEFAULT_LOW_WATERMARK);
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let err = Config::from_json(r#"{"high_watermark": 1024, "low_watermark": 2048}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_turn_without_credentials() {
        let mut config = Config::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: None,
            credential: None,
        });
        assert!(config.validate().is_err());
    }
}
