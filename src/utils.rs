use crate::peer::types::ServerConfig;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

/// Future, возвращаемая методами транспортных трейтов
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Захват мьютекса; отравленный мьютекс не роняет процесс
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Текущее время в миллисекундах от эпохи
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
