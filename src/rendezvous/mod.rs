//! Доступ к внешнему хранилищу документов с подписками. Хранилище
//! используется только как слепой ретранслятор сигнальных данных.

pub mod client;
pub mod memory;

pub use client::{CandidateWatch, RendezvousClient, RoomWatch};
pub use memory::MemoryStore;

use crate::utils::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} does not exist")]
    Missing(String),

    #[error("value for {0} is not an object")]
    NotAnObject(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Поток изменений: снимки документа либо новые элементы коллекции.
/// Отписка - просто drop.
pub type Subscription = mpsc::UnboundedReceiver<Value>;

pub trait RendezvousStore: Send + Sync {
    /// Записывает документ целиком
    fn put<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Сливает поля верхнего уровня в существующий документ
    fn update<'a>(&'a self, key: &'a str, partial: Value)
        -> BoxFuture<'a, Result<(), StoreError>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>>;

    /// Добавляет элемент в коллекцию только для дописывания
    fn append<'a>(&'a self, collection: &'a str, entry: Value)
        -> BoxFuture<'a, Result<(), StoreError>>;

    /// Подписка на документ: текущий снимок (если есть), затем каждый новый
    fn subscribe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Subscription, StoreError>>;

    /// Подписка на коллекцию: уже добавленные элементы, затем каждый новый
    fn subscribe_collection<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, StoreError>>;
}
