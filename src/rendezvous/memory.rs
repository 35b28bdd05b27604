use crate::rendezvous::{RendezvousStore, StoreError, Subscription};
use crate::utils::{lock, BoxFuture};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct StoreState {
    docs: HashMap<String, Value>,
    collections: HashMap<String, Vec<Value>>,
    doc_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    collection_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

/// Хранилище в памяти процесса с той же семантикой, что и внешний сервис
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }

    /// Число документов; записи никто не удаляет, так что оно только растёт
    pub fn document_count(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn collection_len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, Vec::len)
    }

    fn notify_doc(state: &mut StoreState, key: &str) {
        let Some(doc) = state.docs.get(key).cloned() else {
            return;
        };
        if let Some(watchers) = state.doc_watchers.get_mut(key) {
            watchers.retain(|tx| tx.send(doc.clone()).is_ok());
        }
    }
}

impl RendezvousStore for MemoryStore {
    fn put<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if !value.is_object() {
                return Err(StoreError::NotAnObject(key.to_string()));
            }
            let mut state = self.lock();
            state.docs.insert(key.to_string(), value);
            Self::notify_doc(&mut state, key);
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        key: &'a str,
        partial: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let Value::Object(fields) = partial else {
                return Err(StoreError::NotAnObject(key.to_string()));
            };
            let mut state = self.lock();
            let doc = state
                .docs
                .get_mut(key)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| StoreError::Missing(key.to_string()))?;
            for (field, value) in fields {
                doc.insert(field, value);
            }
            Self::notify_doc(&mut state, key);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move { Ok(self.lock().docs.get(key).cloned()) })
    }

    fn append<'a>(
        &'a self,
        collection: &'a str,
        entry: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .push(entry.clone());
            if let Some(watchers) = state.collection_watchers.get_mut(collection) {
                watchers.retain(|tx| tx.send(entry.clone()).is_ok());
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Subscription, StoreError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.lock();
            if let Some(doc) = state.docs.get(key) {
                let _ = tx.send(doc.clone());
            }
            state
                .doc_watchers
                .entry(key.to_string())
                .or_default()
                .push(tx);
            Ok(rx)
        })
    }

    fn subscribe_collection<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, StoreError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.lock();
            for entry in state.collections.get(collection).into_iter().flatten() {
                let _ = tx.send(entry.clone());
            }
            state
                .collection_watchers
                .entry(collection.to_string())
                .or_default()
                .push(tx);
            Ok(rx)
        })
    }
}
