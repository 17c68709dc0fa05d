//! InMemoryStore - テスト・開発用の KvStore

use serde_json::{Map, Value};
use std::sync::Mutex;

use crate::ports::{KvStore, StoreError};
use crate::sync::lock;

/// KvStore backed by a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: Mutex<Map<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.data).keys().cloned().collect()
    }
}

impl KvStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.data).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        lock(&self.data).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.data).remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.data).clear();
        Ok(())
    }
}
