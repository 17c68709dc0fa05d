//! ChainContext - チェーン内で共有される key/value
//!
//! 子タスクのワーカースレッドが書き込み、状態取得側（別スレッド）が読むためロックで保護する。
//! 値は `serde_json::Value` として保持するので、永続化できない値は `set` の時点で弾かれる。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use crate::domain::TaskId;
use crate::sync::lock;

#[derive(Clone)]
pub struct ChainContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    chain_id: TaskId,
    data: Mutex<Map<String, Value>>,
}

/// Persisted form: `{chainId, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContextSnapshot {
    pub chain_id: TaskId,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ChainContext {
    pub fn new(chain_id: TaskId) -> Self {
        Self::with_data(chain_id, Map::new())
    }

    fn with_data(chain_id: TaskId, data: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                chain_id,
                data: Mutex::new(data),
            }),
        }
    }

    pub fn chain_id(&self) -> TaskId {
        self.inner.chain_id
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        lock(&self.inner.data).insert(key.into(), value);
        Ok(())
    }

    /// `None` when the key is absent or the stored value does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        serde_json::from_value(value).ok()
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        lock(&self.inner.data).get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        lock(&self.inner.data).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.data).keys().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.inner.data).clear();
    }

    /// Copy of the whole payload.
    pub fn data(&self) -> Map<String, Value> {
        lock(&self.inner.data).clone()
    }

    pub fn serialize(&self) -> ChainContextSnapshot {
        ChainContextSnapshot {
            chain_id: self.chain_id(),
            data: self.data(),
        }
    }

    pub fn deserialize(snapshot: ChainContextSnapshot) -> Self {
        Self::with_data(snapshot.chain_id, snapshot.data)
    }

    /// Fails when `chainId` is missing or malformed.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        Ok(Self::deserialize(serde_json::from_value(value)?))
    }
}

impl std::fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("chain_id", &self.chain_id())
            .field("keys", &self.keys())
            .finish()
    }
}
