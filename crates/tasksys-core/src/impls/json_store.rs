//! JsonFileStore - 単一 JSON ファイルに永続化する KvStore
//!
//! # 実装詳細
//! - 起動時にファイル全体を読み込み、メモリ上の Map で保持
//! - `set` / `remove` / `clear` のたびにファイル全体を書き直す（pretty JSON）
//! - ファイルが存在しない・壊れている場合は空として扱う

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::ports::{KvStore, StoreError};
use crate::sync::lock;

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = Self::read_file(&path)?;
        debug!(path = %path.display(), keys = data.len(), "opened task storage");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Result<Map<String, Value>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "task storage is not a JSON object; starting empty");
                Ok(Map::new())
            }
        }
    }

    fn write_file(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.data).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        data.insert(key.to_string(), value);
        self.write_file(&data)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        if data.remove(key).is_some() {
            self.write_file(&data)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        data.clear();
        self.write_file(&data)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let data = lock(&self.data);
        self.write_file(&data)
    }
}
