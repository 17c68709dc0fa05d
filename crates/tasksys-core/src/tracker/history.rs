use serde_json::Value;
use std::collections::VecDeque;

/// Append-only record list that evicts its oldest entry past `limit`.
#[derive(Debug, Clone)]
pub(crate) struct BoundedHistory {
    records: VecDeque<Value>,
    limit: usize,
}

impl BoundedHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, record: Value) {
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Replace the contents with persisted records, keeping the newest `limit`.
    pub(crate) fn restore(&mut self, records: impl IntoIterator<Item = Value>) {
        self.records.clear();
        for record in records {
            self.push(record);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn to_vec(&self) -> Vec<Value> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Array(self.to_vec())
    }
}
