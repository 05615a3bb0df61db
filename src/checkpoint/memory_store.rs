// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use super::{CheckpointStore, StoreError};

/// Process-local checkpoints. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: DashMap<String, i64>,
    /// Every successful write per key, in order.
    history: DashMap<String, Vec<i64>>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.offsets.get(key).map(|offset| *offset)
    }

    pub fn history(&self, key: &str) -> Vec<i64> {
        self.history
            .get(key)
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, offset: i64) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(StoreError::Backend(format!("write of {} rejected", key)));
        }
        self.offsets.insert(key.to_string(), offset);
        self.history.entry(key.to_string()).or_default().push(offset);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.offsets.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_writes_leave_the_value() {
        let store = MemoryCheckpointStore::new();
        store.write("p0", 10).await.unwrap();
        store.set_failing(true);
        assert!(store.write("p0", 20).await.is_err());
        assert_eq!(store.read("p0").await.unwrap(), Some(10));
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.history("p0"), vec![10]);
        assert!(!store.exists("p1").await.unwrap());
    }
}
