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

//! Durable storage of committed partition offsets.
//!
//! A checkpoint is the offset below which every event of a partition has been
//! processed. Values are stored as decimal strings under a path-like key.

use std::future::Future;
use std::io;

pub use file_store::FileCheckpointStore;
pub use memory_store::MemoryCheckpointStore;
pub use rocksdb_store::RocksDbCheckpointStore;

mod file_store;
mod memory_store;
mod rocksdb_store;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint backend error: {0}")]
    Backend(String),
    #[error("corrupt checkpoint at {key}: {value:?}")]
    Corrupt { key: String, value: String },
}

/// Key/value storage of checkpoints.
///
/// Writes to different keys may run concurrently. Writes to one key are
/// serialized by the partition that owns it.
pub trait CheckpointStore: Send + Sync + 'static {
    fn read(&self, key: &str) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    fn write(&self, key: &str, offset: i64)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

pub(crate) fn parse_offset(key: &str, value: &str) -> Result<i64, StoreError> {
    value.trim().parse().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Builds the checkpoint key of each partition of one consumed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKeyspace {
    prefix: String,
}

impl CheckpointKeyspace {
    const ROOT: &'static str = "/eventhubspout";

    pub fn new(topology: &str, namespace: &str, entity: &str) -> Self {
        Self {
            prefix: format!("{}/{}/{}/{}/partitions", Self::ROOT, topology, namespace, entity),
        }
    }

    pub fn key(&self, partition_id: i32) -> String {
        format!("{}/{}", self.prefix, partition_id)
    }
}
