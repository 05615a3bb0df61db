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

use std::fmt::{Debug, Formatter};
use std::path::Path;

use rocksdb::{Options, DB};
use tracing::{info, trace};

use super::{parse_offset, CheckpointStore, StoreError};

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.into_string())
    }
}

/// Checkpoints kept in a local RocksDB database.
pub struct RocksDbCheckpointStore {
    db: DB,
}

impl Debug for RocksDbCheckpointStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbCheckpointStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        info!("checkpoint database opened at {}", path.as_ref().display());
        Ok(Self { db })
    }
}

impl CheckpointStore for RocksDbCheckpointStore {
    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.db.get(key)? {
            Some(value) => {
                let value = String::from_utf8_lossy(&value);
                parse_offset(key, &value).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, offset: i64) -> Result<(), StoreError> {
        self.db.put(key, offset.to_string())?;
        trace!(key, offset, "checkpoint stored");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.db.get_pinned(key)?.is_some())
    }
}
