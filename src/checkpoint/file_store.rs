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

use std::io;
use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::trace;

use super::{parse_offset, CheckpointStore, StoreError};

/// One file per checkpoint key under a root directory.
///
/// A write goes to a temporary sibling that is synced and then renamed over
/// the checkpoint, so a crash leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match tokio::fs::read_to_string(self.path_of(key)).await {
            Ok(value) => parse_offset(key, &value).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, offset: i64) -> Result<(), StoreError> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut buf_writer = BufWriter::new(file);
        buf_writer.write_all(offset.to_string().as_bytes()).await?;
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        trace!(key, offset, "checkpoint written to {}", path.display());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path_of(key)).await?)
    }
}
