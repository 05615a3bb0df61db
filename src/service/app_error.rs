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

use crate::checkpoint::StoreError;
use crate::partition::TrackError;
use crate::reader::{ConnectError, FetchError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("tracing setup error: {0}")]
    TracingSetup(String),

    /// coordinator level errors, the only ones surfaced to the processing engine
    #[error("invalid partition assignment: {0}")]
    InvalidAssignment(String),

    #[error("partition {partition_id} failed again after {restarts} restarts")]
    PartitionExhausted { partition_id: i32, restarts: u32 },

    /// partition local errors
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppError {
    /// Whether the error is confined to a single partition. Partition local
    /// failures are isolated by the coordinator and never stop the frontend.
    pub fn is_partition_local(&self) -> bool {
        matches!(
            self,
            AppError::Connect(_) | AppError::Fetch(_) | AppError::Track(_) | AppError::Store(_)
        )
    }
}
