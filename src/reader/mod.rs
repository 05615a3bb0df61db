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

//! Access to one partition of the external log service.
//!
//! The log service itself sits behind [`LogClient`] / [`LogConnection`]; a
//! [`PartitionReader`] wraps one connection and tracks where the next fetch
//! continues from.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::event::EventData;

pub use file::FileLogClient;
pub use memory::MemoryLogClient;
pub use partition_reader::PartitionReader;

mod file;
mod memory;
mod partition_reader;

/// Where a receiver starts reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Inclusive: the first event returned has this offset.
    Offset(i64),
    Earliest,
    Latest,
    /// First event enqueued strictly after the timestamp.
    EnqueuedAfter(DateTime<Utc>),
}

impl Display for StartPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StartPosition::Offset(offset) => write!(f, "offset {}", offset),
            StartPosition::Earliest => write!(f, "earliest"),
            StartPosition::Latest => write!(f, "latest"),
            StartPosition::EnqueuedAfter(time) => write!(f, "enqueued after {}", time),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("partition {partition_id} unreachable: {reason}")]
    Unreachable { partition_id: i32, reason: String },
    #[error("unknown partition {0}")]
    UnknownPartition(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("receiver for partition {0} is not open")]
    NotOpen(i32),
    #[error("fetch from partition {partition_id} failed: {reason}")]
    Transport { partition_id: i32, reason: String },
}

/// Factory for partition connections.
pub trait LogClient: Send + Sync + 'static {
    type Connection: LogConnection;

    fn connect(
        &self,
        partition_id: i32,
        start: StartPosition,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;
}

/// An open receiver on one partition.
pub trait LogConnection: Send + 'static {
    /// Returns up to `max_count` events in offset order, waiting at most
    /// `timeout` for the first one. An empty batch is not an error.
    fn fetch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<EventData>, FetchError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
