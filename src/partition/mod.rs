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

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::reader::StartPosition;
use crate::utils::RetryPolicy;

pub use dead_letter::{DeadLetterHandler, DeadLetterMode, ForwardDeadLetters, LogAndDrop};
pub use manager::PartitionManager;
pub use tracker::{InFlightTracker, PendingMessage, TrackError};

mod dead_letter;
mod manager;
mod tracker;

/// Lifecycle of a partition manager.
///
/// ```text
/// Closed -> Opening -> Active <-> Paused
///              |         |          |
///              +------> Failed <----+
/// ```
/// Every state may go back to `Closed` through `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStatus {
    Closed,
    Opening,
    Active,
    /// Too many outstanding messages, no new events are fetched.
    Paused,
    Failed,
}

impl PartitionStatus {
    pub const fn can_transition_to(current: PartitionStatus, target: PartitionStatus) -> bool {
        match (current, target) {
            (_, PartitionStatus::Closed) => true,
            (PartitionStatus::Closed, PartitionStatus::Opening) => true,
            (PartitionStatus::Opening, PartitionStatus::Active) => true,
            (PartitionStatus::Opening, PartitionStatus::Failed) => true,
            (PartitionStatus::Active, PartitionStatus::Paused) => true,
            (PartitionStatus::Paused, PartitionStatus::Active) => true,
            (PartitionStatus::Active, PartitionStatus::Failed) => true,
            (PartitionStatus::Paused, PartitionStatus::Failed) => true,
            _ => false,
        }
    }

    /// Whether `pull` may hand out messages in this state.
    pub const fn is_running(self) -> bool {
        matches!(self, PartitionStatus::Active | PartitionStatus::Paused)
    }
}

impl Display for PartitionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionStatus::Closed => "closed",
            PartitionStatus::Opening => "opening",
            PartitionStatus::Active => "active",
            PartitionStatus::Paused => "paused",
            PartitionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-partition knobs, derived from the spout configuration.
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub batch_size: usize,
    pub receive_timeout: Duration,
    /// Used when the partition has no checkpoint yet.
    pub default_start: StartPosition,
    pub max_outstanding: usize,
    pub max_redelivery: u32,
    pub flush_interval: Duration,
    pub flush_threshold: i64,
    pub max_consecutive_fetch_errors: u32,
    pub connect_retry: RetryPolicy,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            receive_timeout: Duration::from_secs(1),
            default_start: StartPosition::Earliest,
            max_outstanding: 1024,
            max_redelivery: 5,
            flush_interval: Duration::from_secs(10),
            flush_threshold: 1000,
            max_consecutive_fetch_errors: 3,
            connect_retry: RetryPolicy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(10),
                5,
            ),
        }
    }
}
