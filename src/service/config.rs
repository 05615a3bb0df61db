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

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointKeyspace;
use crate::coordinator::AssignmentStrategy;
use crate::event::SchemeKind;
use crate::partition::{DeadLetterMode, PartitionSettings};
use crate::reader::StartPosition;
use crate::utils::RetryPolicy;

use super::{AppError, AppResult};

/// Environment variables override file values, e.g. `SPOUT__RECEIVER__BATCH_SIZE=512`.
const ENV_PREFIX: &str = "SPOUT";
const ENV_SEPARATOR: &str = "__";

/// Identity of the event hub being consumed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventHubConfig {
    pub namespace: String,
    pub entity_path: String,
    pub consumer_group: String,
    /// Name of the consuming application, part of every checkpoint key.
    pub topology_name: String,
    pub partition_count: u32,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            namespace: "namespace".to_string(),
            entity_path: "entity".to_string(),
            consumer_group: "$Default".to_string(),
            topology_name: "spout".to_string(),
            partition_count: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPositionKind {
    #[default]
    Earliest,
    Latest,
    EnqueuedAfter,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Max events pulled from the log service in one fetch.
    pub batch_size: usize,
    /// How long a fetch waits for events before returning an empty batch.
    pub receive_timeout_ms: u64,
    /// Where a partition without a checkpoint starts reading.
    pub start_position: StartPositionKind,
    /// Epoch millis, only used with `enqueued_after`.
    pub enqueued_after_ms: Option<i64>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            receive_timeout_ms: 1000,
            start_position: StartPositionKind::Earliest,
            enqueued_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Backpressure bound on in-flight plus retry-queued messages.
    pub max_outstanding: usize,
    /// How many times a failed message is redelivered before dead-letter.
    pub max_redelivery: u32,
    pub dead_letter: DeadLetterMode,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 1024,
            max_redelivery: 5,
            dead_letter: DeadLetterMode::LogAndDrop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    File,
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Upper bound on checkpoint staleness.
    pub interval_ms: u64,
    /// A flush is requested once the safe checkpoint moved this many offsets.
    pub flush_threshold: i64,
    pub store: StoreKind,
    /// Root directory of the file store or the rocksdb database.
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            flush_threshold: 1000,
            store: StoreKind::File,
            path: "checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Connection attempts after the first one before a partition is failed.
    pub max_attempts: usize,
    /// Consecutive fetch errors tolerated before the reader is reopened.
    pub max_consecutive_fetch_errors: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            max_attempts: 5,
            max_consecutive_fetch_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub total_workers: u32,
    pub worker_index: u32,
    pub strategy: AssignmentStrategy,
    /// Restarts of a failed partition before the worker gives up.
    pub max_restarts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            total_workers: 1,
            worker_index: 0,
            strategy: AssignmentStrategy::Range,
            max_restarts: 3,
        }
    }
}

/// Local partitioned log consumed by the daemon, one `<partition>.jsonl` per partition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub dir: String,
    pub poll_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: "events".to_string(),
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemeConfig {
    pub kind: SchemeKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub log_dir: String,
    pub otlp_enabled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            otlp_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SpoutConfig {
    pub eventhub: EventHubConfig,
    pub receiver: ReceiverConfig,
    pub partition: PartitionConfig,
    pub checkpoint: CheckpointConfig,
    pub retry: RetryConfig,
    pub coordinator: CoordinatorConfig,
    pub source: SourceConfig,
    pub scheme: SchemeConfig,
    pub tracing: TracingConfig,
}

impl SpoutConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<SpoutConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR),
            )
            .build()?;

        let spout_config: SpoutConfig = config.try_deserialize()?;
        spout_config.validate()?;
        Ok(spout_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.eventhub.partition_count == 0 {
            return Err(AppError::InvalidValue(
                "eventhub.partition_count must be positive".to_string(),
            ));
        }
        if self.receiver.batch_size == 0 {
            return Err(AppError::InvalidValue(
                "receiver.batch_size must be positive".to_string(),
            ));
        }
        if self.partition.max_outstanding == 0 {
            return Err(AppError::InvalidValue(
                "partition.max_outstanding must be positive".to_string(),
            ));
        }
        if self.checkpoint.interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "checkpoint.interval_ms must be positive".to_string(),
            ));
        }
        if self.checkpoint.flush_threshold <= 0 {
            return Err(AppError::InvalidValue(
                "checkpoint.flush_threshold must be positive".to_string(),
            ));
        }
        if self.receiver.start_position == StartPositionKind::EnqueuedAfter {
            match self.receiver.enqueued_after_ms {
                None => {
                    return Err(AppError::InvalidValue(
                        "receiver.enqueued_after_ms is required with start_position = enqueued_after"
                            .to_string(),
                    ))
                }
                Some(ms) if DateTime::<Utc>::from_timestamp_millis(ms).is_none() => {
                    return Err(AppError::InvalidValue(format!(
                        "receiver.enqueued_after_ms {} is not a valid timestamp",
                        ms
                    )))
                }
                Some(_) => {}
            }
        }
        // total_workers / worker_index are checked when the assignment is computed
        Ok(())
    }

    pub fn start_position(&self) -> StartPosition {
        match self.receiver.start_position {
            StartPositionKind::Earliest => StartPosition::Earliest,
            StartPositionKind::Latest => StartPosition::Latest,
            StartPositionKind::EnqueuedAfter => self
                .receiver
                .enqueued_after_ms
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map_or(StartPosition::Earliest, StartPosition::EnqueuedAfter),
        }
    }

    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.retry.initial_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
            self.retry.max_attempts,
        )
    }

    pub fn partition_settings(&self) -> PartitionSettings {
        PartitionSettings {
            batch_size: self.receiver.batch_size,
            receive_timeout: Duration::from_millis(self.receiver.receive_timeout_ms),
            default_start: self.start_position(),
            max_outstanding: self.partition.max_outstanding,
            max_redelivery: self.partition.max_redelivery,
            flush_interval: Duration::from_millis(self.checkpoint.interval_ms),
            flush_threshold: self.checkpoint.flush_threshold,
            max_consecutive_fetch_errors: self.retry.max_consecutive_fetch_errors,
            connect_retry: self.connect_retry(),
        }
    }

    pub fn keyspace(&self) -> CheckpointKeyspace {
        CheckpointKeyspace::new(
            &self.eventhub.topology_name,
            &self.eventhub.namespace,
            &self.eventhub.entity_path,
        )
    }
}
