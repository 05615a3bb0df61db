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

//! The entry point of the processing engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::coordinator::PartitionCoordinator;
use crate::event::{EventDataScheme, MessageId, ReceivedMessage, Record};
use crate::partition::{
    DeadLetterHandler, DeadLetterMode, ForwardDeadLetters, LogAndDrop, PendingMessage,
};
use crate::reader::LogClient;
use crate::{AppResult, SpoutConfig};

/// Hands out messages from all owned partitions and routes their acks back.
///
/// `next_message` rotates over the partitions so a busy partition cannot
/// starve the others.
pub struct IngestionFrontend<C: LogClient, S: CheckpointStore> {
    coordinator: PartitionCoordinator<C, S>,
    scheme: Box<dyn EventDataScheme>,
    last_served: Mutex<Option<i32>>,
}

impl<C: LogClient, S: CheckpointStore> IngestionFrontend<C, S> {
    pub fn new(coordinator: PartitionCoordinator<C, S>, scheme: Box<dyn EventDataScheme>) -> Self {
        Self {
            coordinator,
            scheme,
            last_served: Mutex::new(None),
        }
    }

    /// Builds the frontend and its coordinator from configuration. With the
    /// `escalate` dead-letter mode the receiving end of the dead-letter
    /// channel is returned as well.
    pub fn from_config(
        config: &SpoutConfig,
        client: Arc<C>,
        store: Arc<S>,
    ) -> AppResult<(Self, Option<UnboundedReceiver<PendingMessage>>)> {
        let (dead_letter, dead_letters) = match config.partition.dead_letter {
            DeadLetterMode::LogAndDrop => {
                (Arc::new(LogAndDrop) as Arc<dyn DeadLetterHandler>, None)
            }
            DeadLetterMode::Escalate => {
                let (handler, receiver) = ForwardDeadLetters::channel();
                (Arc::new(handler) as Arc<dyn DeadLetterHandler>, Some(receiver))
            }
        };
        let coordinator = PartitionCoordinator::new(config, client, store, dead_letter)?;
        Ok((Self::new(coordinator, config.scheme.kind.build()), dead_letters))
    }

    /// Starts every owned partition.
    pub async fn open(&self) -> AppResult<()> {
        self.coordinator.start().await?;
        info!(
            partitions = ?self.coordinator.assignment().partitions(),
            fields = ?self.scheme.output_fields(),
            "ingestion frontend open"
        );
        Ok(())
    }

    /// Next message from any owned partition, or `None` if none had one.
    ///
    /// Errors only for coordinator level conditions, such as a partition
    /// that keeps failing after all its restarts.
    pub async fn next_message(&self) -> AppResult<Option<ReceivedMessage>> {
        self.coordinator.supervise().await?;

        let managers = self.coordinator.partition_managers();
        if managers.is_empty() {
            return Ok(None);
        }
        let last_served = *self.last_served.lock();
        let first = match last_served {
            Some(last) => managers
                .iter()
                .position(|manager| manager.partition_id() > last)
                .unwrap_or(0),
            None => 0,
        };

        for i in 0..managers.len() {
            let manager = &managers[(first + i) % managers.len()];
            if let Some(message) = manager.pull().await {
                *self.last_served.lock() = Some(manager.partition_id());
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    pub fn ack(&self, id: &MessageId) {
        match self.coordinator.manager_for(id.partition_id) {
            Some(manager) => manager.ack(id),
            None => debug!(%id, "ack for a partition not owned here"),
        }
    }

    pub fn fail(&self, id: &MessageId) {
        match self.coordinator.manager_for(id.partition_id) {
            Some(manager) => manager.fail(id),
            None => debug!(%id, "fail for a partition not owned here"),
        }
    }

    pub fn decode(&self, message: &ReceivedMessage) -> Record {
        self.scheme.decode(&message.event)
    }

    /// Collects and resets the metrics of every owned partition.
    pub fn metrics_snapshot(&self) -> BTreeMap<String, f64> {
        self.coordinator
            .partition_managers()
            .iter()
            .flat_map(|manager| {
                manager
                    .metrics()
                    .snapshot_and_reset(manager.partition_id())
            })
            .collect()
    }

    pub fn coordinator(&self) -> &PartitionCoordinator<C, S> {
        &self.coordinator
    }

    pub async fn close(&self) {
        self.coordinator.stop().await;
        info!("ingestion frontend closed");
    }
}
