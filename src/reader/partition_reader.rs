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

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::{ConnectError, FetchError, LogClient, LogConnection, StartPosition};
use crate::event::EventData;
use crate::metrics::PartitionMetrics;

/// A receiver bound to one partition.
///
/// The reader remembers the position right after the last event it returned,
/// so a dropped connection can be reopened without gaps or repeats.
pub struct PartitionReader<C: LogClient> {
    partition_id: i32,
    client: Arc<C>,
    connection: Option<C::Connection>,
    cursor: StartPosition,
    receive_timeout: Duration,
    metrics: Arc<PartitionMetrics>,
}

impl<C: LogClient> PartitionReader<C> {
    pub fn new(
        partition_id: i32,
        client: Arc<C>,
        receive_timeout: Duration,
        metrics: Arc<PartitionMetrics>,
    ) -> Self {
        Self {
            partition_id,
            client,
            connection: None,
            cursor: StartPosition::Earliest,
            receive_timeout,
            metrics,
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Position the next fetch continues from.
    pub fn cursor(&self) -> StartPosition {
        self.cursor
    }

    /// Opens a receiver at `start`, closing any receiver already open.
    pub async fn open(&mut self, start: StartPosition) -> Result<(), ConnectError> {
        if self.is_open() {
            self.close().await;
        }
        let connection = self.client.connect(self.partition_id, start).await?;
        info!(partition = self.partition_id, %start, "partition receiver opened");
        self.connection = Some(connection);
        self.cursor = start;
        Ok(())
    }

    /// Reopens at the cursor, after the last event handed out.
    pub async fn reopen(&mut self) -> Result<(), ConnectError> {
        self.open(self.cursor).await
    }

    /// Fetches up to `max_count` events. An empty batch means the receive
    /// timeout passed with nothing new.
    pub async fn fetch(&mut self, max_count: usize) -> Result<Vec<EventData>, FetchError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(FetchError::NotOpen(self.partition_id))?;

        let started = Instant::now();
        let result = connection.fetch(max_count, self.receive_timeout).await;
        self.metrics
            .receive_api_latency_mean
            .update(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics.receive_api_call_count.incr();

        let events = result?;
        if let Some(last) = events.last() {
            self.cursor = StartPosition::Offset(last.offset() + 1);
            self.metrics.receive_message_count.incr_by(events.len() as u64);
            debug!(
                monotonic_counter.spout_received_messages = events.len() as u64,
                partition = self.partition_id,
                next = last.offset() + 1,
                "received events"
            );
        } else {
            trace!(partition = self.partition_id, "fetch returned no events");
        }
        Ok(events)
    }

    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
            info!(partition = self.partition_id, "partition receiver closed");
        }
    }
}
