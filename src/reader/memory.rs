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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ConnectError, FetchError, LogClient, LogConnection, StartPosition};
use crate::event::EventData;

#[derive(Debug, Default)]
struct MemoryPartition {
    events: RwLock<Vec<EventData>>,
    appended: Notify,
    connect_failures: AtomicU32,
    fetch_failures: AtomicU32,
    connects: Mutex<Vec<StartPosition>>,
}

/// Consumes one injected failure, if any are left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// An in-process partitioned log.
///
/// Offsets start at the base offset and grow by one per event. Connect and
/// fetch failures can be injected per partition.
#[derive(Debug, Default)]
pub struct MemoryLogClient {
    partitions: DashMap<i32, Arc<MemoryPartition>>,
    base_offset: i64,
}

impl MemoryLogClient {
    pub fn new(partition_count: u32) -> Self {
        let partitions = DashMap::new();
        for partition_id in 0..partition_count as i32 {
            partitions.insert(partition_id, Arc::new(MemoryPartition::default()));
        }
        Self {
            partitions,
            base_offset: 0,
        }
    }

    pub fn with_base_offset(mut self, base_offset: i64) -> Self {
        self.base_offset = base_offset;
        self
    }

    fn partition(&self, partition_id: i32) -> Arc<MemoryPartition> {
        self.partitions.entry(partition_id).or_default().clone()
    }

    fn push(&self, partition_id: i32, build: impl FnOnce(EventData) -> EventData) -> i64 {
        let partition = self.partition(partition_id);
        let offset = {
            let mut events = partition.events.write();
            let index = events.len() as i64;
            let offset = self.base_offset + index;
            events.push(build(EventData::new(Bytes::new(), offset, index)));
            offset
        };
        partition.appended.notify_waiters();
        offset
    }

    /// Appends events and returns the offset of the last one.
    pub fn append<I, B>(&self, partition_id: i32, bodies: I) -> Option<i64>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut last = None;
        for body in bodies {
            let body = body.into();
            last = Some(self.push(partition_id, |event| EventData { body, ..event }));
        }
        last
    }

    pub fn append_with_properties(
        &self,
        partition_id: i32,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> i64 {
        let body = body.into();
        self.push(partition_id, |event| EventData {
            body,
            properties,
            ..event
        })
    }

    pub fn append_enqueued_at(
        &self,
        partition_id: i32,
        body: impl Into<Bytes>,
        enqueued_time: DateTime<Utc>,
    ) -> i64 {
        let body = body.into();
        self.push(partition_id, |event| {
            EventData { body, ..event }.with_enqueued_time(enqueued_time)
        })
    }

    /// The next `n` connects to the partition fail.
    pub fn fail_next_connects(&self, partition_id: i32, n: u32) {
        self.partition(partition_id)
            .connect_failures
            .store(n, Ordering::Release);
    }

    /// The next `n` fetches on the partition fail, across all connections.
    pub fn fail_next_fetches(&self, partition_id: i32, n: u32) {
        self.partition(partition_id)
            .fetch_failures
            .store(n, Ordering::Release);
    }

    /// Start positions of every successful connect, oldest first.
    pub fn connect_history(&self, partition_id: i32) -> Vec<StartPosition> {
        self.partitions
            .get(&partition_id)
            .map(|partition| partition.connects.lock().clone())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    partition_id: i32,
    partition: Arc<MemoryPartition>,
    next_index: usize,
    closed: bool,
}

impl LogClient for MemoryLogClient {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        partition_id: i32,
        start: StartPosition,
    ) -> Result<Self::Connection, ConnectError> {
        let partition = self
            .partitions
            .get(&partition_id)
            .map(|partition| partition.clone())
            .ok_or(ConnectError::UnknownPartition(partition_id))?;

        if take_failure(&partition.connect_failures) {
            return Err(ConnectError::Unreachable {
                partition_id,
                reason: "injected connect failure".to_string(),
            });
        }

        let next_index = {
            let events = partition.events.read();
            match start {
                StartPosition::Offset(offset) => (offset - self.base_offset).max(0) as usize,
                StartPosition::Earliest => 0,
                StartPosition::Latest => events.len(),
                StartPosition::EnqueuedAfter(time) => events
                    .iter()
                    .position(|event| event.system_properties.enqueued_time > time)
                    .unwrap_or(events.len()),
            }
        };
        partition.connects.lock().push(start);

        Ok(MemoryConnection {
            partition_id,
            partition,
            next_index,
            closed: false,
        })
    }
}

impl MemoryConnection {
    fn read_available(&mut self, max_count: usize) -> Vec<EventData> {
        let events = self.partition.events.read();
        let batch: Vec<EventData> = events
            .iter()
            .skip(self.next_index)
            .take(max_count)
            .cloned()
            .collect();
        self.next_index += batch.len();
        batch
    }
}

impl LogConnection for MemoryConnection {
    async fn fetch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<EventData>, FetchError> {
        if self.closed {
            return Err(FetchError::NotOpen(self.partition_id));
        }
        if take_failure(&self.partition.fetch_failures) {
            return Err(FetchError::Transport {
                partition_id: self.partition_id,
                reason: "injected fetch failure".to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        let partition = self.partition.clone();
        loop {
            let notified = partition.appended.notified();
            tokio::pin!(notified);
            // register before looking, so an append in between still wakes us
            notified.as_mut().enable();

            let batch = self.read_available(max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
