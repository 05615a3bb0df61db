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

//! Per-partition counters, read and reset by the periodic metrics report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct CountMetric(AtomicU64);

impl CountMetric {
    pub fn incr(&self) {
        self.incr_by(1);
    }

    pub fn incr_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn value_and_reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Running mean since the last reset.
#[derive(Debug, Default)]
pub struct MeanMetric(Mutex<(f64, u64)>);

impl MeanMetric {
    pub fn update(&self, value: f64) {
        let mut guard = self.0.lock();
        guard.0 += value;
        guard.1 += 1;
    }

    /// `None` when nothing was recorded since the last reset.
    pub fn value_and_reset(&self) -> Option<f64> {
        let (sum, count) = std::mem::take(&mut *self.0.lock());
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

#[derive(Debug, Default)]
pub struct PartitionMetrics {
    /// Millis spent in one fetch call against the log service.
    pub receive_api_latency_mean: MeanMetric,
    pub receive_api_call_count: CountMetric,
    pub receive_message_count: CountMetric,
    pub emitted: CountMetric,
    pub redelivered: CountMetric,
    pub acked: CountMetric,
    pub failed: CountMetric,
    pub dead_lettered: CountMetric,
    pub unknown_ids: CountMetric,
    pub fetch_errors: CountMetric,
    pub checkpoint_writes: CountMetric,
    pub checkpoint_write_errors: CountMetric,
}

impl PartitionMetrics {
    /// Drains every metric into `"<partition>/<name>"` entries.
    pub(crate) fn snapshot_and_reset(&self, partition_id: i32) -> BTreeMap<String, f64> {
        let mut snapshot = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            snapshot.insert(format!("{}/{}", partition_id, name), value);
        };

        if let Some(latency) = self.receive_api_latency_mean.value_and_reset() {
            put("receiveApiLatencyMean", latency);
        }
        let counters = [
            ("receiveApiCallCount", &self.receive_api_call_count),
            ("receiveMessageCount", &self.receive_message_count),
            ("emitted", &self.emitted),
            ("redelivered", &self.redelivered),
            ("acked", &self.acked),
            ("failed", &self.failed),
            ("deadLettered", &self.dead_lettered),
            ("unknownIds", &self.unknown_ids),
            ("fetchErrors", &self.fetch_errors),
            ("checkpointWrites", &self.checkpoint_writes),
            ("checkpointWriteErrors", &self.checkpoint_write_errors),
        ];
        for (name, counter) in counters {
            put(name, counter.value_and_reset() as f64);
        }
        snapshot
    }
}
