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

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::event::{EventData, MessageId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("message {0} is already in flight")]
    DuplicateTrack(MessageId),
    #[error("message {0} is not in flight")]
    UnknownId(MessageId),
    #[error("message {id} is at or below checkpoint {checkpoint}")]
    Stale { id: MessageId, checkpoint: i64 },
}

/// A delivered message that is not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: MessageId,
    pub enqueued_at: DateTime<Utc>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub event: EventData,
}

impl PendingMessage {
    pub fn new(id: MessageId, event: EventData) -> Self {
        Self {
            id,
            enqueued_at: Utc::now(),
            delivery_count: 1,
            event,
        }
    }

    /// The same message, handed out once more.
    pub fn redelivery(mut self) -> Self {
        self.delivery_count += 1;
        self.enqueued_at = Utc::now();
        self
    }
}

/// Outstanding messages of one partition and the checkpoint they allow.
///
/// An offset is *outstanding* while it is in flight or parked for
/// redelivery, and *resolved* once acked or dead-lettered. The safe
/// checkpoint is the largest resolved offset below every outstanding one,
/// so resuming at `checkpoint + 1` never skips an unresolved message.
/// Offsets may have gaps; only offsets that were tracked count.
#[derive(Debug)]
pub struct InFlightTracker {
    partition_id: i32,
    checkpoint: Option<i64>,
    in_flight: BTreeMap<i64, PendingMessage>,
    parked: BTreeMap<i64, MessageId>,
    /// Resolved offsets above the checkpoint, waiting for the gap below to close.
    resolved: BTreeSet<i64>,
}

impl InFlightTracker {
    pub fn new(partition_id: i32, checkpoint: Option<i64>) -> Self {
        Self {
            partition_id,
            checkpoint,
            in_flight: BTreeMap::new(),
            parked: BTreeMap::new(),
            resolved: BTreeSet::new(),
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn safe_checkpoint(&self) -> Option<i64> {
        self.checkpoint
    }

    /// In flight plus parked for redelivery.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len() + self.parked.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_tracked(&self, id: &MessageId) -> bool {
        self.in_flight.get(&id.offset).is_some_and(|p| p.id == *id)
            || self.parked.get(&id.offset) == Some(id)
    }

    fn is_stale(&self, offset: i64) -> Option<i64> {
        self.checkpoint.filter(|checkpoint| offset <= *checkpoint)
    }

    pub fn track(&mut self, pending: PendingMessage) -> Result<(), TrackError> {
        let id = pending.id;
        if let Some(checkpoint) = self.is_stale(id.offset) {
            return Err(TrackError::Stale { id, checkpoint });
        }
        if self.in_flight.contains_key(&id.offset) || self.resolved.contains(&id.offset) {
            return Err(TrackError::DuplicateTrack(id));
        }
        self.parked.remove(&id.offset);
        self.in_flight.insert(id.offset, pending);
        Ok(())
    }

    pub fn acknowledge(&mut self, id: &MessageId) -> Result<(), TrackError> {
        if self.is_stale(id.offset).is_some() {
            return Ok(());
        }
        match self.in_flight.get(&id.offset) {
            Some(pending) if pending.id == *id => {}
            _ => return Err(TrackError::UnknownId(*id)),
        }
        self.in_flight.remove(&id.offset);
        self.resolved.insert(id.offset);
        self.advance();
        Ok(())
    }

    /// Parks an in-flight message for redelivery and hands it back.
    /// Parked messages still hold the checkpoint back.
    pub fn mark_failed(&mut self, id: &MessageId) -> Result<Option<PendingMessage>, TrackError> {
        if self.is_stale(id.offset).is_some() {
            return Ok(None);
        }
        match self.in_flight.get(&id.offset) {
            Some(pending) if pending.id == *id => {}
            _ => return Err(TrackError::UnknownId(*id)),
        }
        let pending = self.in_flight.remove(&id.offset);
        self.parked.insert(id.offset, *id);
        Ok(pending)
    }

    /// Resolves a parked message without delivering it again.
    pub fn abandon(&mut self, id: &MessageId) -> Result<(), TrackError> {
        if self.is_stale(id.offset).is_some() {
            return Ok(());
        }
        if self.parked.get(&id.offset) != Some(id) {
            return Err(TrackError::UnknownId(*id));
        }
        self.parked.remove(&id.offset);
        self.resolved.insert(id.offset);
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        let floor = match (self.in_flight.keys().next(), self.parked.keys().next()) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (Some(a), None) => Some(*a),
            (None, Some(b)) => Some(*b),
            (None, None) => None,
        };
        let candidate = match floor {
            Some(floor) => self.resolved.range(..floor).next_back().copied(),
            None => self.resolved.last().copied(),
        };
        let Some(candidate) = candidate else {
            return;
        };
        if self.checkpoint.map_or(true, |checkpoint| candidate > checkpoint) {
            self.checkpoint = Some(candidate);
        }
        self.resolved = self.resolved.split_off(&(candidate + 1));
    }

    /// Drops everything outstanding, e.g. when the partition is stopped.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.parked.clear();
        self.resolved.clear();
    }
}
