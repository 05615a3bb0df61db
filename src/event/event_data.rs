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

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::MessageId;

/// Properties stamped by the log service on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemProperties {
    pub offset: i64,
    pub sequence_number: i64,
    pub enqueued_time: DateTime<Utc>,
    pub partition_key: Option<String>,
}

/// A raw event as returned by a partition fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub system_properties: SystemProperties,
}

impl EventData {
    pub fn new(body: impl Into<Bytes>, offset: i64, sequence_number: i64) -> Self {
        Self {
            body: body.into(),
            properties: HashMap::new(),
            system_properties: SystemProperties {
                offset,
                sequence_number,
                enqueued_time: Utc::now(),
                partition_key: None,
            },
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_enqueued_time(mut self, enqueued_time: DateTime<Utc>) -> Self {
        self.system_properties.enqueued_time = enqueued_time;
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.system_properties.partition_key = Some(partition_key.into());
        self
    }

    pub fn offset(&self) -> i64 {
        self.system_properties.offset
    }

    pub fn sequence_number(&self) -> i64 {
        self.system_properties.sequence_number
    }

    pub fn message_id(&self, partition_id: i32) -> MessageId {
        MessageId::new(partition_id, self.offset(), self.sequence_number())
    }
}

/// What the processing engine receives from `next_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub event: EventData,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl ReceivedMessage {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
