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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Correlation key of a delivered message, handed back on ack / fail.
///
/// Two ids are equal only when partition, offset and sequence number all
/// match, so an ack for a different copy of the same offset is not confused
/// with the one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub partition_id: i32,
    pub offset: i64,
    pub sequence_number: i64,
}

impl MessageId {
    pub fn new(partition_id: i32, offset: i64, sequence_number: i64) -> Self {
        Self {
            partition_id,
            offset,
            sequence_number,
        }
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.partition_id, self.offset, self.sequence_number
        )
    }
}

impl FromStr for MessageId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || AppError::InvalidValue(format!("message id: {}", s));
        let mut parts = s.split(':');
        let partition_id = parts.next().ok_or_else(error)?.parse().map_err(|_| error())?;
        let offset = parts.next().ok_or_else(error)?.parse().map_err(|_| error())?;
        let sequence_number = parts.next().ok_or_else(error)?.parse().map_err(|_| error())?;
        if parts.next().is_some() {
            return Err(error());
        }
        Ok(Self::new(partition_id, offset, sequence_number))
    }
}
