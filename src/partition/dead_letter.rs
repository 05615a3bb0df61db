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

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::PendingMessage;

/// Receives messages that used up their redelivery budget.
///
/// Called synchronously from `fail`, outside the partition lock. The message
/// is already resolved and will not be delivered again.
pub trait DeadLetterHandler: Send + Sync + Debug {
    fn handle(&self, message: PendingMessage);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterMode {
    #[default]
    LogAndDrop,
    Escalate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndDrop;

impl DeadLetterHandler for LogAndDrop {
    fn handle(&self, message: PendingMessage) {
        warn!(
            id = %message.id,
            deliveries = message.delivery_count,
            bytes = message.event.body.len(),
            "dropping message after its last redelivery"
        );
    }
}

/// Forwards dead letters to a channel drained by the application.
#[derive(Debug, Clone)]
pub struct ForwardDeadLetters {
    sender: mpsc::UnboundedSender<PendingMessage>,
}

impl ForwardDeadLetters {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PendingMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeadLetterHandler for ForwardDeadLetters {
    fn handle(&self, message: PendingMessage) {
        if let Err(e) = self.sender.send(message) {
            error!(id = %e.0.id, "dead letter receiver is gone, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;

    #[test]
    fn forward_hands_messages_over() {
        let (handler, mut receiver) = ForwardDeadLetters::channel();
        let event = EventData::new("poison", 3, 3);
        handler.handle(PendingMessage::new(event.message_id(1), event));

        let message = receiver.try_recv().unwrap();
        assert_eq!(message.id.offset, 3);
        assert_eq!(message.id.partition_id, 1);
    }

    #[test]
    fn forward_survives_a_dropped_receiver() {
        let (handler, receiver) = ForwardDeadLetters::channel();
        drop(receiver);
        let event = EventData::new("poison", 0, 0);
        handler.handle(PendingMessage::new(event.message_id(0), event));
    }
}
