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

//! Turning raw events into the field records handed to the processing engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EventData;

pub type Record = Map<String, Value>;

pub const MESSAGE_FIELD: &str = "message";
pub const METADATA_FIELD: &str = "metadata";
pub const SYSTEM_METADATA_FIELD: &str = "system_metadata";

/// Decodes an event into a named-field record.
///
/// Every record a scheme produces carries exactly the fields listed by
/// `output_fields`.
pub trait EventDataScheme: Send + Sync {
    fn decode(&self, event: &EventData) -> Record;

    fn output_fields(&self) -> &'static [&'static str];
}

/// Body as UTF-8 text plus the application properties.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScheme;

/// Like [`DefaultScheme`] with the system properties attached as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringScheme;

/// Body kept as raw bytes, for payloads that are not text.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryScheme;

fn body_text(event: &EventData) -> Value {
    Value::String(String::from_utf8_lossy(&event.body).into_owned())
}

fn application_properties(event: &EventData) -> Value {
    let properties = event
        .properties
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect::<Map<String, Value>>();
    Value::Object(properties)
}

fn system_properties(event: &EventData) -> Value {
    let system = &event.system_properties;
    let mut properties = Map::new();
    properties.insert("offset".to_string(), Value::from(system.offset));
    properties.insert(
        "sequence_number".to_string(),
        Value::from(system.sequence_number),
    );
    properties.insert(
        "enqueued_time".to_string(),
        Value::String(system.enqueued_time.to_rfc3339()),
    );
    properties.insert(
        "partition_key".to_string(),
        system
            .partition_key
            .as_ref()
            .map_or(Value::Null, |key| Value::String(key.clone())),
    );
    Value::Object(properties)
}

impl EventDataScheme for DefaultScheme {
    fn decode(&self, event: &EventData) -> Record {
        let mut record = Record::new();
        record.insert(MESSAGE_FIELD.to_string(), body_text(event));
        record.insert(METADATA_FIELD.to_string(), application_properties(event));
        record
    }

    fn output_fields(&self) -> &'static [&'static str] {
        &[MESSAGE_FIELD, METADATA_FIELD]
    }
}

impl EventDataScheme for StringScheme {
    fn decode(&self, event: &EventData) -> Record {
        let mut record = DefaultScheme.decode(event);
        record.insert(SYSTEM_METADATA_FIELD.to_string(), system_properties(event));
        record
    }

    fn output_fields(&self) -> &'static [&'static str] {
        &[MESSAGE_FIELD, METADATA_FIELD, SYSTEM_METADATA_FIELD]
    }
}

impl EventDataScheme for BinaryScheme {
    fn decode(&self, event: &EventData) -> Record {
        let bytes = event.body.iter().map(|b| Value::from(*b)).collect();
        let mut record = Record::new();
        record.insert(MESSAGE_FIELD.to_string(), Value::Array(bytes));
        record.insert(METADATA_FIELD.to_string(), application_properties(event));
        record
    }

    fn output_fields(&self) -> &'static [&'static str] {
        &[MESSAGE_FIELD, METADATA_FIELD]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    #[default]
    Default,
    String,
    Binary,
}

impl SchemeKind {
    pub fn build(self) -> Box<dyn EventDataScheme> {
        match self {
            SchemeKind::Default => Box::new(DefaultScheme),
            SchemeKind::String => Box::new(StringScheme),
            SchemeKind::Binary => Box::new(BinaryScheme),
        }
    }
}
