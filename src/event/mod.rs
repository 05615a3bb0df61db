pub use event_data::{EventData, ReceivedMessage, SystemProperties};
pub use message_id::MessageId;
pub use scheme::{
    BinaryScheme, DefaultScheme, EventDataScheme, Record, SchemeKind, StringScheme,
    MESSAGE_FIELD, METADATA_FIELD, SYSTEM_METADATA_FIELD,
};

mod event_data;
mod message_id;
mod scheme;
