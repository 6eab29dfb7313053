use serde::{Deserialize, Serialize};

/// Wire-level unit written to every pipeline topic.
///
/// Serialized as JSON `{"content": "...", "timestamp": 1700000000000}` with a
/// null record key. Built once per input message by the publisher and never
/// touched again: the relay forwards the raw bytes without parsing them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Caller-supplied message text
    pub content: String,

    /// Producer wall-clock time at construction, epoch milliseconds
    pub timestamp: i64,
}

impl Payload {
    /// Create a payload stamped with the current time
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A committed record read from a staging topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Raw record value, forwarded byte-for-byte
    pub payload: Vec<u8>,
}

impl StagedRecord {
    /// Offset to commit once this record has been relayed
    ///
    /// Kafka group offsets name the next record to read, not the last one read.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    pub fn offset_commit(&self) -> OffsetCommit {
        OffsetCommit {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.next_offset(),
        }
    }
}

/// Consumer-group offset staged inside a relay transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Where a produced record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}
