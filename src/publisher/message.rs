//! Wire format of everything a source sends to the coordinator.
//!
//! Messages are JSON encoded. Only `Data` messages consume a sequence number;
//! control messages carry the sequence the next data message will use.

use crate::error::Result;
use crate::pipeline::PipelineRecord;
use crate::types::{timestamp_from_ms, GuaranteeTier, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source availability announced through status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Online,
    Offline,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Online => write!(f, "online"),
            SourceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Periodic liveness beacon, independent of the tick loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub uptime_ms: u64,
    /// Sequence of the last data message handed to the publisher
    pub last_sequence: Option<u32>,
    /// Messages waiting in the retry queue
    pub backlog: usize,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Data { record: PipelineRecord },
    Heartbeat(HeartbeatInfo),
    Status { status: SourceStatus },
}

/// One message on the wire; immutable once built
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    source_id: SourceId,
    sequence: u32,
    tier: GuaranteeTier,
    sent_at: DateTime<Utc>,
    body: MessageBody,
}

impl OutboundMessage {
    pub fn new(
        source_id: SourceId,
        sequence: u32,
        tier: GuaranteeTier,
        body: MessageBody,
        now_ms: u64,
    ) -> Self {
        Self {
            source_id,
            sequence,
            tier,
            sent_at: timestamp_from_ms(now_ms),
            body,
        }
    }

    pub fn data(
        source_id: SourceId,
        sequence: u32,
        tier: GuaranteeTier,
        record: PipelineRecord,
        now_ms: u64,
    ) -> Self {
        Self::new(source_id, sequence, tier, MessageBody::Data { record }, now_ms)
    }

    pub fn heartbeat(source_id: SourceId, next_sequence: u32, info: HeartbeatInfo, now_ms: u64) -> Self {
        let body = MessageBody::Heartbeat(info);
        Self::new(source_id, next_sequence, GuaranteeTier::AtMostOnce, body, now_ms)
    }

    pub fn status(source_id: SourceId, next_sequence: u32, status: SourceStatus, now_ms: u64) -> Self {
        let body = MessageBody::Status { status };
        Self::new(source_id, next_sequence, GuaranteeTier::AtLeastOnce, body, now_ms)
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn tier(&self) -> GuaranteeTier {
        self.tier
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn into_body(self) -> MessageBody {
        self.body
    }

    pub fn is_data(&self) -> bool {
        matches!(self.body, MessageBody::Data { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageOutput;

    #[test]
    fn test_data_message_wire_shape() {
        let mut record = PipelineRecord::new(SourceId::new("cam2"), 7, 1_700_000_000_000);
        record.insert("motion", StageOutput::Motion { score: 0.25 });
        let msg = OutboundMessage::data(
            SourceId::new("cam2"),
            41,
            GuaranteeTier::AtLeastOnce,
            record,
            1_700_000_000_000,
        );

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["source_id"], "cam2");
        assert_eq!(value["sequence"], 41);
        assert_eq!(value["tier"], "at_least_once");
        assert_eq!(value["body"]["kind"], "data");

        let decoded = OutboundMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.is_data());
    }

    #[test]
    fn test_status_is_not_data() {
        let msg = OutboundMessage::status(SourceId::new("cam0"), 0, SourceStatus::Offline, 0);
        assert!(!msg.is_data());
        assert_eq!(
            msg.body(),
            &MessageBody::Status {
                status: SourceStatus::Offline
            }
        );
        assert_eq!(SourceStatus::Online.to_string(), "online");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(OutboundMessage::decode(b"not json").is_err());
    }
}
