//! Wire formats for the change feed.
//!
//! [`OperationRecord`] is the loosely-typed shape an operation takes when it
//! leaves the process: signed integers and optional payloads, exactly what an
//! external log might hand back. It becomes a typed
//! [`Operation`] only through validation.
//!
//! [`FeedMessage`] frames travel between [`WsFeed`](crate::ws_feed::WsFeed)
//! and the [`RelayServer`](crate::relay::RelayServer), bincode-encoded:
//!
//! ```text
//! client                          relay
//!   │ Subscribe{doc}               │
//!   │ ───────────────────────────► │
//!   │ Append{req, doc, record}     │
//!   │ ───────────────────────────► │ log + broadcast
//!   │ ◄─────────────────────────── │ Ack{req} | Nack{req, reason}
//!   │ ◄─────────────────────────── │ Operation{doc, record}   (to every subscriber)
//!   │ FetchHistory{req, doc}       │
//!   │ ───────────────────────────► │
//!   │ ◄─────────────────────────── │ History{req, records}
//! ```

use serde::{Deserialize, Serialize};
use tandem_core::{Operation, OperationError, OperationKind};

/// An operation as stored in, and broadcast by, the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// `"insert"` or `"delete"`
    pub kind: String,
    pub position: i64,
    /// Inserted text (inserts only)
    pub content: Option<String>,
    /// Deleted character count (deletes only)
    pub length: Option<i64>,
    pub client_id: String,
    pub version: u64,
}

impl OperationRecord {
    /// Validate into a typed operation.
    pub fn to_operation(&self) -> Result<Operation, OperationError> {
        Operation::from_parts(
            &self.kind,
            self.position,
            self.content.clone(),
            self.length,
            self.client_id.clone(),
            self.version,
        )
    }
}

impl From<&Operation> for OperationRecord {
    fn from(op: &Operation) -> Self {
        let (content, length) = match op.kind() {
            OperationKind::Insert => (Some(op.content().to_string()), None),
            OperationKind::Delete => (None, Some(op.length() as i64)),
        };
        Self {
            kind: op.kind().as_str().to_string(),
            position: op.position() as i64,
            content,
            length,
            client_id: op.origin_client_id().to_string(),
            version: op.version(),
        }
    }
}

impl TryFrom<OperationRecord> for Operation {
    type Error = OperationError;

    fn try_from(record: OperationRecord) -> Result<Self, Self::Error> {
        Operation::from_parts(
            &record.kind,
            record.position,
            record.content,
            record.length,
            record.client_id,
            record.version,
        )
    }
}

/// Frames exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedMessage {
    /// Start receiving `Operation` frames for a document
    Subscribe { document_id: String },
    /// Stop receiving `Operation` frames for a document
    Unsubscribe { document_id: String },
    /// Append a record to a document's log
    Append {
        request_id: u64,
        document_id: String,
        record: OperationRecord,
    },
    /// Append accepted
    Ack { request_id: u64 },
    /// Append rejected
    Nack { request_id: u64, reason: String },
    /// A record appended by anyone (including the receiver)
    Operation {
        document_id: String,
        record: OperationRecord,
    },
    /// Request the full log of a document
    FetchHistory { request_id: u64, document_id: String },
    /// Log contents, oldest first
    History {
        request_id: u64,
        records: Vec<OperationRecord>,
    },
}

impl FeedMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Request id for request/response frames.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            FeedMessage::Append { request_id, .. }
            | FeedMessage::Ack { request_id }
            | FeedMessage::Nack { request_id, .. }
            | FeedMessage::FetchHistory { request_id, .. }
            | FeedMessage::History { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_record() -> OperationRecord {
        OperationRecord {
            kind: "insert".into(),
            position: 6,
            content: Some("beautiful ".into()),
            length: None,
            client_id: "alice".into(),
            version: 1,
        }
    }

    #[test]
    fn test_record_from_insert() {
        let op = Operation::insert(6, "beautiful ", "alice", 1);
        let record = OperationRecord::from(&op);
        assert_eq!(record, insert_record());
    }

    #[test]
    fn test_record_from_delete() {
        let op = Operation::delete(3, 4, "bob", 9);
        let record = OperationRecord::from(&op);
        assert_eq!(record.kind, "delete");
        assert_eq!(record.content, None);
        assert_eq!(record.length, Some(4));
        assert_eq!(record.version, 9);
    }

    #[test]
    fn test_record_to_operation() {
        let op = insert_record().to_operation().unwrap();
        assert!(op.is_insert());
        assert_eq!(op.position(), 6);
        assert_eq!(op.content(), "beautiful ");
        assert_eq!(op.origin_client_id(), "alice");
    }

    #[test]
    fn test_malformed_record_rejected() {
        let mut record = insert_record();
        record.position = -3;
        assert_eq!(
            Operation::try_from(record).unwrap_err(),
            OperationError::NegativePosition(-3)
        );

        let record = OperationRecord {
            kind: "delete".into(),
            position: 0,
            content: None,
            length: None,
            client_id: "bob".into(),
            version: 1,
        };
        assert_eq!(record.to_operation().unwrap_err(), OperationError::MissingLength);
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(insert_record()).unwrap();
        assert_eq!(json["kind"], "insert");
        assert_eq!(json["position"], 6);
        assert_eq!(json["content"], "beautiful ");
        assert!(json["length"].is_null());
        assert_eq!(json["client_id"], "alice");
    }

    #[test]
    fn test_append_frame_roundtrip() {
        let msg = FeedMessage::Append {
            request_id: 7,
            document_id: "doc-1".into(),
            record: insert_record(),
        };
        let decoded = FeedMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.request_id(), Some(7));
    }

    #[test]
    fn test_history_frame_roundtrip() {
        let msg = FeedMessage::History {
            request_id: 3,
            records: vec![insert_record(), insert_record()],
        };
        let decoded = FeedMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unrelated_frames_have_no_request_id() {
        assert_eq!(
            FeedMessage::Subscribe {
                document_id: "d".into()
            }
            .request_id(),
            None
        );
        assert_eq!(
            FeedMessage::Unsubscribe {
                document_id: "d".into()
            }
            .request_id(),
            None
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(FeedMessage::decode(&garbage).is_err());
    }
}
