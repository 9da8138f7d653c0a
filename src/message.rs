// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message types and queue messages.
//!
//! Every replay operation is keyed by a [`MessageType`]. Types belong to one
//! of two families, exposed through [`MessageType::mode()`]:
//!
//! | Family | Types | Replication strategy |
//! |--------|-------|----------------------|
//! | [`SyncMode::Cursor`] | `badlist`, `safelist`, `workflow` | monotonic checkpoint |
//! | [`SyncMode::Queue`] | `alert`, `submission`, `file` | admission + queue + completion |
//!
//! Operations check the family up front, so a checkpoint for `alert` or a
//! queue pull for `badlist` is rejected as `InvalidMessageType` before any
//! state is touched.

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replication strategy of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Incremental pull behind a checkpoint (small, mutable reference sets).
    Cursor,
    /// Explicit admission and per-document transfer (large, immutable artifacts).
    Queue,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Cursor => write!(f, "cursor"),
            SyncMode::Queue => write!(f, "queue"),
        }
    }
}

/// Replay message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Badlist,
    Safelist,
    Workflow,
    Alert,
    Submission,
    File,
}

impl MessageType {
    /// All message types, cursor family first.
    pub const ALL: [MessageType; 6] = [
        MessageType::Badlist,
        MessageType::Safelist,
        MessageType::Workflow,
        MessageType::Alert,
        MessageType::Submission,
        MessageType::File,
    ];

    /// Wire name (`"badlist"`, `"alert"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Badlist => "badlist",
            MessageType::Safelist => "safelist",
            MessageType::Workflow => "workflow",
            MessageType::Alert => "alert",
            MessageType::Submission => "submission",
            MessageType::File => "file",
        }
    }

    /// Which replication strategy this type uses.
    pub fn mode(&self) -> SyncMode {
        match self {
            MessageType::Badlist | MessageType::Safelist | MessageType::Workflow => {
                SyncMode::Cursor
            }
            MessageType::Alert | MessageType::Submission | MessageType::File => SyncMode::Queue,
        }
    }

    /// Cursor-family types.
    pub fn cursor_types() -> impl Iterator<Item = MessageType> {
        Self::ALL.into_iter().filter(|t| t.mode() == SyncMode::Cursor)
    }

    /// Queue-family types.
    pub fn queue_types() -> impl Iterator<Item = MessageType> {
        Self::ALL.into_iter().filter(|t| t.mode() == SyncMode::Queue)
    }

    /// Fail with `InvalidMessageType` unless this type uses `mode`.
    pub fn require(self, mode: SyncMode) -> Result<Self> {
        if self.mode() == mode {
            Ok(self)
        } else {
            Err(ReplayError::invalid_type(
                self.as_str(),
                format!("not a {} message type", mode),
            ))
        }
    }

    /// The index this type maps onto, for tracked document types.
    pub fn index(&self) -> Option<Index> {
        match self {
            MessageType::Alert => Some(Index::Alert),
            MessageType::Submission => Some(Index::Submission),
            _ => None,
        }
    }

    /// Payload fields that may carry the document identity, in priority order.
    fn id_fields(&self) -> &'static [&'static str] {
        match self {
            MessageType::Alert => &["alert_id", "id"],
            MessageType::Submission => &["sid", "id"],
            MessageType::File => &["sha256"],
            _ => &["id"],
        }
    }

    /// Extract the document identity from a message payload, if present.
    pub fn extract_doc_id(&self, payload: &serde_json::Value) -> Option<String> {
        self.id_fields()
            .iter()
            .find_map(|field| payload.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "badlist" => Ok(MessageType::Badlist),
            "safelist" => Ok(MessageType::Safelist),
            "workflow" => Ok(MessageType::Workflow),
            "alert" => Ok(MessageType::Alert),
            "submission" => Ok(MessageType::Submission),
            "file" => Ok(MessageType::File),
            _ => Err(ReplayError::invalid_type(s, "unknown message type")),
        }
    }
}

/// Document index whose entries are tracked through PendingRecords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Index {
    Alert,
    Submission,
}

impl Index {
    pub fn as_str(&self) -> &'static str {
        match self {
            Index::Alert => "alert",
            Index::Submission => "submission",
        }
    }

    /// Queue that carries this index's documents.
    pub fn message_type(&self) -> MessageType {
        match self {
            Index::Alert => MessageType::Alert,
            Index::Submission => MessageType::Submission,
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Index {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(Index::Alert),
            "submission" => Ok(Index::Submission),
            _ => Err(ReplayError::invalid_type(
                s,
                "index must be 'alert' or 'submission'",
            )),
        }
    }
}

/// A message carried by the transfer queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_type: MessageType,
    /// Document identity, when the payload carries one.
    pub doc_id: Option<String>,
    pub payload: serde_json::Value,
}

impl QueueMessage {
    /// Build a message, deriving `doc_id` from the payload.
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        let doc_id = message_type.extract_doc_id(&payload);
        Self {
            message_type,
            doc_id,
            payload,
        }
    }

    /// Message produced by bulk admission: a bare reference to the document.
    pub fn admitted(index: Index, doc_id: &str) -> Self {
        Self {
            message_type: index.message_type(),
            doc_id: Some(doc_id.to_string()),
            payload: serde_json::json!({ "index": index.as_str(), "id": doc_id }),
        }
    }

    /// The `(index, doc_id)` key this message refers to, for tracked types.
    pub fn tracked_key(&self) -> Option<(Index, &str)> {
        match (self.message_type.index(), self.doc_id.as_deref()) {
            (Some(index), Some(doc_id)) => Some((index, doc_id)),
            _ => None,
        }
    }
}

/// Proof of a lease on a queue message.
///
/// The delivery number changes on every lease, so a receipt from an expired
/// lease cannot acknowledge a message that another worker now holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    pub message_type: MessageType,
    pub id: i64,
    pub delivery: u32,
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.message_type, self.id, self.delivery)
    }
}

/// A leased message returned by `get_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: Receipt,
    pub message: QueueMessage,
}

impl Delivery {
    /// True when this message has been handed out before.
    pub fn is_redelivery(&self) -> bool {
        self.receipt.delivery > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_all_types() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert_eq!("  Alert ".parse::<MessageType>().unwrap(), MessageType::Alert);
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = "heuristic".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
    }

    #[test]
    fn test_families() {
        let cursor: Vec<_> = MessageType::cursor_types().collect();
        let queue: Vec<_> = MessageType::queue_types().collect();
        assert_eq!(
            cursor,
            vec![MessageType::Badlist, MessageType::Safelist, MessageType::Workflow]
        );
        assert_eq!(
            queue,
            vec![MessageType::Alert, MessageType::Submission, MessageType::File]
        );
    }

    #[test]
    fn test_require_mode() {
        assert!(MessageType::Badlist.require(SyncMode::Cursor).is_ok());
        let err = MessageType::Alert.require(SyncMode::Cursor).unwrap_err();
        assert!(err.to_string().contains("not a cursor message type"));
    }

    #[test]
    fn test_index_parse_and_mapping() {
        assert_eq!("submission".parse::<Index>().unwrap(), Index::Submission);
        assert!("file".parse::<Index>().is_err());
        assert_eq!(Index::Alert.message_type(), MessageType::Alert);
        assert_eq!(MessageType::Submission.index(), Some(Index::Submission));
        assert_eq!(MessageType::File.index(), None);
    }

    #[test]
    fn test_extract_doc_id() {
        assert_eq!(
            MessageType::Alert.extract_doc_id(&json!({"alert_id": "a1", "id": "x"})),
            Some("a1".to_string())
        );
        assert_eq!(
            MessageType::Submission.extract_doc_id(&json!({"sid": "s1"})),
            Some("s1".to_string())
        );
        assert_eq!(
            MessageType::File.extract_doc_id(&json!({"sha256": "ab"})),
            Some("ab".to_string())
        );
        assert_eq!(MessageType::File.extract_doc_id(&json!({"id": 5})), None);
    }

    #[test]
    fn test_admitted_message_is_tracked() {
        let msg = QueueMessage::admitted(Index::Alert, "a1");
        assert_eq!(msg.tracked_key(), Some((Index::Alert, "a1")));
        assert_eq!(msg.payload["index"], "alert");

        let file = QueueMessage::new(MessageType::File, json!({"sha256": "ab"}));
        assert_eq!(file.tracked_key(), None);
    }

    #[test]
    fn test_message_type_serde() {
        let json = serde_json::to_string(&MessageType::Workflow).unwrap();
        assert_eq!(json, "\"workflow\"");
        let parsed: MessageType = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(parsed, MessageType::File);
    }
}
