//! Edit operations.
//!
//! An [`Operation`] is one immutable edit against a plain-text buffer: either
//! an insert of some content at a position, or a delete of a run of
//! characters starting at a position. Every operation carries the id of the
//! client that produced it and that client's causal version.
//!
//! Positions and lengths count Unicode scalar values (`char`s), not bytes.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// The two edit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
}

impl OperationKind {
    /// Wire name (`"insert"` / `"delete"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Delete => "delete",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Result<Self, OperationError> {
        match name {
            "insert" => Ok(OperationKind::Insert),
            "delete" => Ok(OperationKind::Delete),
            other => Err(OperationError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single insert or delete.
///
/// Fields are private; the only way to obtain an operation is through
/// [`Operation::insert`], [`Operation::delete`], [`Operation::from_parts`]
/// or the transform engine, so an `Insert` always has `length ==
/// content.chars().count()` and a `Delete` always has empty content.
/// There are no serde impls: serialized forms come back in through
/// `from_parts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    position: usize,
    content: String,
    length: usize,
    origin_client_id: String,
    version: u64,
    created_at: Timestamp,
}

impl Operation {
    /// Insert `content` at `position`.
    pub fn insert(
        position: usize,
        content: impl Into<String>,
        client_id: impl Into<String>,
        version: u64,
    ) -> Self {
        let content = content.into();
        let length = content.chars().count();
        Self {
            kind: OperationKind::Insert,
            position,
            content,
            length,
            origin_client_id: client_id.into(),
            version,
            created_at: now_millis(),
        }
    }

    /// Delete `length` characters starting at `position`.
    pub fn delete(position: usize, length: usize, client_id: impl Into<String>, version: u64) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            content: String::new(),
            length,
            origin_client_id: client_id.into(),
            version,
            created_at: now_millis(),
        }
    }

    /// Build an operation from untrusted, loosely-typed parts (e.g. a record
    /// read off the change feed).
    ///
    /// Rejects negative positions and lengths, a missing payload for the
    /// given kind, empty edits and an empty client id. Nothing is mutated on
    /// rejection.
    pub fn from_parts(
        kind: &str,
        position: i64,
        content: Option<String>,
        length: Option<i64>,
        client_id: impl Into<String>,
        version: u64,
    ) -> Result<Self, OperationError> {
        let kind = OperationKind::parse(kind)?;
        let client_id = client_id.into();
        if client_id.is_empty() {
            return Err(OperationError::MissingClientId);
        }
        let position =
            usize::try_from(position).map_err(|_| OperationError::NegativePosition(position))?;

        match kind {
            OperationKind::Insert => {
                let content = content.ok_or(OperationError::MissingContent)?;
                if content.is_empty() {
                    return Err(OperationError::EmptyEdit(kind));
                }
                Ok(Self::insert(position, content, client_id, version))
            }
            OperationKind::Delete => {
                let length = length.ok_or(OperationError::MissingLength)?;
                let length =
                    usize::try_from(length).map_err(|_| OperationError::NegativeLength(length))?;
                if length == 0 {
                    return Err(OperationError::EmptyEdit(kind));
                }
                Ok(Self::delete(position, length, client_id, version))
            }
        }
    }

    /// Same operation with a different creation timestamp.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    pub(crate) fn with_position(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    pub(crate) fn with_span(&self, position: usize, length: usize) -> Self {
        debug_assert_eq!(self.kind, OperationKind::Delete);
        Self {
            position,
            length,
            ..self.clone()
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_insert(&self) -> bool {
        self.kind == OperationKind::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Inserted text. Empty for deletes.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Number of characters inserted or deleted.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Exclusive end of the affected span (`position + length`).
    pub fn end(&self) -> usize {
        self.position + self.length
    }

    pub fn origin_client_id(&self) -> &str {
        &self.origin_client_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Whether applying this operation would change nothing.
    pub fn is_noop(&self) -> bool {
        self.length == 0
    }

    /// Whether both operations come from the same client.
    pub fn same_origin(&self, other: &Operation) -> bool {
        self.origin_client_id == other.origin_client_id
    }

    /// Same edit from the same client, ignoring when each copy was stamped.
    pub fn same_edit(&self, other: &Operation) -> bool {
        self.kind == other.kind
            && self.position == other.position
            && self.length == other.length
            && self.content == other.content
            && self.origin_client_id == other.origin_client_id
            && self.version == other.version
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            OperationKind::Insert => write!(
                f,
                "insert({}, {:?}) from {}@{}",
                self.position, self.content, self.origin_client_id, self.version
            ),
            OperationKind::Delete => write!(
                f,
                "delete({}, {}) from {}@{}",
                self.position, self.length, self.origin_client_id, self.version
            ),
        }
    }
}

/// Validation errors for malformed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Kind was neither `insert` nor `delete`
    UnknownKind(String),
    /// Position below zero
    NegativePosition(i64),
    /// Delete length below zero
    NegativeLength(i64),
    /// Insert without content
    MissingContent,
    /// Delete without length
    MissingLength,
    /// Insert of empty content or delete of zero characters
    EmptyEdit(OperationKind),
    /// No originating client
    MissingClientId,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKind(kind) => write!(f, "Unknown operation kind: {kind:?}"),
            Self::NegativePosition(p) => write!(f, "Negative position: {p}"),
            Self::NegativeLength(l) => write!(f, "Negative length: {l}"),
            Self::MissingContent => write!(f, "Insert operation without content"),
            Self::MissingLength => write!(f, "Delete operation without length"),
            Self::EmptyEdit(kind) => write!(f, "Empty {kind} operation"),
            Self::MissingClientId => write!(f, "Operation without origin client id"),
        }
    }
}

impl std::error::Error for OperationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_derives_length_in_chars() {
        let op = Operation::insert(3, "héllo", "alice", 1);
        assert_eq!(op.kind(), OperationKind::Insert);
        assert_eq!(op.length(), 5);
        assert_eq!(op.end(), 8);
        assert_eq!(op.origin_client_id(), "alice");
    }

    #[test]
    fn test_delete_has_no_content() {
        let op = Operation::delete(2, 4, "bob", 7);
        assert!(op.is_delete());
        assert!(op.content().is_empty());
        assert_eq!(op.length(), 4);
        assert_eq!(op.version(), 7);
    }

    #[test]
    fn test_from_parts_valid_insert() {
        let op = Operation::from_parts("insert", 4, Some("abc".into()), None, "c1", 2).unwrap();
        assert!(op.is_insert());
        assert_eq!(op.position(), 4);
        assert_eq!(op.content(), "abc");
    }

    #[test]
    fn test_from_parts_valid_delete_ignores_content() {
        let op = Operation::from_parts("delete", 0, Some("junk".into()), Some(3), "c1", 2).unwrap();
        assert!(op.is_delete());
        assert_eq!(op.content(), "");
        assert_eq!(op.length(), 3);
    }

    #[test]
    fn test_from_parts_rejects_negative_position() {
        let err = Operation::from_parts("insert", -1, Some("x".into()), None, "c1", 1).unwrap_err();
        assert_eq!(err, OperationError::NegativePosition(-1));
    }

    #[test]
    fn test_from_parts_rejects_negative_length() {
        let err = Operation::from_parts("delete", 0, None, Some(-4), "c1", 1).unwrap_err();
        assert_eq!(err, OperationError::NegativeLength(-4));
    }

    #[test]
    fn test_from_parts_rejects_missing_payload() {
        assert_eq!(
            Operation::from_parts("insert", 0, None, Some(1), "c1", 1).unwrap_err(),
            OperationError::MissingContent
        );
        assert_eq!(
            Operation::from_parts("delete", 0, Some("x".into()), None, "c1", 1).unwrap_err(),
            OperationError::MissingLength
        );
    }

    #[test]
    fn test_from_parts_rejects_empty_edits() {
        assert_eq!(
            Operation::from_parts("insert", 0, Some(String::new()), None, "c1", 1).unwrap_err(),
            OperationError::EmptyEdit(OperationKind::Insert)
        );
        assert_eq!(
            Operation::from_parts("delete", 0, None, Some(0), "c1", 1).unwrap_err(),
            OperationError::EmptyEdit(OperationKind::Delete)
        );
    }

    #[test]
    fn test_from_parts_rejects_unknown_kind_and_client() {
        assert!(matches!(
            Operation::from_parts("replace", 0, None, None, "c1", 1),
            Err(OperationError::UnknownKind(_))
        ));
        assert_eq!(
            Operation::from_parts("insert", 0, Some("x".into()), None, "", 1).unwrap_err(),
            OperationError::MissingClientId
        );
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&OperationKind::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }

    #[test]
    fn test_from_parts_derives_insert_length_from_content() {
        let op = Operation::from_parts("insert", 0, Some("abc".into()), Some(5), "c1", 1).unwrap();
        assert_eq!(op.length(), 3);
        assert_eq!(op.end(), 3);
    }

    #[test]
    fn test_same_edit_ignores_timestamp() {
        let op = Operation::insert(4, "ab", "c1", 2).with_created_at(1);
        assert!(op.same_edit(&op.clone().with_created_at(99)));
        assert!(!op.same_edit(&Operation::insert(4, "ab", "c1", 3)));
        assert!(!op.same_edit(&Operation::insert(4, "ab", "c2", 2)));
        assert!(!op.same_edit(&Operation::delete(4, 2, "c1", 2)));
    }

    #[test]
    fn test_with_created_at_overrides_timestamp() {
        let op = Operation::insert(0, "a", "c1", 1).with_created_at(42);
        assert_eq!(op.created_at(), 42);
    }

    #[test]
    fn test_display() {
        let op = Operation::delete(1, 2, "c1", 3);
        assert_eq!(op.to_string(), "delete(1, 2) from c1@3");
    }
}
