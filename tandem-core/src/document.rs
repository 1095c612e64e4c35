//! Versioned document snapshot.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;
use crate::transform;

/// Text plus the highest version folded into it.
///
/// A document that has never been written is `("", 0)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub version: u64,
}

impl Document {
    pub fn new(text: impl Into<String>, version: u64) -> Self {
        Self {
            text: text.into(),
            version,
        }
    }

    /// The empty version-0 document.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Apply `op` and advance the version to `max(version, op.version)`.
    pub fn apply(&mut self, op: &Operation) {
        transform::apply(&mut self.text, op);
        self.version = self.version.max(op.version());
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let doc = Document::empty();
        assert_eq!(doc.text, "");
        assert_eq!(doc.version, 0);
    }

    #[test]
    fn test_apply_advances_version_monotonically() {
        let mut doc = Document::new("abc", 5);
        doc.apply(&Operation::insert(3, "d", "c1", 7));
        assert_eq!(doc.text, "abcd");
        assert_eq!(doc.version, 7);

        doc.apply(&Operation::delete(0, 1, "c2", 2));
        assert_eq!(doc.text, "bcd");
        assert_eq!(doc.version, 7);
    }

    #[test]
    fn test_char_len() {
        assert_eq!(Document::new("héllo", 0).char_len(), 5);
    }
}
