//! Operational transform engine.
//!
//! Three pure functions over [`Operation`]s:
//!
//! ```text
//!   transform(a, b)          a' such that  apply(apply(s, b), a')  ≈  "a after b"
//!   apply(text, op)          splice op into text (positions clamped)
//!   generate_operations(..)  prefix/suffix diff → ≤1 Delete + ≤1 Insert
//! ```
//!
//! `transform` returns `None` when `a` is a delete whose whole span was already
//! removed by `b`. Callers drop such operations; they are never applied.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationKind};

/// How to order two inserts that target the same position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    /// The already-applied operation always lands first, so the rebased
    /// insert shifts right. Deterministic per replica but not symmetric:
    /// two replicas that see the pair in opposite orders each shift the
    /// other's insert.
    #[default]
    RemoteFirst,
    /// Lower origin client id lands first. Symmetric, so every replica
    /// orders the pair identically whichever arrives first.
    ClientOrder,
}

/// Rebase `a` against `b`, where `b` has already been applied to the state
/// `a` was computed against. Uses [`TieBreak::RemoteFirst`].
pub fn transform(a: &Operation, b: &Operation) -> Option<Operation> {
    transform_with(a, b, TieBreak::RemoteFirst)
}

/// [`transform`] with an explicit same-position insert tie-break.
pub fn transform_with(a: &Operation, b: &Operation, tie_break: TieBreak) -> Option<Operation> {
    // A client's own edits are already causally ordered.
    if a.same_origin(b) {
        return Some(a.clone());
    }

    match (a.kind(), b.kind()) {
        (OperationKind::Insert, OperationKind::Insert) => {
            let b_first = match tie_break {
                TieBreak::RemoteFirst => b.position() <= a.position(),
                TieBreak::ClientOrder => {
                    b.position() < a.position()
                        || (b.position() == a.position()
                            && b.origin_client_id() < a.origin_client_id())
                }
            };
            if b_first {
                Some(a.with_position(a.position() + b.length()))
            } else {
                Some(a.clone())
            }
        }

        (OperationKind::Insert, OperationKind::Delete) => {
            if b.end() <= a.position() {
                Some(a.with_position(a.position() - b.length()))
            } else if b.position() < a.position() {
                // Insert point was inside the deleted range.
                Some(a.with_position(b.position()))
            } else {
                Some(a.clone())
            }
        }

        (OperationKind::Delete, OperationKind::Insert) => {
            if b.position() <= a.position() {
                Some(a.with_position(a.position() + b.length()))
            } else if b.position() < a.end() {
                // Text landed inside the span; delete it too.
                Some(a.with_span(a.position(), a.length() + b.length()))
            } else {
                Some(a.clone())
            }
        }

        (OperationKind::Delete, OperationKind::Delete) => {
            let (a_start, a_end) = (a.position(), a.end());
            let (b_start, b_end) = (b.position(), b.end());

            if b_end <= a_start {
                return Some(a.with_position(a_start - b.length()));
            }
            if b_start >= a_end {
                return Some(a.clone());
            }
            if b_start <= a_start && b_end >= a_end {
                return None;
            }

            let overlap = a_end.min(b_end) - a_start.max(b_start);
            Some(a.with_span(a_start.min(b_start), a.length() - overlap))
        }
    }
}

/// Rebase `op` through every operation in `against`, in order.
///
/// Returns `None` as soon as any step invalidates it.
pub fn rebase<'a, I>(op: &Operation, against: I, tie_break: TieBreak) -> Option<Operation>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut current = op.clone();
    for applied in against {
        current = transform_with(&current, applied, tie_break)?;
    }
    Some(current)
}

/// Byte offset of the `char_pos`-th character, or `text.len()` past the end.
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Apply `op` to `text` in place.
///
/// The position is clamped to `[0, len(text)]` and a delete that runs past
/// the end is cut at the end, so stale operations never index out of range.
pub fn apply(text: &mut String, op: &Operation) {
    let char_len = text.chars().count();
    let position = op.position().min(char_len);

    if position != op.position() {
        log::debug!("Clamped {op} to position {position} (text has {char_len} chars)");
    }

    match op.kind() {
        OperationKind::Insert => {
            let at = byte_offset(text, position);
            text.insert_str(at, op.content());
        }
        OperationKind::Delete => {
            let end = (position + op.length()).min(char_len);
            if end == position {
                return;
            }
            let start_byte = byte_offset(text, position);
            let end_byte = byte_offset(text, end);
            text.replace_range(start_byte..end_byte, "");
        }
    }
}

/// Apply the result of a [`transform`]: `None` is a no-op.
pub fn apply_rebased(text: &mut String, op: Option<&Operation>) {
    if let Some(op) = op {
        apply(text, op);
    }
}

/// Diff two snapshots into at most one Delete followed by at most one Insert.
///
/// Strips the longest common prefix and then the longest common suffix of
/// what remains; the old middle becomes the delete and the new middle the
/// insert, both at the end of the prefix. Identical inputs produce nothing.
pub fn generate_operations(
    old_text: &str,
    new_text: &str,
    client_id: &str,
    version: u64,
) -> Vec<Operation> {
    if old_text == new_text {
        return Vec::new();
    }

    let old: Vec<char> = old_text.chars().collect();
    let new: Vec<char> = new_text.chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = (old.len() - prefix).min(new.len() - prefix);
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let deleted = old.len() - prefix - suffix;
    let inserted: String = new[prefix..new.len() - suffix].iter().collect();

    let mut ops = Vec::with_capacity(2);
    if deleted > 0 {
        ops.push(Operation::delete(prefix, deleted, client_id, version));
    }
    if !inserted.is_empty() {
        ops.push(Operation::insert(prefix, inserted, client_id, version));
    }
    ops
}
