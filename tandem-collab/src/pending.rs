//! Queue of local operations applied optimistically but not yet seen back
//! on the feed.

use std::collections::VecDeque;

use tandem_core::Operation;

#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// Local sequence number, unique per coordinator
    pub seq: u64,
    pub operation: Operation,
    /// The feed accepted it but its echo has not arrived yet
    pub acknowledged: bool,
}

/// Pending operations in generation order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<PendingOperation>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation and return its sequence number.
    pub fn push(&mut self, operation: Operation) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queue.push_back(PendingOperation {
            seq,
            operation,
            acknowledged: false,
        });
        seq
    }

    /// Sequence number of the most recent push (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Remove the operation with the given sequence number.
    pub fn remove(&mut self, seq: u64) -> Option<Operation> {
        // Outcomes arrive in send order, so this is almost always the front.
        let index = self.queue.iter().position(|p| p.seq == seq)?;
        self.queue.remove(index).map(|p| p.operation)
    }

    /// Mark an operation as accepted by the feed. Returns false if it is
    /// no longer queued.
    pub fn acknowledge(&mut self, seq: u64) -> bool {
        match self.queue.iter_mut().find(|p| p.seq == seq) {
            Some(pending) => {
                pending.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Remove the oldest operation that `echo` is a copy of.
    pub fn remove_echo(&mut self, echo: &Operation) -> Option<Operation> {
        let index = self
            .queue
            .iter()
            .position(|p| p.operation.same_edit(echo))?;
        self.queue.remove(index).map(|p| p.operation)
    }

    /// Drop every acknowledged operation. Returns how many were dropped.
    pub fn remove_acknowledged(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|p| !p.acknowledged);
        before - self.queue.len()
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.queue.iter().map(|p| &p.operation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
