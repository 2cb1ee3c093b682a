// src/dag/queue.rs

use crate::types::UnitId;

/// Ready queue of nodes waiting to be dispatched.
///
/// Semantics:
/// - `enqueue` is O(1) and may be called repeatedly for the same node; the
///   scheduler re-checks node state on dequeue, so duplicates are harmless.
/// - `dequeue` drains from a reversed copy of the input buffer. Within one
///   refill this is FIFO, but ordering between refills is not, so callers
///   must not rely on strict ordering among independent nodes.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    incoming: Vec<UnitId>,
    reversed: Vec<UnitId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.incoming.len() + self.reversed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&mut self, node: UnitId) {
        self.incoming.push(node);
    }

    pub fn dequeue(&mut self) -> Option<UnitId> {
        if self.reversed.is_empty() {
            if self.incoming.is_empty() {
                return None;
            }
            if self.incoming.len() == 1 {
                return self.incoming.pop();
            }
            self.reversed = std::mem::take(&mut self.incoming);
            self.reversed.reverse();
        }
        self.reversed.pop()
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.reversed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_one_batch_in_insertion_order() {
        let mut q = ReadyQueue::new();
        q.enqueue(UnitId(0));
        q.enqueue(UnitId(1));
        q.enqueue(UnitId(2));

        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(UnitId(0)));
        assert_eq!(q.dequeue(), Some(UnitId(1)));
        assert_eq!(q.dequeue(), Some(UnitId(2)));
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn items_enqueued_mid_drain_are_served_after_the_batch() {
        let mut q = ReadyQueue::new();
        q.enqueue(UnitId(0));
        q.enqueue(UnitId(1));
        assert_eq!(q.dequeue(), Some(UnitId(0)));

        q.enqueue(UnitId(5));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(UnitId(1)));
        assert_eq!(q.dequeue(), Some(UnitId(5)));
        assert_eq!(q.dequeue(), None);
    }
}
