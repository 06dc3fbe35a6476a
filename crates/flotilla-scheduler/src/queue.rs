//! Wait-for-capacity queue.

use flotilla_core::ids::TaskId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// A task waiting for an agent slot.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
    /// Lower values are more urgent.
    pub priority: i32,
    pub queued_at: Instant,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest: lowest priority value, then earliest arrival.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue, FIFO within a priority.
#[derive(Debug, Default)]
pub struct WaitQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task_id: TaskId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask {
            task_id,
            priority,
            queued_at: Instant::now(),
            seq,
        });
    }

    /// Put back an entry taken with [`WaitQueue::take_all`], keeping its place.
    pub fn requeue(&mut self, task: QueuedTask) {
        self.heap.push(task);
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    /// Remove every entry, most urgent first.
    pub fn take_all(&mut self) -> Vec<QueuedTask> {
        std::mem::take(&mut self.heap).into_sorted_vec().into_iter().rev().collect()
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|t| t.task_id != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.heap.iter().any(|t| t.task_id == task_id)
    }

    /// Zero-based position of a task in dispatch order.
    pub fn position(&self, task_id: TaskId) -> Option<usize> {
        let mut sorted: Vec<_> = self.heap.iter().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.iter().position(|t| t.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_priority_value_first() {
        let mut queue = WaitQueue::new();
        let low = TaskId::new();
        let urgent = TaskId::new();
        queue.enqueue(low, 10);
        queue.enqueue(urgent, -1);

        assert_eq!(queue.pop().unwrap().task_id, urgent);
        assert_eq!(queue.pop().unwrap().task_id, low);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = WaitQueue::new();
        let ids: Vec<_> = (0..5).map(|_| TaskId::new()).collect();
        for id in &ids {
            queue.enqueue(*id, 0);
        }
        let order: Vec<_> = queue.take_all().into_iter().map(|t| t.task_id).collect();
        assert_eq!(order, ids);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_place() {
        let mut queue = WaitQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        queue.enqueue(first, 1);
        queue.enqueue(second, 1);

        let taken = queue.take_all();
        for task in taken.into_iter().rev() {
            queue.requeue(task);
        }
        assert_eq!(queue.position(first), Some(0));
        assert_eq!(queue.position(second), Some(1));
    }

    #[test]
    fn test_remove() {
        let mut queue = WaitQueue::new();
        let a = TaskId::new();
        let b = TaskId::new();
        queue.enqueue(a, 0);
        queue.enqueue(b, 0);

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(!queue.contains(a));
        assert_eq!(queue.len(), 1);
    }
}
