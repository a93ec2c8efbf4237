// Strict-priority FIFO queue.
//
// Five classes served in order; within a class items are ordered by their
// creation timestamp, so a requeued task re-enters ahead of anything
// enqueued after it.

use std::collections::VecDeque;

use crate::protocol::Priority;

pub(crate) struct PriorityQueue<T> {
    classes: Vec<VecDeque<(i64, T)>>,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            classes: (0..Priority::COUNT).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Insert keeping each class ordered by `created_at_ms`.
    pub fn push(&mut self, priority: Priority, created_at_ms: i64, item: T) {
        let class = &mut self.classes[priority.index()];
        let position = class.partition_point(|(at, _)| *at <= created_at_ms);
        class.insert(position, (created_at_ms, item));
    }

    /// Pop the oldest item of the highest non-empty class.
    pub fn pop(&mut self) -> Option<T> {
        self.classes
            .iter_mut()
            .find_map(|class| class.pop_front())
            .map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    /// Remove and return everything, highest priority first.
    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for class in &mut self.classes {
            drained.extend(class.drain(..).map(|(_, item)| item));
        }
        drained
    }
}
