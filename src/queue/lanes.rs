//! Three FIFO lanes, one per priority.

use std::collections::VecDeque;

use super::{Priority, QueuedTask};

/// Ordered holding area for tasks that have not started yet.
///
/// Pops strictly by priority, then by enqueue sequence within a priority.
#[derive(Debug)]
pub(crate) struct Lanes<P> {
    high: VecDeque<QueuedTask<P>>,
    normal: VecDeque<QueuedTask<P>>,
    low: VecDeque<QueuedTask<P>>,
}

impl<P> Lanes<P> {
    pub(crate) fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedTask<P>> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Sequences are assigned monotonically, so appending keeps each lane sorted.
    pub(crate) fn push(&mut self, task: QueuedTask<P>) {
        self.lane_mut(task.priority).push_back(task);
    }

    pub(crate) fn pop_next(&mut self) -> Option<QueuedTask<P>> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<QueuedTask<P>> {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = lane.iter().position(|t| t.id == id) {
                return lane.remove(pos);
            }
        }
        None
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedTask<P>> {
        let mut drained: Vec<QueuedTask<P>> = self.high.drain(..).collect();
        drained.extend(self.normal.drain(..));
        drained.extend(self.low.drain(..));
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in dispatch order.
    pub(crate) fn ids(&self) -> Vec<String> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .map(|t| t.id.clone())
            .collect()
    }
}
