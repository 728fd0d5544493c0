//! Ordered queue of waiting task ids with explicit reordering.

use std::collections::VecDeque;

use capturerun_core::TaskId;

/// FIFO of waiting tasks that also supports moving entries around.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    ids: VecDeque<TaskId>,
}

impl WaitQueue {
    pub fn push_back(&mut self, id: TaskId) {
        self.ids.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.ids.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ids.iter().copied()
    }

    fn position(&self, id: TaskId) -> Option<usize> {
        self.ids.iter().position(|queued| *queued == id)
    }

    /// Remove `id`; returns false if it was not queued.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn move_to_head(&mut self, id: TaskId) -> bool {
        if !self.remove(id) {
            return false;
        }
        self.ids.push_front(id);
        true
    }

    pub fn move_to_tail(&mut self, id: TaskId) -> bool {
        if !self.remove(id) {
            return false;
        }
        self.ids.push_back(id);
        true
    }

    /// Place `id` directly after `other`.
    pub fn move_after(&mut self, id: TaskId, other: TaskId) -> bool {
        if id == other || self.position(other).is_none() || !self.remove(id) {
            return false;
        }
        // `other` is still queued, its position may have shifted by one
        let pos = self.position(other).map_or(self.ids.len(), |pos| pos + 1);
        self.ids.insert(pos, id);
        true
    }

    /// Place `id` directly before `other`.
    ///
    /// Returns `None` if either task is not queued, otherwise the task that
    /// now precedes `id` (`Some(None)` when `id` became the head).
    pub fn move_before(&mut self, id: TaskId, other: TaskId) -> Option<Option<TaskId>> {
        if id == other || self.position(other).is_none() || !self.remove(id) {
            return None;
        }
        let pos = self.position(other).unwrap_or(0);
        self.ids.insert(pos, id);
        Some(pos.checked_sub(1).and_then(|prev| self.ids.get(prev).copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(ids: &[u64]) -> WaitQueue {
        let mut queue = WaitQueue::default();
        for id in ids {
            queue.push_back(TaskId::new(*id));
        }
        queue
    }

    fn order(queue: &WaitQueue) -> Vec<u64> {
        queue.iter().map(|id| id.get()).collect()
    }

    #[test]
    fn test_head_and_tail() {
        let mut q = queue(&[1, 2, 3]);
        assert!(q.move_to_head(TaskId::new(3)));
        assert_eq!(order(&q), vec![3, 1, 2]);
        assert!(q.move_to_tail(TaskId::new(3)));
        assert_eq!(order(&q), vec![1, 2, 3]);
        assert!(!q.move_to_head(TaskId::new(9)));
    }

    #[test]
    fn test_move_after() {
        let mut q = queue(&[1, 2, 3, 4]);
        assert!(q.move_after(TaskId::new(1), TaskId::new(3)));
        assert_eq!(order(&q), vec![2, 3, 1, 4]);
        assert!(q.move_after(TaskId::new(4), TaskId::new(2)));
        assert_eq!(order(&q), vec![2, 4, 3, 1]);
        assert!(!q.move_after(TaskId::new(2), TaskId::new(2)));
        assert!(!q.move_after(TaskId::new(2), TaskId::new(9)));
        assert_eq!(order(&q), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_move_before_reports_predecessor() {
        let mut q = queue(&[1, 2, 3, 4]);
        assert_eq!(q.move_before(TaskId::new(4), TaskId::new(1)), Some(None));
        assert_eq!(order(&q), vec![4, 1, 2, 3]);
        assert_eq!(
            q.move_before(TaskId::new(4), TaskId::new(3)),
            Some(Some(TaskId::new(2)))
        );
        assert_eq!(order(&q), vec![1, 2, 4, 3]);
        assert_eq!(q.move_before(TaskId::new(9), TaskId::new(3)), None);
        assert_eq!(q.move_before(TaskId::new(3), TaskId::new(9)), None);
        assert_eq!(order(&q), vec![1, 2, 4, 3]);
    }
}
