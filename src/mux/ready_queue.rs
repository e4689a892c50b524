use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::frame::Handle;

/// FIFO of links with outbound work. A link is in the queue at most once, so links are served
///  in the order they became ready, and a link that still has work after being served goes to
///  the back.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: VecDeque<Handle>,
    members: FxHashSet<Handle>,
}

impl ReadyQueue {
    pub fn new() -> ReadyQueue {
        ReadyQueue::default()
    }

    /// adds a link at the back unless it is queued already
    pub fn push(&mut self, handle: Handle) {
        if self.members.insert(handle) {
            self.queue.push_back(handle);
        }
    }

    pub fn pop(&mut self) -> Option<Handle> {
        let handle = self.queue.pop_front()?;
        self.members.remove(&handle);
        Some(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.members.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::fifo(vec![3, 1, 2], vec![3, 1, 2])]
    #[case::no_duplicates(vec![1, 2, 1, 1, 3], vec![1, 2, 3])]
    fn test_push_pop(#[case] pushed: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut queue = ReadyQueue::new();
        for h in pushed {
            queue.push(Handle::from_raw(h));
        }
        assert_eq!(queue.len(), expected.len());

        let mut popped = Vec::new();
        while let Some(h) = queue.pop() {
            popped.push(h.to_raw());
        }
        assert_eq!(popped, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_to_back() {
        let mut queue = ReadyQueue::new();
        queue.push(Handle::from_raw(1));
        queue.push(Handle::from_raw(2));

        let h = queue.pop().unwrap();
        assert!(!queue.contains(h));
        queue.push(h);

        assert_eq!(queue.pop(), Some(Handle::from_raw(2)));
        assert_eq!(queue.pop(), Some(Handle::from_raw(1)));
        assert_eq!(queue.pop(), None);
    }
}
