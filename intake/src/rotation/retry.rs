//! Queue of compressed artifacts awaiting a successful upload.

use std::{collections::VecDeque, path::PathBuf};

/// Pending uploads, oldest failure retried first.
///
/// New failures go in at the head, retries come off the tail. An artifact that
/// fails again is pushed back at the head, behind every other pending upload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryQueue {
    paths: VecDeque<PathBuf>,
}

impl RetryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `path` at the head.
    pub fn push(&mut self, path: PathBuf) {
        self.paths.push_front(path);
    }

    /// Dequeue the oldest entry from the tail.
    pub fn pop(&mut self) -> Option<PathBuf> {
        self.paths.pop_back()
    }

    /// Number of pending uploads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no uploads are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_failure_is_retried_first() {
        let mut q = RetryQueue::new();
        q.push(PathBuf::from("a"));
        q.push(PathBuf::from("b"));
        q.push(PathBuf::from("c"));
        assert_eq!(q.pop(), Some(PathBuf::from("a")));
        assert_eq!(q.pop(), Some(PathBuf::from("b")));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn repeated_failure_goes_behind_the_rest() {
        let mut q = RetryQueue::new();
        q.push(PathBuf::from("a"));
        q.push(PathBuf::from("b"));

        let failed = q.pop().expect("queue empty");
        q.push(failed);

        assert_eq!(q.pop(), Some(PathBuf::from("b")));
        assert_eq!(q.pop(), Some(PathBuf::from("a")));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}
