//! A queue of opaque keys that deduplicates pending work and hands each key
//! to at most one worker at a time.
//!
//! Three guarantees hold:
//!
//! - while a key is pending, re-adding it is a no-op;
//! - after a key has been handed out by [`WorkQueue::get`], further adds of
//!   the same key are deferred until [`WorkQueue::done`] is called, and if
//!   any such add happened the key re-enters the queue exactly once;
//! - after [`WorkQueue::shut_down`], pending and subsequent `get`s resolve
//!   to `None`.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    queue: VecDeque<T>,

    // Keys that still need processing, whether queued or deferred behind an
    // in-flight worker.
    dirty: HashSet<T>,

    // Keys currently handed out to a worker.
    processing: HashSet<T>,

    shutting_down: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark `item` as needing processing. A no-op when the item is already
    /// pending or the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.dirty.contains(&item) {
            return;
        }

        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            // Deferred until `done`, which re-queues it.
            return;
        }

        inner.queue.push_back(item);
        drop(inner);

        self.notify.notify_one();
    }

    /// Wait for the next item. Resolves to `None` once the queue is shut
    /// down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.as_mut().await;
        }
    }

    /// Release `item` after processing. If adds for the key arrived while it
    /// was in flight, the key re-enters the queue once.
    pub fn done(&self, item: &T) {
        let mut inner = self.inner.lock();
        inner.processing.remove(item);
        if inner.dirty.contains(item) {
            inner.queue.push_back(item.clone());
            drop(inner);

            self.notify.notify_one();
        }
    }

    /// Cause pending and subsequent `get`s to resolve to `None`.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        drop(inner);

        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("c");

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, Some("c"));
    }

    #[tokio::test]
    async fn pending_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("a");

        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        // The duplicates were collapsed into the first entry.
        assert!(
            timeout(Duration::from_millis(50), queue.get())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn single_flight_with_one_reentry() {
        let queue = WorkQueue::new();
        queue.add("a");

        let got = queue.get().await.unwrap();
        assert_eq!(got, "a");

        // Re-adds while "a" is in flight are deferred, and collapse into a
        // single re-entry after done.
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&"a");
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        assert!(
            timeout(Duration::from_millis(50), queue.get())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn done_without_deferred_add_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add("a");

        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue = Arc::new(WorkQueue::<String>::new());

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        // Give the getter a chance to block.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn add_after_shutdown_is_ignored() {
        let queue = WorkQueue::new();
        queue.shut_down();
        queue.add("a");

        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn get_unblocks_on_add() {
        let queue = Arc::new(WorkQueue::new());

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("a");

        assert_eq!(waiter.await.unwrap(), Some("a"));
    }
}
