//! Binary min/max-heap based priority queue (spec.md §4.2).
//!
//! Ordered by priority DESC, insertion-sequence ASC: two tasks of equal
//! priority pop in submission order. `PriorityQueue<T>` is a plain,
//! non-thread-safe heap; `ConcurrentPriorityQueue<T>` adds the blocking,
//! closeable wrapper lanes actually use.

use crate::core::task::OrderKey;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Entry<T> {
    key: OrderKey,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Plain priority queue: priority DESC, insertion order ASC on ties.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Pushes with an externally assigned sequence number (the lane assigns
    /// these on admission so tie-break order matches submission order even
    /// across a queue that's drained and refilled).
    pub fn push_with_seq(&mut self, priority: i64, seq: u64, value: T) {
        self.heap.push(Entry {
            key: OrderKey { priority, seq },
            value,
        });
    }

    pub fn push(&mut self, priority: i64, value: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.push_with_seq(priority, seq, value);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|e| e.value)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Thread-safe wrapper with a blocking, closeable `pop`.
pub struct ConcurrentPriorityQueue<T> {
    inner: std::sync::Mutex<PriorityQueue<T>>,
    notify: Notify,
    closed: AtomicBool,
    seq: AtomicU64,
}

impl<T: Send> Default for ConcurrentPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> ConcurrentPriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(PriorityQueue::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    /// Returns the insertion sequence assigned to the pushed value, so
    /// callers (the lane) can stamp the same value onto their own records.
    pub fn push(&self, priority: i64, value: T) -> u64 {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner.lock().unwrap().push_with_seq(priority, seq, value);
        self.notify.notify_one();
        seq
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// Blocks until an item is available or the queue is closed and
    /// drained, in which case it returns `None`.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(v) = self.try_pop() {
                return Some(v);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_pops_first() {
        let mut q = PriorityQueue::new();
        q.push(1, "low");
        q.push(10, "high");
        q.push(5, "mid");
        assert_eq!(q.pop(), Some("high"));
        assert_eq!(q.pop(), Some("mid"));
        assert_eq!(q.pop(), Some("low"));
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut q = PriorityQueue::new();
        q.push(1, "first");
        q.push(1, "second");
        q.push(1, "third");
        assert_eq!(q.pop(), Some("first"));
        assert_eq!(q.pop(), Some("second"));
        assert_eq!(q.pop(), Some("third"));
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = PriorityQueue::new();
        q.push(1, "only");
        assert_eq!(q.peek(), Some(&"only"));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_pop_blocks_until_push() {
        let q = Arc::new(ConcurrentPriorityQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(1, 42);
        let got = handle.await.unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn closed_and_drained_pop_returns_none() {
        let q: ConcurrentPriorityQueue<i32> = ConcurrentPriorityQueue::new();
        q.push(1, 1);
        q.close();
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, None);
    }
}
