//! Blocking producer/consumer queue.
//!
//! Strict FIFO with an optional byte cap: `put` blocks while adding the
//! entry would push the queued byte total over the cap, `get` blocks while
//! the queue is empty. Multiple producers and consumers are fine. An entry's
//! cost is at least one byte so zero-sized entries still drain the cap.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<(T, usize)>,
    bytes: usize,
}

pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    /// 0 means unlimited.
    max_bytes: usize,
}

impl<T> Queue<T> {
    pub fn new(max_bytes: usize) -> Self {
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                bytes: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_bytes,
        }
    }

    fn cost(size: usize) -> usize {
        size.max(1)
    }

    /// Append an entry, blocking while the byte cap is exceeded.
    pub fn put(&self, item: T, size: usize) {
        let cost = Self::cost(size);
        let mut inner = self.inner.lock().unwrap();
        if self.max_bytes > 0 {
            while !inner.items.is_empty() && inner.bytes + cost > self.max_bytes {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        inner.bytes += cost;
        inner.items.push_back((item, size));
        self.not_empty.notify_one();
    }

    /// Pop the oldest entry, blocking while the queue is empty.
    pub fn get(&self) -> (T, usize) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some((item, size)) = inner.items.pop_front() {
                inner.bytes -= Self::cost(size);
                self.not_full.notify_one();
                return (item, size);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn try_get(&self) -> Option<(T, usize)> {
        let mut inner = self.inner.lock().unwrap();
        let (item, size) = inner.items.pop_front()?;
        inner.bytes -= Self::cost(size);
        self.not_full.notify_one();
        Some((item, size))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = Queue::new(0);
        for i in 0..10 {
            q.put(i, 1);
        }
        for i in 0..10 {
            assert_eq!(q.get().0, i);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn try_get_on_empty() {
        let q: Queue<u32> = Queue::new(0);
        assert!(q.try_get().is_none());
    }

    #[test]
    fn put_blocks_at_byte_cap() {
        let q = Arc::new(Queue::new(100));
        q.put(1u32, 60);
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            // blocks until the consumer below makes room
            q2.put(2u32, 60);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().0, 1);
        handle.join().unwrap();
        assert_eq!(q.get().0, 2);
    }

    #[test]
    fn oversize_entry_enters_empty_queue() {
        // an entry bigger than the cap must still go through once alone
        let q = Queue::new(10);
        q.put(1u32, 50);
        assert_eq!(q.get().0, 1);
    }

    #[test]
    fn concurrent_consumers_drain_everything() {
        let q = Arc::new(Queue::new(0));
        for i in 0..100u32 {
            q.put(i, 1);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some((item, _)) = q.try_get() {
                    got.push(item);
                }
                got
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        // every entry was delivered exactly once
        assert_eq!(all, (0..100).collect::<Vec<u32>>());
        assert!(q.is_empty());
    }
}
