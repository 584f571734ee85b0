//! Bounded media buffer
//!
//! Fixed-capacity FIFO shared between a producer and a consumer thread.
//! Real-time media favours freshness over completeness, so a full buffer
//! evicts its oldest item instead of blocking the producer. Memory and
//! end-to-end latency stay bounded no matter how far the consumer falls
//! behind; consumers must tolerate gaps.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

pub struct BoundedBuffer<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                dropped: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one first when full.
    ///
    /// Never blocks. Pushes after [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) {
        let mut g = self.lock();
        if g.closed {
            return;
        }
        if g.items.len() >= self.capacity {
            g.items.pop_front();
            g.dropped = g.dropped.saturating_add(1);
        }
        g.items.push_back(item);
        drop(g);
        self.cv.notify_one();
    }

    /// Append every item in order under a single lock acquisition.
    pub fn push_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut g = self.lock();
        if g.closed {
            return;
        }
        for item in items {
            if g.items.len() >= self.capacity {
                g.items.pop_front();
                g.dropped = g.dropped.saturating_add(1);
            }
            g.items.push_back(item);
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Oldest item, waiting at most `timeout` for one to arrive.
    ///
    /// A zero timeout never waits. Returns `None` on timeout or once the
    /// buffer is closed and empty.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut g = self.lock();
        if timeout.is_zero() {
            return g.items.pop_front();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = g.items.pop_front() {
                return Some(item);
            }
            if g.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (ng, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Move up to `max` of the oldest items into `out`; returns how many moved.
    pub fn pop_into(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut g = self.lock();
        let n = max.min(g.items.len());
        out.extend(g.items.drain(..n));
        n
    }

    /// Remove and return everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Wake all pollers and refuse further pushes. Buffered items stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T: Clone> BoundedBuffer<T> {
    /// Copy of the buffered items, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let buf = BoundedBuffer::new(4);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.try_pop(), Some(1));
        assert_eq!(buf.try_pop(), Some(2));
        assert_eq!(buf.try_pop(), Some(3));
        assert_eq!(buf.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buf = BoundedBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let buf = BoundedBuffer::new(0);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(), vec!["b"]);
    }

    #[test]
    fn test_pop_zero_timeout_does_not_wait() {
        let buf: BoundedBuffer<u8> = BoundedBuffer::new(2);
        let start = Instant::now();
        assert_eq!(buf.pop(Duration::ZERO), None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_pop_times_out() {
        let buf: BoundedBuffer<u8> = BoundedBuffer::new(2);
        let start = Instant::now();
        assert_eq!(buf.pop(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let buf = Arc::new(BoundedBuffer::new(2));
        let producer = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42u32);
        });
        assert_eq!(buf.pop(Duration::from_secs(2)), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_pollers() {
        let buf: Arc<BoundedBuffer<u8>> = Arc::new(BoundedBuffer::new(2));
        let closer = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        let start = Instant::now();
        assert_eq!(buf.pop(Duration::from_secs(5)), None);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();

        buf.push(1);
        assert!(buf.is_empty());
        assert!(buf.is_closed());
    }

    #[test]
    fn test_clear_and_drain() {
        let buf = BoundedBuffer::new(8);
        buf.push_many(0..5);
        assert_eq!(buf.drain(), vec![0, 1, 2, 3, 4]);
        buf.push_many(0..5);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_push_many_respects_capacity() {
        let buf = BoundedBuffer::new(4);
        buf.push_many(0..10);
        assert_eq!(buf.snapshot(), vec![6, 7, 8, 9]);
        assert_eq!(buf.dropped(), 6);
    }

    #[test]
    fn test_pop_into_partial() {
        let buf = BoundedBuffer::new(8);
        buf.push_many([1.0f32, 2.0, 3.0]);
        let mut out = Vec::new();
        assert_eq!(buf.pop_into(&mut out, 5), 3);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        assert_eq!(buf.pop_into(&mut out, 5), 0);
    }
}
