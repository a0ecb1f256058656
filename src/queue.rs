/* Bounded queue (component B): single-producer/multi-consumer ring buffer of record-envelope
 * references. Producer push never blocks; a full queue evicts (and releases) its oldest entry.
 * Consumer drain operations either block or return immediately, never partially. */
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use tracing::warn;

use crate::error::{HoundError, Result};
use crate::record::RecordEnvelope;

struct Inner {
    ring: VecDeque<Arc<RecordEnvelope>>,
    capacity: usize,
}

/// A bounded, strictly-FIFO queue of record-envelope references.
///
/// One producer (the I/O loop thread) calls [`Queue::push`]; one consumer
/// (the context's reader thread) calls the `pop_*`/`drain_*` family. A
/// design with two condition variables (non-empty and non-full) would be
/// the usual shape, but since `push` never blocks (it evicts the oldest
/// entry instead of waiting), the non-full condvar would never be waited
/// on, so only the non-empty one is kept.
pub struct Queue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl Queue {
    /// Create a queue with room for `capacity` envelopes. `capacity` must be
    /// at least 1 (enforced by callers via `HoundError::QueueTooSmall`).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push one envelope. Never blocks. If the queue is full, the oldest
    /// envelope is released (dropping its reference, possibly freeing it)
    /// and the new one takes its slot. This is the only record-loss path,
    /// and losses are per-queue, observable downstream only as a gap in
    /// `seqno`.
    pub fn push(&self, envelope: Arc<RecordEnvelope>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() == inner.capacity {
            let evicted = inner.ring.pop_front();
            if let Some(evicted) = evicted {
                let seqno = evicted.record.seqno;
                evicted.release();
                warn!(seqno, "queue overflow: dropped oldest record");
            }
        }
        inner.ring.push_back(envelope);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Block until at least one envelope is available, then pop it.
    pub fn pop_blocking(&self) -> Arc<RecordEnvelope> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(env) = inner.ring.pop_front() {
                return env;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Pop one envelope if available, without blocking.
    pub fn pop_nonblocking(&self) -> Option<Arc<RecordEnvelope>> {
        self.inner.lock().unwrap().ring.pop_front()
    }

    /// Block until exactly `n` envelopes have been popped.
    pub fn drain_n_blocking(&self, n: usize) -> Vec<Arc<RecordEnvelope>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop_blocking());
        }
        out
    }

    /// Pop up to `n` envelopes without blocking; returns as many as were
    /// immediately available (which may be fewer than `n`, including zero).
    pub fn drain_n_nonblocking(&self, n: usize) -> Vec<Arc<RecordEnvelope>> {
        let mut inner = self.inner.lock().unwrap();
        let count = n.min(inner.ring.len());
        inner.ring.drain(..count).collect()
    }

    /// Pop envelopes without blocking while the cumulative payload size
    /// stays at or under `max_bytes`. Whole records only: the first record
    /// whose inclusion would exceed the budget is left in the queue.
    pub fn drain_bytes_nonblocking(&self, max_bytes: usize) -> (Vec<Arc<RecordEnvelope>>, usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut bytes = 0usize;
        while let Some(front) = inner.ring.front() {
            let size = front.record.len();
            if bytes + size > max_bytes {
                break;
            }
            bytes += size;
            out.push(inner.ring.pop_front().unwrap());
        }
        (out, bytes)
    }

    /// Pop every envelope currently enqueued, without blocking.
    pub fn drain_all_nonblocking(&self) -> Vec<Arc<RecordEnvelope>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.drain(..).collect()
    }
}

/// Validate a requested queue length against the minimum (at least 1).
pub fn validate_queue_len(queue_len: usize) -> Result<()> {
    if queue_len < 1 {
        return Err(HoundError::QueueTooSmall(queue_len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use std::time::SystemTime;

    fn envelope(seqno: u64, size: usize) -> Arc<RecordEnvelope> {
        Arc::new(RecordEnvelope::new(
            Record {
                seqno,
                data_id: 1,
                dev_id: 0,
                timestamp: SystemTime::now(),
                payload: vec![0u8; size],
            },
            1,
        ))
    }

    #[test]
    fn fifo_ordering() {
        let q = Queue::new(10);
        for i in 0..5 {
            q.push(envelope(i, 4));
        }
        for i in 0..5 {
            assert_eq!(q.pop_blocking().record.seqno, i);
        }
    }

    #[test]
    fn drop_oldest_under_pressure() {
        // N=7 records produced into a capacity-3 queue before any drain;
        // exactly the last 3 (seqnos 4,5,6) should survive.
        let q = Queue::new(3);
        for i in 0..7 {
            q.push(envelope(i, 4));
        }
        let drained = q.drain_all_nonblocking();
        let seqnos: Vec<u64> = drained.iter().map(|e| e.record.seqno).collect();
        assert_eq!(seqnos, vec![4, 5, 6]);
    }

    #[test]
    fn drain_n_nonblocking_returns_available_only() {
        let q = Queue::new(10);
        q.push(envelope(0, 4));
        q.push(envelope(1, 4));
        let drained = q.drain_n_nonblocking(5);
        assert_eq!(drained.len(), 2);
        assert!(q.drain_n_nonblocking(5).is_empty());
    }

    #[test]
    fn drain_bytes_nonblocking_respects_budget() {
        let q = Queue::new(10);
        q.push(envelope(0, 10));
        q.push(envelope(1, 10));
        q.push(envelope(2, 10));
        let (drained, bytes) = q.drain_bytes_nonblocking(25);
        assert_eq!(drained.len(), 2);
        assert_eq!(bytes, 20);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_nonblocking_empty_queue() {
        let q = Queue::new(4);
        assert!(q.pop_nonblocking().is_none());
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        use std::sync::Arc as StdArc;
        use std::thread;
        use std::time::Duration;

        let q = StdArc::new(Queue::new(4));
        let q2 = StdArc::clone(&q);
        let handle = thread::spawn(move || q2.pop_blocking().record.seqno);

        thread::sleep(Duration::from_millis(50));
        q.push(envelope(42, 4));

        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn queue_len_validation() {
        assert!(validate_queue_len(0).is_err());
        assert!(validate_queue_len(1).is_ok());
    }
}
