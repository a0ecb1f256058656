/* Context (component E): one user subscription, comprising a request list, a bounded queue, and
 * a callback. Owns no driver state directly; every resolve/ref/unref/subscribe call is routed
 * through the engine handle it was allocated from. Grounded on hound_alloc_ctx/hound_free_ctx/
 * hound_start/hound_stop/hound_read* in original_source/include/hound/hound.h. */
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::EngineInner;
use crate::error::{HoundError, Result};
use crate::queue::{validate_queue_len, Queue};
use crate::record::{DataId, Period, Record, RecordEnvelope};

/// Max number of data ids requested per context (`HOUND_MAX_DATA_REQ`).
pub const MAX_DATA_REQ: usize = 1000;

/// A context's user-facing callback: invoked synchronously, in FIFO order
/// for this context's queue, once per drained record. The core treats it
/// as infallible and releases the envelope right after
/// it returns.
pub type Callback = Box<dyn FnMut(&Record) + Send>;

/// The request behind [`Engine::context_alloc`](crate::Engine::context_alloc).
pub struct ContextRequest {
    pub queue_len: usize,
    pub callback: Option<Callback>,
    pub data_rq: Vec<(DataId, Period)>,
}

struct Entry {
    path: String,
    data_id: DataId,
    period_ns: Period,
}

/// A live subscription: one queue bound to one or more drivers' data,
/// through a fixed request list resolved at allocation time (no dynamic
/// reconfiguration of a running context's requests).
pub struct Context {
    engine: Arc<EngineInner>,
    queue: Arc<Queue>,
    callback: Mutex<Callback>,
    entries: Vec<Entry>,
    active: AtomicBool,
}

impl Context {
    /// `hound_alloc_ctx`: validate, resolve each requested data id to a
    /// driver, and ref the driver group (rolling back on any failure), which
    /// starts each driver's fd with the I/O loop if it wasn't already
    /// running. The context itself starts out inactive; its queue is not
    /// subscribed to any fd until the caller calls `start`.
    pub(crate) fn alloc(engine: Arc<EngineInner>, request: ContextRequest) -> Result<Self> {
        validate_queue_len(request.queue_len)?;
        let callback = request.callback.ok_or(HoundError::MissingCallback)?;

        if request.data_rq.is_empty() {
            return Err(HoundError::NoDataRequested);
        }
        if request.data_rq.len() > MAX_DATA_REQ {
            return Err(HoundError::TooMuchDataRequested(request.data_rq.len(), MAX_DATA_REQ));
        }

        let mut seen = HashSet::new();
        for (data_id, _) in &request.data_rq {
            if !seen.insert(*data_id) {
                return Err(HoundError::DuplicateDataRequested(*data_id));
            }
        }

        let mut entries = Vec::with_capacity(request.data_rq.len());
        for (data_id, period_ns) in &request.data_rq {
            let path = engine.resolve(*data_id)?;
            entries.push(Entry {
                path,
                data_id: *data_id,
                period_ns: *period_ns,
            });
        }

        for i in 0..entries.len() {
            let entry = &entries[i];
            if let Err(err) = engine.ref_entry(&entry.path, entry.data_id, entry.period_ns) {
                for prev in &entries[..i] {
                    engine.unref_entry(&prev.path, prev.data_id, prev.period_ns);
                }
                return Err(err);
            }
        }

        let queue = Arc::new(Queue::new(request.queue_len));

        Ok(Self {
            engine,
            queue,
            callback: Mutex::new(callback),
            entries,
            active: AtomicBool::new(false),
        })
    }

    /// `hound_start`. Fails with [`HoundError::ContextActive`] if the
    /// context is already receiving data.
    pub fn start(&self) -> Result<()> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HoundError::ContextActive);
        }
        for entry in &self.entries {
            self.engine.subscribe_queue(entry.data_id, &self.queue);
        }
        Ok(())
    }

    /// `hound_stop`. Fails with [`HoundError::ContextNotActive`] if the
    /// context is already stopped. After this returns, no further
    /// callback invocations occur for this context until the next
    /// [`Context::start`].
    pub fn stop(&self) -> Result<()> {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HoundError::ContextNotActive);
        }
        for entry in &self.entries {
            self.engine.unsubscribe_queue(entry.data_id, &self.queue);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// `hound_next`: ask every subscribed driver to produce `n` on-demand
    /// samples. A no-op for periodic drivers.
    pub fn next(&self, n: usize) -> Result<()> {
        for entry in &self.entries {
            self.engine.next(&entry.path, entry.data_id, n)?;
        }
        Ok(())
    }

    /// `hound_read`: request `n` on-demand samples, then block until `n`
    /// records have been drained and their callbacks completed.
    pub fn read(&self, n: usize) -> Result<()> {
        self.next(n)?;
        let envelopes = self.queue.drain_n_blocking(n);
        self.dispatch(envelopes);
        Ok(())
    }

    /// `hound_read_nowait`: drain up to `max_records` without blocking;
    /// does not call `next`. Returns the number of records actually read.
    pub fn read_nowait(&self, max_records: usize) -> usize {
        let envelopes = self.queue.drain_n_nonblocking(max_records);
        let read = envelopes.len();
        self.dispatch(envelopes);
        read
    }

    /// `hound_read_bytes_nowait`: drain whole records while the cumulative
    /// payload size stays at or under `max_bytes`. Returns
    /// `(records_read, bytes_read)`.
    pub fn read_bytes_nowait(&self, max_bytes: usize) -> (usize, usize) {
        let (envelopes, bytes) = self.queue.drain_bytes_nonblocking(max_bytes);
        let records = envelopes.len();
        self.dispatch(envelopes);
        (records, bytes)
    }

    /// `hound_read_all_nowait`: drain everything currently enqueued.
    /// Returns the number of records actually read.
    pub fn read_all_nowait(&self) -> usize {
        let envelopes = self.queue.drain_all_nonblocking();
        let read = envelopes.len();
        self.dispatch(envelopes);
        read
    }

    /// `hound_queue_length`.
    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// `hound_max_queue_length`.
    pub fn max_queue_length(&self) -> usize {
        self.queue.capacity()
    }

    fn dispatch(&self, envelopes: Vec<Arc<RecordEnvelope>>) {
        let mut cb = self.callback.lock().unwrap();
        for envelope in envelopes {
            cb(&envelope.record);
            envelope.release();
        }
    }
}

impl Drop for Context {
    /// `hound_free_ctx`: unregister from the I/O loop (if still active) and
    /// release every driver subscription this context holds.
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            for entry in &self.entries {
                self.engine.unsubscribe_queue(entry.data_id, &self.queue);
            }
        }
        for entry in &self.entries {
            self.engine.unref_entry(&entry.path, entry.data_id, entry.period_ns);
        }
    }
}
