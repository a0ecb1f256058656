/* Background I/O loop (component D): one dedicated thread that multiplexes every live driver fd
 * through poll(2), reads/parses push drivers or dispatches pull drivers, stamps dev_id/seqno on
 * every record, and fans each one out to every subscribing queue. Ported from io_poll/io_read in
 * original_source/src/core/io.c.
 *
 * The C original pauses the loop to safely mutate its fd/queue tables by sending SIGUSR1 to the
 * loop thread and relying on ppoll's atomic signal-mask swap to interrupt exactly one in-flight
 * poll(2) call. This port substitutes a self-pipe trampoline fd that is always in the poll set,
 * so "wake the loop" is an ordinary readiness event instead of a signal. */
use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe;
use tracing::{debug, error, warn};

use crate::driver::registry::DriverHandle;
use crate::driver::{DriverKind, PollEvents};
use crate::error::Result;
use crate::queue::Queue;
use crate::record::{DataId, DevId, Record, RecordEnvelope, SeqNo};

/// Read buffer size for one push-driver read, matching `POLL_BUF_SIZE` in
/// `io.c`.
const POLL_BUF_SIZE: usize = 100 * 1024;

struct Target {
    fd: RawFd,
    path: String,
    dev_id: DevId,
    kind: DriverKind,
    handle: DriverHandle,
    /// Bytes read but not yet consumed by `parse`, carried across reads.
    pending: Vec<u8>,
    next_events: PollEvents,
    next_timeout: Option<Duration>,
    next_seqno: SeqNo,
}

struct State {
    targets: Vec<Target>,
    subscribers: HashMap<DataId, Vec<Arc<Queue>>>,
    paused: bool,
    pause_requested: bool,
}

struct Inner {
    state: Mutex<State>,
    paused_cv: Condvar,
    resume_cv: Condvar,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    running: std::sync::atomic::AtomicBool,
}

impl Inner {
    fn wake(&self) {
        let _ = nix::unistd::write(&self.wake_write, &[1u8]);
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.wake_read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

/// The background I/O loop. Owns no driver fds directly (drivers keep their
/// own `OwnedFd`s); it only holds the raw fd values and a shared handle to
/// each driver instance so it can call `parse`/`poll` on it.
pub struct IoLoop {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoLoop {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe().map_err(std::io::Error::from)?;
        set_nonblocking(&read_fd)?;
        set_nonblocking(&write_fd)?;

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                targets: Vec::new(),
                subscribers: HashMap::new(),
                paused: false,
                pause_requested: false,
            }),
            paused_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            wake_read: read_fd,
            wake_write: write_fd,
            running: std::sync::atomic::AtomicBool::new(false),
        });

        Ok(Self {
            inner,
            thread: Mutex::new(None),
        })
    }

    /// Spawn the loop thread. Idempotent: does nothing if already running.
    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        self.inner.running.store(true, std::sync::atomic::Ordering::Release);
        let inner = Arc::clone(&self.inner);
        *thread = Some(std::thread::spawn(move || run_loop(inner)));
    }

    /// Stop the loop thread and join it. Does not close any driver fds;
    /// callers must `driver_destroy` each instance separately.
    pub fn stop(&self) {
        self.inner.running.store(false, std::sync::atomic::Ordering::Release);
        self.inner.wake();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Run `f` against the shared state while the loop thread is
    /// provably suspended outside any fd access (or, if the loop hasn't
    /// started yet, directly).
    fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut State) -> R,
    {
        if !self.inner.running.load(std::sync::atomic::Ordering::Acquire) {
            let mut state = self.inner.state.lock().unwrap();
            return f(&mut state);
        }

        let mut state = self.inner.state.lock().unwrap();
        state.pause_requested = true;
        self.inner.wake();
        while !state.paused {
            state = self.inner.paused_cv.wait(state).unwrap();
        }
        let result = f(&mut state);
        state.pause_requested = false;
        self.inner.resume_cv.notify_all();
        result
    }

    /// Register a driver's fd with the loop. `kind` decides whether reads
    /// are fed to `parse` (push) or the fd's readiness just triggers `poll`
    /// (pull).
    pub fn add_fd(&self, path: &str, fd: RawFd, dev_id: DevId, kind: DriverKind, handle: DriverHandle) -> Result<()> {
        set_nonblocking_raw(fd)?;
        self.mutate(|state| {
            state.targets.push(Target {
                fd,
                path: path.to_string(),
                dev_id,
                kind,
                handle,
                pending: Vec::new(),
                next_events: PollEvents {
                    readable: true,
                    writable: false,
                },
                next_timeout: None,
                next_seqno: 0,
            });
        });
        debug!(path, fd, "fd added to io loop");
        Ok(())
    }

    /// Remove a driver's fd from the loop. The caller is responsible for
    /// closing/stopping the driver itself.
    pub fn remove_fd(&self, path: &str) {
        self.mutate(|state| {
            state.targets.retain(|t| t.path != path);
        });
        debug!(path, "fd removed from io loop");
    }

    /// Add `queue` as a subscriber for `data_id`.
    pub fn add_queue(&self, data_id: DataId, queue: Arc<Queue>) {
        self.mutate(|state| {
            state.subscribers.entry(data_id).or_default().push(queue);
        });
    }

    /// Remove `queue` from `data_id`'s subscriber list.
    pub fn remove_queue(&self, data_id: DataId, queue: &Arc<Queue>) {
        self.mutate(|state| {
            if let Some(subs) = state.subscribers.get_mut(&data_id) {
                subs.retain(|q| !Arc::ptr_eq(q, queue));
            }
        });
    }
}

impl Drop for IoLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(std::io::Error::from)?;
    Ok(())
}

fn set_nonblocking_raw(fd: RawFd) -> Result<()> {
    let current = fcntl(fd, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(current) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

fn run_loop(inner: Arc<Inner>) {
    loop {
        if !inner.running.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        let (specs, timeout) = {
            let state = inner.state.lock().unwrap();
            build_poll_specs(&state)
        };

        let mut pollfds: Vec<PollFd> = Vec::with_capacity(specs.len() + 1);
        pollfds.push(PollFd::new(inner.wake_read.as_fd(), PollFlags::POLLIN));
        for spec in &specs {
            let borrowed = unsafe { BorrowedFd::borrow_raw(spec.fd) };
            pollfds.push(PollFd::new(borrowed, spec.flags));
        }

        let poll_result = poll(&mut pollfds, timeout);

        let mut state = inner.state.lock().unwrap();

        if !inner.running.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        let woke_on_wake_pipe = pollfds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);

        if woke_on_wake_pipe {
            inner.drain_wake();
        }

        if state.pause_requested {
            state.paused = true;
            inner.paused_cv.notify_all();
            while state.pause_requested {
                state = inner.resume_cv.wait(state).unwrap();
            }
            state.paused = false;
            continue;
        }

        match poll_result {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("poll(2) failed: {}", err);
                drop(state);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        }

        for (idx, target) in state.targets.iter_mut().enumerate() {
            let revents = match pollfds[idx + 1].revents() {
                Some(r) => r,
                None => continue,
            };
            if revents.is_empty() {
                continue;
            }

            let mut records = Vec::new();
            match target.kind {
                DriverKind::Push => service_push_target(target, revents, &mut records),
                DriverKind::Pull => service_pull_target(target, revents, &mut records),
            }

            for mut record in records {
                record.dev_id = target.dev_id;
                record.seqno = target.next_seqno;
                target.next_seqno += 1;
                dispatch(&state.subscribers, record);
            }
        }
    }
}

struct PollSpec {
    fd: RawFd,
    flags: PollFlags,
}

fn build_poll_specs(state: &State) -> (Vec<PollSpec>, PollTimeout) {
    let mut specs = Vec::with_capacity(state.targets.len());
    let mut min_timeout: Option<Duration> = None;

    for target in &state.targets {
        let mut flags = PollFlags::empty();
        if target.kind == DriverKind::Push || target.next_events.readable {
            flags |= PollFlags::POLLIN;
        }
        if target.next_events.writable {
            flags |= PollFlags::POLLOUT;
        }
        specs.push(PollSpec { fd: target.fd, flags });

        if let Some(t) = target.next_timeout {
            min_timeout = Some(min_timeout.map_or(t, |cur| cur.min(t)));
        }
    }

    let timeout = match min_timeout {
        Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        None => PollTimeout::NONE,
    };
    (specs, timeout)
}

fn service_push_target(target: &mut Target, revents: PollFlags, records: &mut Vec<Record>) {
    if revents.contains(PollFlags::POLLIN) {
        let mut buf = [0u8; POLL_BUF_SIZE];
        loop {
            match nix::unistd::read(target.fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => target.pending.extend_from_slice(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EIO) => {
                    error!(path = %target.path, "EIO reading driver fd");
                    break;
                }
                Err(err) => {
                    warn!(path = %target.path, "error reading driver fd: {}", err);
                    break;
                }
            }
        }
    }

    let mut ops = target.handle.lock().unwrap();
    loop {
        if records.len() >= crate::driver::MAX_RECORDS_PER_CALL {
            break;
        }
        match ops.parse(&target.pending, records) {
            Ok(0) => break,
            Ok(consumed) => {
                target.pending.drain(..consumed);
            }
            Err(err) => {
                warn!(path = %target.path, "driver parse failed: {}", err);
                break;
            }
        }
    }
}

fn service_pull_target(target: &mut Target, revents: PollFlags, records: &mut Vec<Record>) {
    let events = PollEvents {
        readable: revents.contains(PollFlags::POLLIN),
        writable: revents.contains(PollFlags::POLLOUT),
    };
    let mut ops = target.handle.lock().unwrap();
    match ops.poll(events) {
        Ok(outcome) => {
            records.extend(outcome.records);
            target.next_events = outcome.next_events;
            target.next_timeout = outcome.timeout;
        }
        Err(err) => warn!(path = %target.path, "driver poll failed: {}", err),
    }
}

fn dispatch(subscribers: &HashMap<DataId, Vec<Arc<Queue>>>, record: Record) {
    let subs = match subscribers.get(&record.data_id) {
        Some(subs) if !subs.is_empty() => subs,
        _ => return,
    };
    let envelope = Arc::new(RecordEnvelope::new(record, subs.len()));
    for queue in subs {
        queue.push(Arc::clone(&envelope));
    }
}
