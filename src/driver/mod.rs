/* Driver framework: the DriverOps trait every protocol driver implements, the descriptor types
 * the registry and I/O loop pass across that boundary, and the bundled reference drivers used to
 * exercise the core (nop, file). Concrete production protocol drivers (OBD-II, GPS, ...) are
 * external collaborators and not part of this crate. */
pub mod file;
pub mod nop;
pub mod registry;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::record::{DataId, Period, Record};

/// Maximum number of records a driver may produce from one `parse`/`poll`
/// call (`HOUND_DRIVER_MAX_RECORDS`).
pub const MAX_RECORDS_PER_CALL: usize = 1000;

/// Max length of a schema-compatible device name string.
pub const DEVICE_NAME_MAX: usize = 32;

/// A typed driver-init argument (the Rust equivalent of the C union in
/// `hound_init_arg`).
#[derive(Debug, Clone)]
pub enum InitArg {
    F32(f32),
    F64(f64),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Bytes(String),
}

/// One `(data_id, period)` pair, as requested by a context or aggregated by
/// the registry into a driver's subscription union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRq {
    pub id: DataId,
    pub period_ns: Period,
}

/// The capability a driver declares for one schema-described data id after
/// `init`: whether it is enabled at all, and at what periods it can deliver.
#[derive(Debug, Clone)]
pub struct DrvDatadesc {
    pub data_id: DataId,
    pub enabled: bool,
    pub avail_periods: Vec<Period>,
}

impl DrvDatadesc {
    pub fn disabled(data_id: DataId) -> Self {
        Self {
            data_id,
            enabled: false,
            avail_periods: Vec::new(),
        }
    }

    /// Invariant: `enabled ⇒ len(avail_periods) ≥ 1`.
    pub fn check_invariant(&self) -> bool {
        !self.enabled || !self.avail_periods.is_empty()
    }
}

/// Whether a driver's fd is a push source (core reads bytes, driver parses
/// them) or a pull source (driver performs its own I/O and just hands back
/// records). Exactly one of [`DriverOps::parse`] / [`DriverOps::poll`] is
/// meaningful for a given driver; which one is determined by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Push,
    Pull,
}

/// What a pull driver's `poll` call asks the I/O loop to watch for next.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvents {
    pub readable: bool,
    pub writable: bool,
}

/// Output of a pull driver's `poll` call: the records it produced, what to
/// watch for on the next iteration, and an optional timed wake request.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub records: Vec<Record>,
    pub next_events: PollEvents,
    pub timeout: Option<Duration>,
}

/// The universal driver interface. Every concrete protocol (NOP, file,
/// OBD-II, GPS, ...) implements this trait; the core only ever talks to
/// drivers through it.
pub trait DriverOps: Send {
    /// Acquire device configuration; return an error on bad args. Analogous
    /// to `driver_ops.init` in `driver.h`.
    fn init(&mut self, path: &str, args: &[InitArg]) -> Result<()>;

    /// Release anything `init` allocated.
    fn destroy(&mut self) -> Result<()>;

    /// The backing device's human-readable name, if any. Truncated to
    /// [`DEVICE_NAME_MAX`] - 1 characters by the registry if longer.
    fn device_name(&self) -> Option<String> {
        None
    }

    /// Enable/disable each schema-described data id and declare its
    /// available periods. Called once, right after `init`.
    fn datadesc(&mut self, descs: &mut [DrvDatadesc]) -> Result<()>;

    /// Reconfigure the driver to produce exactly this set of
    /// `(data_id, period)` pairs, the current subscription union across
    /// every context referencing this driver.
    fn setdata(&mut self, rqs: &[DataRq]) -> Result<()>;

    /// Which mode this driver instance operates in.
    fn kind(&self) -> DriverKind;

    /// Open the device and return a file descriptor. The core forces it
    /// into non-blocking mode before adding it to the I/O loop. Called on
    /// the zero-to-one subscription transition.
    fn start(&mut self) -> Result<RawFd>;

    /// Trigger an on-demand sample for `id`. No-op for periodic drivers.
    fn next(&mut self, _id: DataId, _n: usize) -> Result<()> {
        Ok(())
    }

    /// Close the device. Called when the last subscription is dropped.
    fn stop(&mut self) -> Result<()>;

    /// Push-driver data path: consume a prefix of `buf`, emit up to
    /// [`MAX_RECORDS_PER_CALL`] records, and return how many bytes of `buf`
    /// were consumed. Returning `0` means "no more full records in this
    /// buffer right now" and the I/O loop stops calling `parse` until more
    /// bytes arrive.
    fn parse(&mut self, _buf: &[u8], _records: &mut Vec<Record>) -> Result<usize> {
        unreachable!("parse called on a driver that is not push-mode")
    }

    /// Pull-driver data path: perform the device I/O directly and return
    /// the records produced plus the next poll configuration.
    fn poll(&mut self, _events: PollEvents) -> Result<PollOutcome> {
        unreachable!("poll called on a driver that is not pull-mode")
    }
}
