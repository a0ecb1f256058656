//! Hound: a data-acquisition library for embedded/automotive telemetry.
//!
//! An embedding application registers one or more pluggable drivers, spins
//! up contexts that each request a set of `(data_id, period)` pairs, and
//! reads the resulting records off a bounded, per-context queue. A single
//! background thread multiplexes every live driver's I/O through `poll(2)`
//! and fans each record out to every subscribing context.

pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod io;
pub mod queue;
pub mod record;
pub mod schema;

pub use context::{Callback, Context, ContextRequest};
pub use engine::{DataDesc, Engine};
pub use error::{HoundError, Result};
pub use record::{DataFmt, DataId, DevId, FieldType, Period, Record, SeqNo, Unit};
pub use schema::SchemaDesc;
