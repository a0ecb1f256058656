/* Record & refcount (component A): the in-flight record object shared by N subscriber queues,
 * released when the last queue drops its reference. */
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// Globally-unique identifier for a kind of data, assigned by a schema.
pub type DataId = u32;

/// Identifier for a driver instance, assigned by the registry at init time.
pub type DevId = u8;

/// Per-driver-instance monotonic sequence number.
pub type SeqNo = u64;

/// A data period in nanoseconds. `0` means on-demand (pull) data.
pub type Period = u64;

/// SI-ish units for a data field. Time is nanoseconds rather than seconds to
/// avoid floating point drift, matching the legacy C header's own rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Degree,
    Kelvin,
    KgPerSecond,
    Meter,
    MetersPerSecond,
    MetersPerSecondSquared,
    None,
    Pascal,
    Percent,
    Radian,
    RadianPerSecond,
    Nanosecond,
}

impl Unit {
    /// Parse the schema's textual unit vocabulary.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "degree" => Unit::Degree,
            "K" => Unit::Kelvin,
            "kg/s" => Unit::KgPerSecond,
            "m" => Unit::Meter,
            "m/s" => Unit::MetersPerSecond,
            "m/s^2" | "m/s\u{b2}" => Unit::MetersPerSecondSquared,
            "none" => Unit::None,
            "Pa" => Unit::Pascal,
            "percent" => Unit::Percent,
            "rad" => Unit::Radian,
            "rad/s" => Unit::RadianPerSecond,
            "ns" => Unit::Nanosecond,
            _ => return None,
        })
    }
}

/// Primitive field types a payload's format may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    F32,
    F64,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Bytes,
}

impl FieldType {
    /// Parse the schema's textual type vocabulary.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "f32" => FieldType::F32,
            "f64" => FieldType::F64,
            "i8" => FieldType::I8,
            "u8" => FieldType::U8,
            "i16" => FieldType::I16,
            "u16" => FieldType::U16,
            "i32" => FieldType::I32,
            "u32" => FieldType::U32,
            "i64" => FieldType::I64,
            "u64" => FieldType::U64,
            "bytes" => FieldType::Bytes,
            _ => return None,
        })
    }

    /// Byte width of one instance of this type, or `None` for `Bytes` (which
    /// always uses the format entry's explicit `size`).
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            FieldType::F32 | FieldType::I32 | FieldType::U32 => Some(4),
            FieldType::F64 | FieldType::I64 | FieldType::U64 => Some(8),
            FieldType::I8 | FieldType::U8 => Some(1),
            FieldType::I16 | FieldType::U16 => Some(2),
            FieldType::Bytes => None,
        }
    }
}

/// Describes one field inside a record's payload. `size == 0` means "all
/// remaining bytes."
#[derive(Debug, Clone, PartialEq)]
pub struct DataFmt {
    pub name: String,
    pub unit: Unit,
    pub offset: usize,
    pub size: usize,
    pub ty: FieldType,
}

/// One timestamped, typed payload emitted by a driver.
///
/// Payload ownership: a driver allocates `payload` during `parse`/`poll`;
/// ownership transfers to the core on return and is released (by simply
/// dropping the `Vec`) when the last subscribing queue drops its envelope.
#[derive(Debug, Clone)]
pub struct Record {
    pub seqno: SeqNo,
    pub data_id: DataId,
    pub dev_id: DevId,
    pub timestamp: SystemTime,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The shared, refcounted wrapper that lets one record reach N queues
/// without copying the payload.
///
/// Created by the I/O loop with a refcount equal to the number of
/// subscribing queues at emission time; each queue releases its reference
/// exactly once, on drain or on overflow-eviction. The record is dropped
/// (freeing the payload) when the last reference is released.
#[derive(Debug)]
pub struct RecordEnvelope {
    pub record: Record,
    refcount: AtomicUsize,
}

impl RecordEnvelope {
    /// Create a new envelope with the refcount initialized to `subscribers`.
    pub fn new(record: Record, subscribers: usize) -> Self {
        Self {
            record,
            refcount: AtomicUsize::new(subscribers),
        }
    }

    /// Current refcount, for diagnostics and tests only — never a basis for
    /// control flow, since it can change concurrently.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the refcount. Used only when an envelope is handed to an
    /// additional queue after creation (never required by the core today,
    /// since fan-out width is fixed at emission time, but kept symmetric
    /// with `release` for future extension).
    pub fn acquire(self: &std::sync::Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one reference. Returns `true` if this was the last reference
    /// (the caller should drop its `Arc`, which frees the payload).
    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(seqno: SeqNo) -> Record {
        Record {
            seqno,
            data_id: 1,
            dev_id: 0,
            timestamp: SystemTime::now(),
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn refcount_balance_single_subscriber() {
        let env = RecordEnvelope::new(sample_record(0), 1);
        assert_eq!(env.refcount(), 1);
        assert!(env.release());
    }

    #[test]
    fn refcount_balance_multiple_subscribers() {
        let env = RecordEnvelope::new(sample_record(0), 3);
        assert!(!env.release());
        assert!(!env.release());
        assert!(env.release());
    }

    #[test]
    fn unit_roundtrip() {
        for s in ["degree", "K", "kg/s", "m", "m/s", "none", "Pa", "percent", "rad", "rad/s", "ns"] {
            assert!(Unit::from_str(s).is_some(), "unit {s} failed to parse");
        }
        assert!(Unit::from_str("bogus").is_none());
    }

    #[test]
    fn field_type_fixed_sizes() {
        assert_eq!(FieldType::F32.fixed_size(), Some(4));
        assert_eq!(FieldType::U64.fixed_size(), Some(8));
        assert_eq!(FieldType::Bytes.fixed_size(), None);
    }
}
