/* Hound error definitions: one variant per closed error code from the public API, plus `#[from]`
 * conversions for the I/O and schema-parsing failures the core wraps. */
use thiserror::Error;

/// Errors that may occur anywhere in the Hound core.
///
/// This is a closed enumeration: every fallible public operation returns one
/// of these variants, mirroring the `hound_err` codes of the original C
/// library one-to-one.
#[derive(Debug, Error)]
pub enum HoundError {
    #[error("null argument")]
    NullArgument,

    #[error("out of memory")]
    OutOfMemory,

    #[error("driver already registered: {0}")]
    DriverAlreadyRegistered(String),

    #[error("driver not registered: {0}")]
    DriverNotRegistered(String),

    #[error("driver in use: {0}")]
    DriverInUse(String),

    #[error("missing device ids")]
    MissingDeviceIds,

    #[error("conflicting drivers for data id {0:#x}")]
    ConflictingDrivers(u32),

    #[error("no data requested")]
    NoDataRequested,

    #[error("data id {0:#x} does not exist")]
    DataIdDoesNotExist(u32),

    #[error("context is already active")]
    ContextActive,

    #[error("context is not active")]
    ContextNotActive,

    #[error("queue is empty")]
    EmptyQueue,

    #[error("missing callback")]
    MissingCallback,

    #[error("period {period_ns}ns unsupported for data id {data_id:#x}")]
    PeriodUnsupported { data_id: u32, period_ns: u64 },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("queue too small (requested {0}, minimum 1)")]
    QueueTooSmall(usize),

    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("driver does not support this operation: {0}")]
    DriverUnsupported(String),

    #[error("driver failed: {0}")]
    DriverFail(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("interrupted")]
    Interrupted,

    #[error("device {0} does not exist")]
    DeviceDoesNotExist(String),

    #[error("too much data requested ({0} entries, max {1})")]
    TooMuchDataRequested(usize, usize),

    #[error("duplicate data id {0:#x} in request")]
    DuplicateDataRequested(u32),

    #[error("data id {0:#x} not present in schema")]
    IdNotInSchema(u32),

    #[error("descriptor duplicate: data id {0:#x} declared twice by the same driver")]
    DescriptorDuplicate(u32),

    #[error("driver already present at path: {0}")]
    DriverAlreadyPresent(String),

    #[error("schema parse error: {0}")]
    SchemaParse(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, HoundError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = HoundError::ConflictingDrivers(0x2);
        assert_eq!(err.to_string(), "conflicting drivers for data id 0x2");

        let err = HoundError::PeriodUnsupported {
            data_id: 1,
            period_ns: 500_000,
        };
        assert!(err.to_string().contains("500000ns"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: HoundError = io_err.into();
        assert!(matches!(err, HoundError::IoError(_)));
    }
}
