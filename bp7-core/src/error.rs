use thiserror::Error;

/// Errors that can occur in the pool, codec, and cache layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BpError {
    #[error("required argument absent")]
    NullPointer,
    #[error("block pool exhausted or below allocation threshold")]
    OutOfMemory,
    #[error("decoded CRC does not match recomputed value")]
    InvalidCrc,
    #[error("duplicate key in unique index")]
    Duplicate,
    #[error("content signature not registered: {0:#010x}")]
    UnknownType(u32),
    #[error("wait deadline elapsed with no signal")]
    Timeout,
    #[error("configuration table validation failed")]
    TableOutOfRange,
    #[error("optional host callback not registered")]
    NullCallback,
    #[error("CBOR structure mismatch: {0}")]
    Codec(&'static str),
    #[error("operation attempted while interface is down")]
    InterfaceDown,
    #[error("invariant violation: {0}")]
    Fatal(&'static str),
}

pub type BpResult<T> = Result<T, BpError>;
