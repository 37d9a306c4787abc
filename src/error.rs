use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmuError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("resource busy")]
    Busy,

    #[error("no mapping at the given address")]
    NotMapped,

    #[error("invalid client id: {0}")]
    InvalidClient(i32),

    #[error("not supported by this device: {0}")]
    Unsupported(&'static str),

    #[error("invariant violation: {0}")]
    Invariant(&'static str),
}

// A convenient alias
pub type MmuResult<T> = Result<T, MmuError>;
