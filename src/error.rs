use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("does not exist: {0}")]
    DoesNotExist(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("no data")]
    NoData,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Internal-only signal used between the chunk backends and `Series`. Never
/// surfaced to callers: spec requires `ChunkFull` to stay entirely internal.
pub(crate) enum AppendOutcome<T> {
    Ok(T),
    Full,
}
