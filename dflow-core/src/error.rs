use thiserror::Error;

/// Failure raised by a user-supplied chunk processor. Kept separate from
/// [`DflowError`] so a processing step cannot surface a store error by
/// accident: the controller records these as Failed and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum DflowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    /// No unused chunk left to assign. Expected terminal condition of
    /// selection, not a fault.
    #[error("no unused chunk available")]
    EmptyPool,

    #[error("chunk processing failed: {0}")]
    Processing(#[from] ProcessingError),
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, DflowError>;
