use std::time::Duration;

use thiserror::Error;

use crate::biometric::Modality;

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome categories of the engine.
///
/// `InvalidBiometric` and `AccessDenied` render the same message so a caller
/// relaying `Display` output cannot tell a rejected capture from a wrong key.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("access denied")]
    InvalidBiometric { modality: Modality, score: f64 },

    #[error("access denied")]
    AccessDenied,

    #[error(
        "too many failed attempts, retry in {} seconds",
        .retry_after.as_millis().div_ceil(1000).max(1)
    )]
    RateLimited { retry_after: Duration },

    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    #[error("engine busy, too many requests in flight")]
    Busy,

    #[error("file too large: {size} bytes (maximum {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this failure counts against the attempt budget of an identity.
    pub fn is_recorded_failure(&self) -> bool {
        matches!(self, Error::InvalidBiometric { .. } | Error::AccessDenied)
    }
}
