use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("HTTP request error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Bad response for {url}: HTTP {status}")]
    BadResponse { url: String, status: u16 },

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Unsupported checksum type: {0}")]
    UnsupportedChecksum(String),

    #[error("GPG signature verification failed for {}", .0.display())]
    SignatureInvalid(PathBuf),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("SQLite database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Repo metadata error: {0}")]
    Metadata(String),

    #[error("RPM parse error: {0}")]
    RpmParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}: {1}")]
    IoContext(String, #[source] std::io::Error),

    #[error("Interrupted")]
    Interrupted,

    #[error("{0}")]
    Internal(String),
}

impl From<rpm::Error> for Error {
    fn from(err: rpm::Error) -> Self {
        Self::RpmParse(err.to_string())
    }
}

/// Attaches a human-readable location to bare IO errors.
pub trait ErrorContext<T> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T, Error>;
}

impl<T> ErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T, Error> {
        self.map_err(|err| Error::IoContext(context(), err))
    }
}
