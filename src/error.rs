//! Error types for secure-search

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration conflict: {0}")]
    ConfigConflict(String),

    #[error("Duplicate external_id: {0}")]
    DuplicateExternalId(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Plaintext leak blocked: {0}")]
    PlaintextLeak(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Error::Unauthenticated(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptCiphertext(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable tag, used in HTTP error bodies so the client
    /// can surface server errors verbatim.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "unauthenticated",
            Error::NotFound(_) => "not_found",
            Error::ConfigConflict(_) => "config_conflict",
            Error::DuplicateExternalId(_) => "duplicate_external_id",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::CorruptCiphertext(_) => "corrupt_ciphertext",
            Error::Validation(_) => "validation",
            Error::Timeout(_) => "timeout",
            Error::PlaintextLeak(_) => "plaintext_leak",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Transport(_) => "transport",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }

    /// Rebuild an error from the `kind` tag of an HTTP error body.
    pub fn from_kind(kind: &str, detail: String) -> Self {
        match kind {
            "unauthenticated" => Error::Unauthenticated(detail),
            "not_found" => Error::NotFound(detail),
            "config_conflict" => Error::ConfigConflict(detail),
            "duplicate_external_id" => Error::DuplicateExternalId(detail),
            "quota_exceeded" => Error::QuotaExceeded(detail),
            "corrupt_ciphertext" => Error::CorruptCiphertext(detail),
            "validation" => Error::Validation(detail),
            "timeout" => Error::Timeout(0),
            "plaintext_leak" => Error::PlaintextLeak(detail),
            "database" => Error::Database(detail),
            _ => Error::Internal(detail),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
