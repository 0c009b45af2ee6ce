use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single `collect` invocation. Never escalates past the scheduler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor I/O failed: {0}")]
    Io(String),

    #[error("collect did not finish within {0:?}")]
    Timeout(Duration),

    #[error("sensor misconfigured: {0}")]
    Misconfigured(String),

    #[error("sensor produced invalid data: {0}")]
    InvalidData(String),
}

impl From<std::io::Error> for SensorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Rejected configuration. Fatal when it concerns the global config, per-sensor otherwise.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required key `{0}`")]
    Missing(String),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },

    #[error("duplicate sensor name `{0}`")]
    Duplicate(String),

    #[error("unknown sensor type `{0}`")]
    UnknownType(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnrollmentError {
    #[error("enrollment request failed: {0}")]
    Network(String),

    #[error("server rejected enrollment: {0}")]
    Rejected(String),

    #[error("certificate has not been signed yet")]
    Pending,

    #[error("certificate has been revoked")]
    Revoked,

    #[error("signed certificate does not match the local private key")]
    KeyMismatch,

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("certificate storage failure: {0}")]
    Storage(String),
}

impl From<std::io::Error> for EnrollmentError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<rcgen::Error> for EnrollmentError {
    fn from(err: rcgen::Error) -> Self {
        Self::Crypto(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection or TLS handshake failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error status {0}")]
    Server(u16),

    #[error("server rejected client certificate (status {0})")]
    CertificateRejected(u16),

    #[error("request refused with status {0}")]
    Client(u16),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("TLS configuration invalid: {0}")]
    Tls(String),
}

impl TransportError {
    /// Retrying the identical request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Timeout | Self::Server(_) | Self::Protocol(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            crate::channel::classify_status(status)
        } else if err.is_decode() || err.is_body() {
            Self::Protocol(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}
