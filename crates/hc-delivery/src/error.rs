use std::fmt;

use hc_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Shutdown interrupted retry loops before these events were delivered
    #[error("{abandoned} event(s) abandoned ({delivered} delivered, {failed} failed)")]
    Abandoned {
        abandoned: usize,
        delivered: usize,
        failed: usize,
    },

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Concurrency gate closed")]
    GateClosed,
}

impl DeliveryError {
    /// True when the error means some events were abandoned
    pub fn is_abandoned(&self) -> bool {
        matches!(self, DeliveryError::Abandoned { .. })
    }
}

/// Whether a transport failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Timeouts, refused or reset connections, closed streams
    Transient,
    /// Malformed requests, redirect loops, anything unclassified
    Fatal,
}

#[derive(Error, Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Transient, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Fatal, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportErrorKind::Transient => write!(f, "transient: {}", self.message),
            TransportErrorKind::Fatal => write!(f, "fatal: {}", self.message),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            TransportError::transient(err.to_string())
        } else {
            TransportError::fatal(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
