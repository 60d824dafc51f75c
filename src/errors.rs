//! Error types for the replication-to-Kafka bridge
//!
//! Structured error handling using thiserror. Fatal conditions (protocol
//! violations, unknown relations) and policy-controlled conditions (registry,
//! encoder, broker failures) share this one enum; the supervisor decides the
//! disposition.

use crate::types::Oid;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Database or broker connection errors
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Upstream replication protocol violations (always fatal)
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A row event referenced a relation with no registered schema
    #[error("relid {relid} has no registered schema")]
    UnknownRelation { relid: Oid },

    /// Schema registry request failed
    #[error("schema registry error for subject {subject}: {message}")]
    SchemaRegistry { subject: String, message: String },

    /// Message encoding failed
    #[error("error encoding message for topic {topic}: {message}")]
    Encoding { topic: String, message: String },

    /// Broker producer errors other than queue-full
    #[error("broker error: {message}")]
    Broker { message: String },

    /// Graceful shutdown was requested while blocking
    #[error("shutdown requested")]
    Shutdown,

    /// Filesystem/IO errors (pid file, etc.)
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// String conversion errors from the wire
    #[error("string conversion error")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Interior NUL while building a C string for libpq
    #[error("C string conversion error")]
    NulByte(#[from] std::ffi::NulError),
}

/// Result type alias for convenience
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create an encoding error
    pub fn encoding<S: Into<String>, T: Into<String>>(topic: T, message: S) -> Self {
        Self::Encoding {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// True when this error is the cooperative-shutdown marker rather than a
    /// real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
