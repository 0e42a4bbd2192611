//! Error types for the logical replication engine
//!
//! Mirrors the error kinds the replication session can raise: configuration
//! failures surface before any connection is made; connection, session
//! invariant, identity, and protocol failures close the handle before
//! surfacing; consumer-raised errors abort the stream loop after cleanup.

use thiserror::Error;

/// Errors produced by the replication engine.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Malformed LSN, unknown plugin-option value type, or an invalid slot/conninfo.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The driver refused the connection, or `replication=database` / healthy
    /// status could not be established.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// A session invariant did not hold (`integer_datetimes`, `search_path`
    /// reset, unsupported server version).
    #[error("session invariant violated: {message}")]
    SessionInvariant { message: String },

    /// `systemid`/`timeline`/`dbname` disagreed with the server.
    #[error("identity mismatch: {message}")]
    IdentityMismatch { message: String },

    /// Unexpected result status, or an unrecognized replication frame identifier.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The payload delivery callback returned an error; the loop aborts after
    /// running its cleanup path.
    #[error("consumer error: {0}")]
    Consumer(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Buffer framing was shorter than the message it claimed to carry.
    #[error("buffer error: {message}")]
    Buffer { message: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("invalid C string")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias used throughout the crate.
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn session_invariant<S: Into<String>>(message: S) -> Self {
        Self::SessionInvariant {
            message: message.into(),
        }
    }

    pub fn identity_mismatch<S: Into<String>>(message: S) -> Self {
        Self::IdentityMismatch {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn buffer<S: Into<String>>(message: S) -> Self {
        Self::Buffer {
            message: message.into(),
        }
    }

    pub fn consumer<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Consumer(Box::new(err))
    }

    /// True for the one transient driver condition the stream loop swallows.
    pub fn is_no_copy_in_progress(&self) -> bool {
        matches!(self, Self::Protocol { message } if message == "no COPY in progress")
    }
}
