//! Errors raised while provisioning a board.
//!
//! There are two severities that matter to the caller:
//!
//! * [`Error::Critical`]: the board or the host environment is unusable for
//!   this attempt (boot sequence failure, unreachable network, fatal transfer).
//!   It is reported as an infrastructure failure and is never retried within
//!   the same attempt.
//! * [`Error::OperationFailed`]: a specific command on the board returned a
//!   non-zero or unexpected result. It is reported as an ordinary deployment
//!   failure.
//!
//! Internal utility faults (mount, archive, unmount, partition lookup, external
//! tool exit status) surface as [`Error::Runtime`] and are wrapped into
//! `Critical` by the calling layers with [`Error::into_critical`].

use std::io;

/// The error type for all `bootmaster` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The board or environment is unusable for this attempt.
    #[error("{message}")]
    Critical {
        message: String,
        /// The lower-level failure that caused this one, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A command or remote operation returned a non-zero/unexpected result.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A host-side utility (mount, tar, parted, image tools...) failed.
    #[error("{0}")]
    Runtime(String),

    /// Fetching a remote artifact failed. Never retried at this level.
    #[error("download of `{url}` failed: {reason}")]
    Download { url: String, reason: String },

    /// The request was rejected before touching the board.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// A critical error with no underlying cause.
    pub fn critical(message: impl Into<String>) -> Self {
        Error::Critical {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap this error into a critical one, keeping it as the source. An error
    /// that is already critical gets the new message and keeps its own source
    /// chain underneath.
    pub fn into_critical(self, message: impl Into<String>) -> Self {
        Error::Critical {
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Error::Critical { .. })
    }

    /// Walk the source chain and return the innermost error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Critical {
                source: Some(inner),
                ..
            } => inner.root_cause(),
            other => other,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn into_critical_keeps_the_cause() {
    let err = Error::OperationFailed("executing \"false\" failed with code 1".into())
        .into_critical("Deployment failed");
    assert!(err.is_critical());
    assert_eq!(err.to_string(), "Deployment failed");
    match err.root_cause() {
        Error::OperationFailed(msg) => assert!(msg.contains("code 1")),
        other => panic!("unexpected root cause {:?}", other),
    }
}

#[test]
fn download_error_names_the_url() {
    let err = Error::Download {
        url: "http://host/rootfs.tgz".into(),
        reason: "404 Not Found".into(),
    };
    assert!(!err.is_critical());
    assert!(err.to_string().contains("http://host/rootfs.tgz"));
}
