//! Error types for belay operations.

use belay_proto::{FramingError, LiteralError};

/// Alias for `Result<T, belay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by device operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The byte channel to the device failed.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The device did not acknowledge within the bounded wait.
    #[error("timed out waiting for {0}")]
    ProtocolTimeout(String),

    /// A sentinel line did not follow the response grammar.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A result payload could not be decoded.
    #[error(transparent)]
    Literal(#[from] LiteralError),

    /// Code raised an exception on the device.
    #[error("{remapped}")]
    RemoteExecution {
        /// Traceback as printed by the device.
        raw: String,
        /// Traceback with line numbers mapped back to the host source.
        remapped: String,
    },

    /// The reconnect budget is exhausted or the replay failed.
    #[error("connection to device lost")]
    ConnectionLost,

    /// A remote path has a different kind than the local one.
    #[error("sync conflict at {path}: local {local}, remote {remote}")]
    SyncConflict {
        /// Remote path.
        path: String,
        /// Kind on the host (`file` / `dir`).
        local: &'static str,
        /// Kind on the device (`file` / `dir`).
        remote: &'static str,
    },

    /// The detected implementation lacks a required feature.
    #[error("{0} is not available on this device")]
    FeatureUnavailable(String),

    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device handle was closed.
    #[error("device is closed")]
    Closed,

    /// A local filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for failures that leave the session disconnected.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ProtocolTimeout(_))
    }

    /// Builds a [`Error::RemoteExecution`] whose traceback needs no remapping.
    pub(crate) fn remote(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self::RemoteExecution {
            remapped: raw.clone(),
            raw,
        }
    }
}
