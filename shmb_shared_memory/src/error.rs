//! Error types for shared memory operations

use shmb::config::ConfigError;
use shmb::protocol::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// No broker is listening at the control address
    #[error("No broker reachable at {address}")]
    ConnectionRefused {
        /// Control address that refused the connection
        address: SocketAddr,
    },

    /// Malformed or truncated control traffic
    #[error("Protocol error: {source}")]
    Protocol {
        /// Source protocol error
        #[from]
        source: ProtocolError,
    },

    /// The broker did not complete a create request
    #[error("Error creating SHM segment: {reason}")]
    CreationError {
        /// What went wrong
        reason: String,
    },

    /// The broker did not complete an attach request
    #[error("Error attaching SHM segment {name}: {reason}")]
    AttachError {
        /// Requested segment name
        name: String,
        /// Failure classification
        reason: AttachFailure,
    },

    /// Buffer requested after the local mapping was closed
    #[error("Cannot access {name}: segment mapping closed (broker disconnected or context closed)")]
    BufferError {
        /// Segment name
        name: String,
    },

    /// Buffer index outside `0..num_buffers`
    #[error("Buffer index {index} out of range for segment with {num_buffers} buffers")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Buffers in the segment
        num_buffers: usize,
    },

    /// Mapped object does not match the layout its header describes
    #[error("Segment layout mismatch: header describes {expected} bytes, object has {found}")]
    VersionMismatch {
        /// Size implied by the header
        expected: u64,
        /// Actual object size
        found: u64,
    },

    /// Requested buffer geometry cannot form a segment
    #[error("Invalid segment layout: {num_buffers} buffers of {buf_size} bytes")]
    InvalidLayout {
        /// Requested buffer count
        num_buffers: u64,
        /// Requested slot size
        buf_size: u64,
    },

    /// Broker process could not be started
    #[error("Failed to spawn broker: {reason}")]
    SpawnFailed {
        /// What went wrong
        reason: String,
    },

    /// Spawned broker never reported readiness
    #[error("Broker not ready after {timeout_ms} ms")]
    ReadyTimeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Why an attach request failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachFailure {
    /// The broker closed the connection without replying: no such segment
    #[error("invalid SHM name")]
    InvalidName,

    /// The broker replied with something other than `COMPLETE`
    #[error("{0}")]
    Protocol(String),
}

impl ShmError {
    /// Classify a failed connect to the broker.
    pub(crate) fn from_connect(address: SocketAddr, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::ConnectionRefused {
            Self::ConnectionRefused { address }
        } else {
            Self::Io { source }
        }
    }

    /// True when this is an attach failure for an unknown segment name.
    pub fn is_invalid_name(&self) -> bool {
        matches!(
            self,
            Self::AttachError {
                reason: AttachFailure::InvalidName,
                ..
            }
        )
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
