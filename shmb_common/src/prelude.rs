//! Prelude module for common re-exports.
//!
//! ```rust
//! use shmb_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{BrokerConfig, ConfigError, ConfigLoader, LogLevel, SharedConfig};

// ─── Layout Constants ───────────────────────────────────────────────
pub use crate::consts::{
    BUFFER_HEADER_SIZE, DEFAULT_BROKER_ADDR, DEFAULT_SHM_SIZE, SEGMENT_HEADER_SIZE, SHM_MAX_SIZE,
};

// ─── Control Protocol ───────────────────────────────────────────────
pub use crate::protocol::{Command, ProtocolError};
