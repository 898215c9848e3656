//! SHMB Common Library
//!
//! This crate provides the constants, configuration loading utilities and
//! control-connection wire codec shared by every SHMB workspace crate.
//!
//! # Module Structure
//!
//! - [`consts`] - Broker address, segment layout and size limits
//! - [`config`] - Configuration loading traits and types
//! - [`protocol`] - Command byte and length-prefixed framing primitives
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! shmb = { package = "shmb_common", path = "../shmb_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use shmb_common::consts::*;
//! use shmb_common::config::{BrokerConfig, ConfigLoader};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod protocol;
