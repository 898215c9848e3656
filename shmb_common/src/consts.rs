//! System-wide constants for the SHMB workspace.
//!
//! Single source of truth for the broker address, the segment layout and
//! size limits. Imported by all crates — no duplication permitted.

use static_assertions::const_assert;

/// Default broker host.
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";

/// Default broker TCP port.
pub const DEFAULT_BROKER_PORT: u16 = 25979;

/// Default broker address (`host:port`).
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:25979";

/// Environment variable overriding the broker address.
pub const BROKER_ADDR_ENV: &str = "SHMB_ADDRESS";

/// Environment variable naming the broker executable used by `ensure_running`.
pub const BROKER_BIN_ENV: &str = "SHMB_BROKER_BIN";

/// Executable name looked up on `PATH` when [`BROKER_BIN_ENV`] is unset.
pub const DEFAULT_BROKER_BIN: &str = "shmb";

/// Size of the global segment header (`num_buffers` + `buf_size`).
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Reserved prefix at the start of every buffer slot.
pub const BUFFER_HEADER_SIZE: usize = 16;

/// Default buffer slot size (header included) when a caller does not pick one.
pub const DEFAULT_SHM_SIZE: u64 = 1 << 16;

/// Maximum total segment size in bytes (1 GiB).
pub const SHM_MAX_SIZE: u64 = 1 << 30;

/// Prefix of every OS shared-memory object created by the broker.
pub const SEGMENT_NAME_PREFIX: &str = "shmb_";

/// Longest string accepted on the control connection.
pub const MAX_STRING_LEN: u64 = 4096;

/// Line written to stdout by a broker started with `--notify-ready`.
pub const READY_LINE_PREFIX: &str = "READY";

/// Default time `ensure_running` waits for a spawned broker to become ready.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;

const_assert!(SEGMENT_HEADER_SIZE == 2 * core::mem::size_of::<u64>());
const_assert!(DEFAULT_SHM_SIZE > BUFFER_HEADER_SIZE as u64);
const_assert!(DEFAULT_SHM_SIZE <= SHM_MAX_SIZE);
