//! Platform-specific shared memory primitives

pub mod linux;

pub use linux::{Ownership, ShmObject, get_current_pid, segment_exists, unique_segment_name};
