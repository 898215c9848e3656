//! # SHMB Leased Shared Memory
//!
//! Named POSIX shared-memory segments divided into equal buffers, whose
//! lifetime is owned by a per-machine broker and kept alive by leases. A lease
//! is nothing more than an open control connection: when the last client
//! holding a segment disconnects (cleanly or by crashing) the broker unlinks
//! the OS object.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  SHM_CREATE / SHM_ATTACH  ┌─────────────────────────┐
//! │  Context A   ├──────────────────────────►│  BrokerServer           │
//! │              │◄────── COMPLETE + name ───┤   connection tasks      │
//! └──────┬───────┘   (connection = lease)    │   registry actor        │
//!        │ mmap                              │   SegmentRegistry       │
//!        ▼                                   └───────────┬─────────────┘
//! ┌──────────────────────────────┐                       │ shm_open/unlink
//! │ /dev/shm/shmb_<pid>_<n>_<t>  │◄──────────────────────┘
//! │ [header | slot 0 | slot 1 …] │
//! └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmb_shared_memory::{Context, ServiceConfig, ensure_running};
//!
//! # async fn run() -> shmb_shared_memory::ShmResult<()> {
//! ensure_running(&ServiceConfig::resolve()?).await?;
//!
//! let mut ctx = Context::create(4, 1040).await?;
//! ctx.buffer(0)?.copy_from_slice(&[7u8; 1024]);
//!
//! let peer = Context::attach(ctx.name()).await?;
//! assert_eq!(peer.buffer_readonly(0)?[0], 7);
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **Context**: `Send + Sync`; many read-only views may coexist, a writable
//!   view needs `&mut Context`. A view held across `.await` delays unmapping
//!   after a disconnect until it is dropped.
//! - **RegistryHandle**: cloneable, every mutation is serialized by the actor.
//!
//! Content synchronization between processes sharing a segment is left to the
//! caller.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod context;
pub mod error;
pub mod platform;
pub mod registry;
pub mod segment;
pub mod service;

pub use broker::{BrokerServer, RegistryHandle, ShutdownHandle, spawn_signal_listener};
pub use context::{BufferMut, BufferRef, Context};
pub use error::{AttachFailure, ShmError, ShmResult};
pub use registry::{LeaseId, Release, SegmentRegistry, TeardownReport};
pub use segment::SegmentLayout;
pub use service::{BrokerProcess, ServiceConfig, ensure_running, shutdown_server};

/// Initialize tracing to stderr, filtered by `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
