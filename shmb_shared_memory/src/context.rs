//! Client-side segment handle
//!
//! A [`Context`] is obtained by asking the broker to create or attach a
//! segment. The control connection it opened stays alive as the lease: a
//! background monitor task watches it, and when it ends (broker gone, broker
//! teardown, or [`Context::close`]) the local mapping is closed so that later
//! buffer access fails with `BufferError` instead of touching freed memory.
//!
//! ```rust,no_run
//! use shmb_shared_memory::Context;
//!
//! # async fn run() -> shmb_shared_memory::ShmResult<()> {
//! let mut producer = Context::create(4, 1040).await?;
//! producer.buffer(2)?.fill(0xAB);
//!
//! let consumer = Context::attach(producer.name()).await?;
//! assert!(consumer.buffer_readonly(2)?.iter().all(|&b| b == 0xAB));
//!
//! producer.close();
//! producer.wait_closed().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{AttachFailure, ShmError, ShmResult};
use crate::platform::{Ownership, ShmObject};
use crate::segment::SegmentLayout;
use crate::service::broker_address;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shmb::consts::DEFAULT_SHM_SIZE;
use shmb::protocol::{
    Command, ProtocolError, attach_request, create_request, read_byte, read_string,
};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Read-only view of one data block; releases the mapping lock on drop
pub type BufferRef<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// Writable view of one data block; releases the mapping lock on drop
pub type BufferMut<'a> = MappedRwLockWriteGuard<'a, [u8]>;

type SharedMapping = Arc<RwLock<Option<ShmObject>>>;

/// Poll interval while the monitor waits for live views to be dropped
const UNMAP_RETRY: Duration = Duration::from_millis(5);

enum Reply {
    Complete(String),
    Closed,
    Unexpected(u8),
}

async fn read_reply(stream: &mut TcpStream) -> Result<Reply, ProtocolError> {
    match read_byte(stream).await? {
        None => Ok(Reply::Closed),
        Some(byte) if byte == Command::Complete.as_byte() => {
            Ok(Reply::Complete(read_string(stream).await?))
        }
        Some(byte) => Ok(Reply::Unexpected(byte)),
    }
}

async fn connect(address: SocketAddr) -> ShmResult<TcpStream> {
    TcpStream::connect(address)
        .await
        .map_err(|e| ShmError::from_connect(address, e))
}

/// Leased, mapped segment
pub struct Context {
    name: String,
    layout: SegmentLayout,
    data_ranges: Vec<Range<usize>>,
    shm: SharedMapping,
    cancel: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("num_buffers", &self.layout.num_buffers())
            .field("buf_size", &self.layout.buf_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Context {
    /// Create a segment through the broker at the configured address.
    pub async fn create(num_buffers: u64, buf_size: u64) -> ShmResult<Self> {
        Self::create_at(broker_address()?, num_buffers, buf_size).await
    }

    /// Create a segment of `num_buffers` default-sized buffers.
    pub async fn create_default(num_buffers: u64) -> ShmResult<Self> {
        Self::create(num_buffers, DEFAULT_SHM_SIZE).await
    }

    /// [`create_default`](Self::create_default) against the broker at `address`.
    pub async fn create_default_at(address: SocketAddr, num_buffers: u64) -> ShmResult<Self> {
        Self::create_at(address, num_buffers, DEFAULT_SHM_SIZE).await
    }

    /// Create a segment through the broker at `address`.
    pub async fn create_at(address: SocketAddr, num_buffers: u64, buf_size: u64) -> ShmResult<Self> {
        SegmentLayout::new(num_buffers, buf_size)?;

        let mut stream = connect(address).await?;
        stream
            .write_all(&create_request(num_buffers, buf_size))
            .await?;

        let failed = |reason: String| ShmError::CreationError { reason };
        let name = match read_reply(&mut stream).await {
            Ok(Reply::Complete(name)) => name,
            Ok(Reply::Closed) => {
                return Err(failed(
                    "broker closed the connection without replying".to_string(),
                ));
            }
            Ok(Reply::Unexpected(byte)) => {
                return Err(failed(format!("unexpected reply byte {byte:#04x}")));
            }
            Err(e) => return Err(failed(e.to_string())),
        };

        debug!(%name, num_buffers, buf_size, "created segment");
        Self::open(name, stream)
    }

    /// Attach to an existing segment through the broker at the configured address.
    pub async fn attach(name: &str) -> ShmResult<Self> {
        Self::attach_at(broker_address()?, name).await
    }

    /// Attach to an existing segment through the broker at `address`.
    pub async fn attach_at(address: SocketAddr, name: &str) -> ShmResult<Self> {
        let mut stream = connect(address).await?;
        stream.write_all(&attach_request(name)).await?;

        let failed = |reason: AttachFailure| ShmError::AttachError {
            name: name.to_string(),
            reason,
        };
        let resolved = match read_reply(&mut stream).await {
            Ok(Reply::Complete(resolved)) => resolved,
            Ok(Reply::Closed) => return Err(failed(AttachFailure::InvalidName)),
            Ok(Reply::Unexpected(byte)) => {
                return Err(failed(AttachFailure::Protocol(format!(
                    "unexpected reply byte {byte:#04x}"
                ))));
            }
            Err(e) => return Err(failed(AttachFailure::Protocol(e.to_string()))),
        };

        debug!(name = %resolved, "attached segment");
        Self::open(resolved, stream)
    }

    // Map the object without taking unlink responsibility and start the monitor.
    fn open(name: String, stream: TcpStream) -> ShmResult<Self> {
        let shm = ShmObject::open(&name, Ownership::Borrowed)?;
        let layout = SegmentLayout::parse(shm.as_slice())?;
        let shm: SharedMapping = Arc::new(RwLock::new(Some(shm)));

        let (cancel, cancel_rx) = watch::channel(false);
        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(monitor(
            name.clone(),
            stream,
            shm.clone(),
            cancel_rx,
            closed_tx,
        ));

        Ok(Self {
            data_ranges: layout.data_ranges(),
            name,
            layout,
            shm,
            cancel,
            closed,
        })
    }

    fn check_index(&self, index: usize) -> ShmResult<Range<usize>> {
        self.data_ranges
            .get(index)
            .cloned()
            .ok_or(ShmError::IndexOutOfRange {
                index,
                num_buffers: self.layout.num_buffers(),
            })
    }

    fn disconnected(&self) -> ShmError {
        ShmError::BufferError {
            name: self.name.clone(),
        }
    }

    /// Writable view of the data block of buffer `index`.
    ///
    /// The view holds the mapping open: while it lives, a broker disconnect
    /// or teardown cannot unmap the segment, and `close` waits for it.
    pub fn buffer(&mut self, index: usize) -> ShmResult<BufferMut<'_>> {
        let range = self.check_index(index)?;
        let guard = self.shm.write();
        RwLockWriteGuard::try_map(guard, |slot| {
            slot.as_mut().map(|shm| &mut shm.as_mut_slice()[range])
        })
        .map_err(|_| self.disconnected())
    }

    /// Read-only view of the data block of buffer `index`.
    ///
    /// Any number of read-only views may be held at once. Each one delays
    /// unmapping after a disconnect until it is dropped.
    pub fn buffer_readonly(&self, index: usize) -> ShmResult<BufferRef<'_>> {
        let range = self.check_index(index)?;
        let guard = self.shm.read_recursive();
        RwLockReadGuard::try_map(guard, |slot| slot.as_ref().map(|shm| &shm.as_slice()[range]))
            .map_err(|_| self.disconnected())
    }

    /// Unmap locally and release the lease by closing the control connection.
    pub fn close(&mut self) {
        self.shm.write().take();
        self.cancel.send_replace(true);
    }

    /// Wait until the monitor has finished and the control connection is closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// True once the local mapping is gone
    pub fn is_closed(&self) -> bool {
        self.shm.read_recursive().is_none()
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer geometry
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Number of buffers
    pub fn num_buffers(&self) -> usize {
        self.layout.num_buffers()
    }

    /// Slot size including the 16-byte reserved prefix
    pub fn buf_size(&self) -> usize {
        self.layout.buf_size()
    }

    /// Usable bytes per buffer
    pub fn size(&self) -> usize {
        self.layout.data_size()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

async fn monitor(
    name: String,
    mut stream: TcpStream,
    shm: SharedMapping,
    mut cancel: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
) {
    let mut byte = [0u8; 1];
    tokio::select! {
        result = stream.read(&mut byte) => match result {
            Ok(0) => debug!(%name, "broker closed the control connection"),
            Ok(_) => debug!(%name, "unexpected data from broker"),
            Err(e) => debug!(%name, error = %e, "control connection failed"),
        },
        _ = cancel.wait_for(|cancelled| *cancelled) => trace!(%name, "monitor cancelled"),
    }

    // A view may still be alive on this very runtime thread; never block on it.
    loop {
        if let Some(mut slot) = shm.try_write() {
            slot.take();
            break;
        }
        trace!(%name, "buffer view still held, retrying unmap");
        tokio::time::sleep(UNMAP_RETRY).await;
    }
    drop(stream);
    closed.send_replace(true);
}
