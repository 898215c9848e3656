//! Linux-specific shared memory operations
//!
//! POSIX shared-memory objects (`/dev/shm/<name>`) opened through
//! `shm_open` and mapped with `memmap2`. Whether dropping a handle unlinks
//! the object is an explicit [`Ownership`] argument of the open call: the
//! broker owns every segment it creates, clients only ever borrow.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::getpid;
use shmb::consts::SEGMENT_NAME_PREFIX;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Who is responsible for unlinking the OS object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Unlink the object when this handle is dropped
    Owner,
    /// Never unlink; the object's lifetime is managed elsewhere
    Borrowed,
}

/// A mapped POSIX shared-memory object
pub struct ShmObject {
    name: String,
    mmap: MmapMut,
    ownership: Ownership,
}

impl std::fmt::Debug for ShmObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmObject")
            .field("name", &self.name)
            .field("len", &self.mmap.len())
            .field("ownership", &self.ownership)
            .finish()
    }
}

fn os_path(name: &str) -> String {
    format!("/{name}")
}

impl ShmObject {
    /// Create a new object of `size` bytes. Fails with `EEXIST` if `name` is taken.
    ///
    /// The returned handle is the [`Ownership::Owner`].
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        let fd = shm_open(
            os_path(name).as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);

        let mapped = file
            .set_len(size as u64)
            .map_err(ShmError::from)
            .and_then(|()| map_file(&file, size));

        match mapped {
            Ok(mmap) => Ok(Self {
                name: name.to_string(),
                mmap,
                ownership: Ownership::Owner,
            }),
            Err(e) => {
                let _ = shm_unlink(os_path(name).as_str());
                Err(e)
            }
        }
    }

    /// Open an existing object and map its full length.
    pub fn open(name: &str, ownership: Ownership) -> ShmResult<Self> {
        let fd = shm_open(os_path(name).as_str(), OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);
        let size = file.metadata()?.len() as usize;
        let mmap = map_file(&file, size)?;

        Ok(Self {
            name: name.to_string(),
            mmap,
            ownership,
        })
    }

    /// Object name without the leading slash
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True for a zero-length mapping
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Ownership this handle was opened with
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    /// Mapped bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owner {
            match shm_unlink(os_path(&self.name).as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {
                    tracing::debug!(name = %self.name, "unlinked shared memory object");
                }
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "shm_unlink failed");
                }
            }
        }
    }
}

fn map_file(file: &File, size: usize) -> ShmResult<MmapMut> {
    // SAFETY: the object is shared by design; callers only access it through
    // bounds-checked slices of this mapping.
    let mmap = unsafe { MmapOptions::new().len(size).map_mut(file)? };
    Ok(mmap)
}

/// True if an object called `name` currently exists
pub fn segment_exists(name: &str) -> bool {
    std::path::Path::new("/dev/shm").join(name).exists()
}

/// Generate a fresh object name: `shmb_<pid>_<counter>_<nanos>`
pub fn unique_segment_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    format!("{SEGMENT_NAME_PREFIX}{}_{counter}_{nanos:08x}", get_current_pid())
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
