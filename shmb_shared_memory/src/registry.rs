//! Segment registry: which segments exist and who holds a lease on them
//!
//! Pure state owned by the broker. A segment is unlinked exactly when its
//! lease set drains to empty; dropping the registry unlinks whatever is left.

use crate::error::ShmResult;
use crate::platform::ShmObject;
use crate::segment::{SegmentLayout, create_segment};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Broker-local identifier of one control connection
pub type LeaseId = u64;

/// Outcome of releasing a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other leases remain; the segment stays
    Retained {
        /// Leases still held
        remaining: usize,
    },
    /// That was the last lease; the segment was closed and unlinked
    Unlinked,
    /// No such segment or lease
    Unknown,
}

/// Summary of a registry teardown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Segments unlinked
    pub segments: usize,
    /// Leases that were still held
    pub leases: usize,
}

struct SegmentEntry {
    // Owner handle: dropping the entry unlinks the object.
    shm: ShmObject,
    layout: SegmentLayout,
    leases: HashSet<LeaseId>,
}

/// Map of segment name to OS handle and lease set
#[derive(Default)]
pub struct SegmentRegistry {
    segments: HashMap<String, SegmentEntry>,
}

impl SegmentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a segment and register it with `lease` as its only holder.
    ///
    /// Returns the OS-assigned segment name.
    pub fn create(&mut self, num_buffers: u64, buf_size: u64, lease: LeaseId) -> ShmResult<String> {
        let layout = SegmentLayout::new(num_buffers, buf_size)?;
        let shm = create_segment(layout)?;
        let name = shm.name().to_string();

        debug!(%name, num_buffers, buf_size, lease, "created segment");
        self.segments.insert(
            name.clone(),
            SegmentEntry {
                shm,
                layout,
                leases: HashSet::from([lease]),
            },
        );
        Ok(name)
    }

    /// Add `lease` to an existing segment. Returns false if `name` is unknown.
    pub fn attach(&mut self, name: &str, lease: LeaseId) -> bool {
        match self.segments.get_mut(name) {
            Some(entry) => {
                entry.leases.insert(lease);
                debug!(%name, lease, leases = entry.leases.len(), "attached lease");
                true
            }
            None => false,
        }
    }

    /// Drop `lease` from `name`; unlink the segment if no lease remains
    pub fn release(&mut self, name: &str, lease: LeaseId) -> Release {
        let Some(entry) = self.segments.get_mut(name) else {
            return Release::Unknown;
        };
        if !entry.leases.remove(&lease) {
            return Release::Unknown;
        }

        if entry.leases.is_empty() {
            debug!(%name, bytes = entry.shm.len(), "unlinking segment");
            self.segments.remove(name);
            Release::Unlinked
        } else {
            Release::Retained {
                remaining: entry.leases.len(),
            }
        }
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.segments.contains_key(name)
    }

    /// Leases held on `name`
    pub fn lease_count(&self, name: &str) -> Option<usize> {
        self.segments.get(name).map(|entry| entry.leases.len())
    }

    /// Layout of `name`
    pub fn layout(&self, name: &str) -> Option<SegmentLayout> {
        self.segments.get(name).map(|entry| entry.layout)
    }

    /// Registered segment names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.segments.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if no segment is registered
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Unlink every remaining segment regardless of leases
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (name, entry) in self.segments.drain() {
            debug!(%name, leases = entry.leases.len(), "unlinking on teardown");
            report.segments += 1;
            report.leases += entry.leases.len();
        }
        report
    }
}
