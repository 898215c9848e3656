//! Segment memory layout
//!
//! ```text
//! [ u64 LE -- num_buffers ]
//! [ u64 LE -- buf_size    ]
//! [ 16 bytes reserved (zero) | buf_size - 16 bytes data block ]   buffer 0
//! [ 16 bytes reserved (zero) | buf_size - 16 bytes data block ]   buffer 1
//! ...
//! ```
//!
//! `buf_size` counts the reserved prefix. The header is written once by the
//! broker at creation and only read afterwards.

use crate::error::{ShmError, ShmResult};
use crate::platform::{ShmObject, unique_segment_name};
use nix::errno::Errno;
use shmb::consts::{BUFFER_HEADER_SIZE, SEGMENT_HEADER_SIZE, SHM_MAX_SIZE};
use shmb::protocol::{decode_u64, encode_u64};
use std::ops::Range;

/// Attempts at finding an unused object name before giving up
const NAME_ATTEMPTS: usize = 8;

/// Buffer geometry of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    num_buffers: u64,
    buf_size: u64,
}

impl SegmentLayout {
    /// Validate and build a layout.
    ///
    /// Requires at least one buffer, `buf_size` larger than the reserved
    /// prefix and a total size within [`SHM_MAX_SIZE`].
    pub fn new(num_buffers: u64, buf_size: u64) -> ShmResult<Self> {
        let invalid = || ShmError::InvalidLayout {
            num_buffers,
            buf_size,
        };

        if num_buffers == 0 || buf_size <= BUFFER_HEADER_SIZE as u64 {
            return Err(invalid());
        }
        let total = num_buffers
            .checked_mul(buf_size)
            .and_then(|n| n.checked_add(SEGMENT_HEADER_SIZE as u64))
            .ok_or_else(invalid)?;
        if total > SHM_MAX_SIZE {
            return Err(invalid());
        }

        Ok(Self {
            num_buffers,
            buf_size,
        })
    }

    /// Number of buffer slots
    pub fn num_buffers(&self) -> usize {
        self.num_buffers as usize
    }

    /// Slot size including the reserved prefix
    pub fn buf_size(&self) -> usize {
        self.buf_size as usize
    }

    /// Usable bytes per buffer
    pub fn data_size(&self) -> usize {
        self.buf_size() - BUFFER_HEADER_SIZE
    }

    /// Total object size: header plus all slots
    pub fn total_size(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.num_buffers() * self.buf_size()
    }

    /// Byte range of slot `index`, reserved prefix included
    pub fn slot_range(&self, index: usize) -> Range<usize> {
        let start = SEGMENT_HEADER_SIZE + index * self.buf_size();
        start..start + self.buf_size()
    }

    /// Byte range of the data block of slot `index`
    pub fn data_range(&self, index: usize) -> Range<usize> {
        let slot = self.slot_range(index);
        slot.start + BUFFER_HEADER_SIZE..slot.end
    }

    /// Data block ranges of every slot, in index order
    pub fn data_ranges(&self) -> Vec<Range<usize>> {
        (0..self.num_buffers()).map(|i| self.data_range(i)).collect()
    }

    /// Encode the 16-byte global header
    pub fn header_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[..8].copy_from_slice(&encode_u64(self.num_buffers));
        out[8..].copy_from_slice(&encode_u64(self.buf_size));
        out
    }

    /// Parse the header of a mapped segment and check it against the mapping size
    pub fn parse(bytes: &[u8]) -> ShmResult<Self> {
        let num_buffers = decode_u64(bytes)?;
        let buf_size = decode_u64(bytes.get(8..).unwrap_or_default())?;
        let layout = Self::new(num_buffers, buf_size)?;

        if layout.total_size() != bytes.len() {
            return Err(ShmError::VersionMismatch {
                expected: layout.total_size() as u64,
                found: bytes.len() as u64,
            });
        }
        Ok(layout)
    }

    /// Zero-fill a freshly created object and write the header
    pub fn initialize(&self, bytes: &mut [u8]) {
        bytes.fill(0);
        bytes[..SEGMENT_HEADER_SIZE].copy_from_slice(&self.header_bytes());
    }
}

/// Create, zero-fill and stamp a new owned segment under a fresh unique name
pub fn create_segment(layout: SegmentLayout) -> ShmResult<ShmObject> {
    let mut last_err = None;
    for _ in 0..NAME_ATTEMPTS {
        let name = unique_segment_name();
        match ShmObject::create(&name, layout.total_size()) {
            Ok(mut shm) => {
                layout.initialize(shm.as_mut_slice());
                return Ok(shm);
            }
            Err(ShmError::Nix {
                source: Errno::EEXIST,
            }) => {
                tracing::debug!(%name, "segment name taken, retrying");
                last_err = Some(Errno::EEXIST);
            }
            Err(e) => return Err(e),
        }
    }
    Err(ShmError::Nix {
        source: last_err.unwrap_or(Errno::EEXIST),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_validation() {
        assert!(SegmentLayout::new(1, 17).is_ok());
        assert!(SegmentLayout::new(64, 4096).is_ok());

        assert!(SegmentLayout::new(0, 4096).is_err());
        assert!(SegmentLayout::new(4, 16).is_err());
        assert!(SegmentLayout::new(4, 0).is_err());
        assert!(SegmentLayout::new(u64::MAX, 4096).is_err());
        assert!(SegmentLayout::new(2, SHM_MAX_SIZE).is_err());
    }

    #[test]
    fn test_total_size() {
        let layout = SegmentLayout::new(4, 1040).unwrap();
        assert_eq!(layout.total_size(), 16 + 4 * 1040);
        assert_eq!(layout.data_size(), 1024);
    }

    #[test]
    fn test_data_ranges() {
        let layout = SegmentLayout::new(3, 64).unwrap();
        assert_eq!(layout.data_range(0), 32..80);
        assert_eq!(layout.data_range(1), 96..144);
        assert_eq!(layout.data_range(2), 160..208);
        assert_eq!(layout.data_range(2).end, layout.total_size());
    }

    #[test]
    fn test_header_parse() {
        let layout = SegmentLayout::new(5, 32).unwrap();
        let mut bytes = vec![0xFFu8; layout.total_size()];
        layout.initialize(&mut bytes);

        assert_eq!(SegmentLayout::parse(&bytes).unwrap(), layout);
        assert!(bytes[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_parse_size_mismatch() {
        let layout = SegmentLayout::new(2, 64).unwrap();
        let mut bytes = vec![0u8; layout.total_size() + 8];
        layout.initialize(&mut bytes);

        assert!(matches!(
            SegmentLayout::parse(&bytes),
            Err(ShmError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_header_parse_truncated() {
        assert!(matches!(
            SegmentLayout::parse(&[0u8; 10]),
            Err(ShmError::Protocol { .. })
        ));
    }

    #[test]
    fn test_create_segment_is_zeroed() {
        let layout = SegmentLayout::new(2, 48).unwrap();
        let shm = create_segment(layout).unwrap();
        assert_eq!(shm.len(), layout.total_size());
        assert_eq!(&shm.as_slice()[..16], &layout.header_bytes());
        assert!(shm.as_slice()[16..].iter().all(|&b| b == 0));
    }
}
