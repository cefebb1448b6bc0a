// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Split ring memory layout.
//!
//! ```text
//! desc[num]   16 bytes each   {addr u64, len u32, flags u16, next u16}
//! avail       {flags u16, idx u16, ring[num] u16, used_event u16}
//! (pad to align)
//! used        {flags u16, idx u16, ring[num] {id u32, len u32}, avail_event u16}
//! ```

use crate::virtqueue::{VqError, VQ_MAX_DESCRIPTORS};

/// Size of one descriptor table entry.
pub const VRING_DESC_SIZE: usize = 16;
const USED_ELEM_SIZE: usize = 8;

/// Byte offsets of the three ring parts relative to the ring start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringLayout {
    /// Number of descriptors.
    pub num: u16,
    /// Used-ring alignment.
    pub align: u32,
    /// Offset of the available ring.
    pub avail: usize,
    /// Offset of the used ring.
    pub used: usize,
    /// Total footprint in bytes.
    pub size: usize,
}

impl VringLayout {
    /// Validates `num`/`align` and computes the layout.
    pub fn new(num: u16, align: u32) -> Result<Self, VqError> {
        if num == 0 {
            return Err(VqError::InvalidParam);
        }
        if num > VQ_MAX_DESCRIPTORS {
            return Err(VqError::MaxDesc);
        }
        if !num.is_power_of_two() || align == 0 || !align.is_power_of_two() {
            return Err(VqError::Align);
        }
        let n = num as usize;
        let avail = VRING_DESC_SIZE * n;
        let avail_end = avail + 2 * (3 + n);
        let used = align_up(avail_end, align as usize);
        let size = used + 2 * 3 + USED_ELEM_SIZE * n;
        Ok(Self { num, align, avail, used, size })
    }

    /// Offset of descriptor `idx`.
    pub fn desc(&self, idx: u16) -> usize {
        VRING_DESC_SIZE * idx as usize
    }

    /// Offset of `avail.ring[slot]`.
    pub fn avail_ring(&self, slot: u16) -> usize {
        self.avail + 4 + 2 * slot as usize
    }

    /// Offset of `avail.used_event`.
    pub fn used_event(&self) -> usize {
        self.avail + 4 + 2 * self.num as usize
    }

    /// Offset of `used.ring[slot]`.
    pub fn used_ring(&self, slot: u16) -> usize {
        self.used + 4 + USED_ELEM_SIZE * slot as usize
    }

    /// Offset of `used.avail_event`.
    pub fn avail_event(&self) -> usize {
        self.used + 4 + USED_ELEM_SIZE * self.num as usize
    }
}

/// Bytes needed for a ring of `num` descriptors with a used ring aligned to `align`.
///
/// Returns 0 for an invalid geometry.
pub fn vring_size(num: u16, align: u32) -> usize {
    VringLayout::new(num, align).map_or(0, |l| l.size)
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_layout_matches_reference_sizes() {
        // 256 entries at 4 KiB alignment: desc 4096, avail 518 -> used at 8192.
        let layout = VringLayout::new(256, 4096).unwrap();
        assert_eq!(layout.avail, 4096);
        assert_eq!(layout.used, 8192);
        assert_eq!(layout.size, 8192 + 6 + 8 * 256);
        assert_eq!(vring_size(256, 4096), layout.size);
    }

    #[test]
    fn small_ring_offsets() {
        let layout = VringLayout::new(4, 16).unwrap();
        assert_eq!(layout.desc(3), 48);
        assert_eq!(layout.avail_ring(0), 68);
        assert_eq!(layout.used_event(), 76);
        assert_eq!(layout.used, 80);
        assert_eq!(layout.used_ring(1), 92);
        assert_eq!(layout.avail_event(), 116);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert_eq!(VringLayout::new(0, 16), Err(VqError::InvalidParam));
        assert_eq!(VringLayout::new(3, 16), Err(VqError::Align));
        assert_eq!(VringLayout::new(4, 12), Err(VqError::Align));
        assert_eq!(vring_size(6, 4096), 0);
    }
}
