// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Volatile access to a physically shared memory window.

use core::ptr;

use crate::io::Memory;

/// Memory reached through a raw mapping (device memory, carveouts, TCM).
pub struct RawMemory {
    base: *mut u8,
    len: usize,
}

// SAFETY: the creator of a `RawMemory` guarantees the mapping stays valid for its
// lifetime; all accesses are volatile byte copies with no references handed out.
unsafe impl Send for RawMemory {}
// SAFETY: see above, concurrent volatile accesses do not create aliasing references.
unsafe impl Sync for RawMemory {}

impl RawMemory {
    /// Wraps `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped, writable and remain valid for as long as
    /// the returned value (and any `IoRegion` built on it) is alive.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

impl Memory for RawMemory {
    fn size(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: `IoRegion` bounds-checks `offset + dst.len() <= len`.
            *byte = unsafe { ptr::read_volatile(self.base.add(offset + i)) };
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: `IoRegion` bounds-checks `offset + src.len() <= len`.
            unsafe { ptr::write_volatile(self.base.add(offset + i), *byte) };
        }
    }
}
