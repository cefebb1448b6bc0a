// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Offset-addressed shared memory regions.
//!
//! Every access into memory shared with the peer goes through an `IoRegion`;
//! nothing in the transport dereferences a raw pointer. Multi-byte accessors
//! are little-endian, matching the virtio and rpmsg wire formats.

use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{Bus, CacheOps};

/// Errors produced by block accesses on an `IoRegion`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The access does not fit inside the region.
    #[error("access out of range: offset {offset:#x} len {len:#x} size {size:#x}")]
    OutOfRange {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Region size.
        size: usize,
    },
}

/// Byte store behind an `IoRegion`.
///
/// Offsets handed to these methods are already bounds-checked by the region.
pub trait Memory: Send + Sync {
    /// Size of the store in bytes.
    fn size(&self) -> usize;
    /// Copies `dst.len()` bytes out of the store.
    fn read(&self, offset: usize, dst: &mut [u8]);
    /// Copies `src` into the store.
    fn write(&self, offset: usize, src: &[u8]);
    /// Sets `len` bytes to `value`.
    fn fill(&self, offset: usize, value: u8, len: usize) {
        let chunk = [value; 64];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            self.write(offset + done, &chunk[..n]);
            done += n;
        }
    }
}

/// Heap-backed memory, used to emulate a shared region between two sides on a host.
pub struct HeapMemory {
    bytes: Mutex<Box<[u8]>>,
}

impl HeapMemory {
    /// Allocates `size` zeroed bytes.
    pub fn new(size: usize) -> Self {
        Self { bytes: Mutex::new(vec![0u8; size].into_boxed_slice()) }
    }
}

impl Memory for HeapMemory {
    fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.lock();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }

    fn fill(&self, offset: usize, value: u8, len: usize) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + len].fill(value);
    }
}

/// A window onto a `Memory` store with a physical base address.
///
/// Cloning is cheap and yields a handle onto the same bytes.
#[derive(Clone)]
pub struct IoRegion {
    mem: Arc<dyn Memory>,
    start: usize,
    size: usize,
    phys_base: u64,
    cache: Option<Arc<dyn CacheOps>>,
}

impl fmt::Debug for IoRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRegion")
            .field("phys_base", &format_args!("{:#x}", self.phys_base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl IoRegion {
    /// Wraps the whole of `mem`, mapping offset 0 to `phys_base`.
    pub fn new(mem: Arc<dyn Memory>, phys_base: u64) -> Self {
        let size = mem.size();
        Self { mem, start: 0, size, phys_base, cache: None }
    }

    /// Allocates a zeroed heap region of `size` bytes at `phys_base`.
    pub fn heap(phys_base: u64, size: usize) -> Self {
        Self::new(Arc::new(HeapMemory::new(size)), phys_base)
    }

    /// Attaches cache maintenance hooks.
    pub fn with_cache(mut self, cache: Arc<dyn CacheOps>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns a sub-window `[offset, offset + size)` sharing the same bytes.
    pub fn window(&self, offset: usize, size: usize) -> Result<IoRegion, IoError> {
        self.check(offset, size)?;
        Ok(IoRegion {
            mem: Arc::clone(&self.mem),
            start: self.start + offset,
            size,
            phys_base: self.phys_base + offset as u64,
            cache: self.cache.clone(),
        })
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical address of offset 0.
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Returns true if `[offset, offset + len)` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.size)
    }

    /// Translates a physical address into an offset, failing closed.
    pub fn phys_to_offset(&self, pa: u64) -> Option<usize> {
        let off = pa.checked_sub(self.phys_base)?;
        let off = usize::try_from(off).ok()?;
        (off < self.size).then_some(off)
    }

    /// Translates an offset into a physical address, failing closed.
    pub fn offset_to_phys(&self, offset: usize) -> Option<u64> {
        (offset < self.size).then(|| self.phys_base + offset as u64)
    }

    /// Returns true if both handles address the same backing store.
    pub fn same_backing(&self, other: &IoRegion) -> bool {
        Arc::ptr_eq(&self.mem, &other.mem)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), IoError> {
        if self.contains(offset, len) {
            Ok(())
        } else {
            Err(IoError::OutOfRange { offset, len, size: self.size })
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let mut buf = [0u8; N];
        match self.check(offset, N) {
            Ok(()) => {
                self.mem.read(self.start + offset, &mut buf);
                Some(buf)
            }
            Err(err) => {
                debug!("io read dropped: {err}");
                None
            }
        }
    }

    fn write_array(&self, offset: usize, bytes: &[u8]) {
        match self.check(offset, bytes.len()) {
            Ok(()) => self.mem.write(self.start + offset, bytes),
            Err(err) => debug!("io write dropped: {err}"),
        }
    }

    /// Reads a byte; out-of-range reads yield 0.
    pub fn read8(&self, offset: usize) -> u8 {
        self.read_array::<1>(offset).map_or(0, |b| b[0])
    }

    /// Reads a little-endian u16; out-of-range reads yield 0.
    pub fn read16(&self, offset: usize) -> u16 {
        self.read_array(offset).map_or(0, u16::from_le_bytes)
    }

    /// Reads a little-endian u32; out-of-range reads yield 0.
    pub fn read32(&self, offset: usize) -> u32 {
        self.read_array(offset).map_or(0, u32::from_le_bytes)
    }

    /// Reads a little-endian u64; out-of-range reads yield 0.
    pub fn read64(&self, offset: usize) -> u64 {
        self.read_array(offset).map_or(0, u64::from_le_bytes)
    }

    /// Writes a byte; out-of-range writes are dropped.
    pub fn write8(&self, offset: usize, value: u8) {
        self.write_array(offset, &[value]);
    }

    /// Writes a little-endian u16; out-of-range writes are dropped.
    pub fn write16(&self, offset: usize, value: u16) {
        self.write_array(offset, &value.to_le_bytes());
    }

    /// Writes a little-endian u32; out-of-range writes are dropped.
    pub fn write32(&self, offset: usize, value: u32) {
        self.write_array(offset, &value.to_le_bytes());
    }

    /// Writes a little-endian u64; out-of-range writes are dropped.
    pub fn write64(&self, offset: usize, value: u64) {
        self.write_array(offset, &value.to_le_bytes());
    }

    /// Copies bytes out of the region.
    pub fn block_read(&self, offset: usize, dst: &mut [u8]) -> Result<(), IoError> {
        self.check(offset, dst.len())?;
        self.mem.read(self.start + offset, dst);
        Ok(())
    }

    /// Copies bytes into the region.
    pub fn block_write(&self, offset: usize, src: &[u8]) -> Result<(), IoError> {
        self.check(offset, src.len())?;
        self.mem.write(self.start + offset, src);
        Ok(())
    }

    /// Sets `len` bytes to `value`.
    pub fn block_set(&self, offset: usize, value: u8, len: usize) -> Result<(), IoError> {
        self.check(offset, len)?;
        self.mem.fill(self.start + offset, value, len);
        Ok(())
    }

    /// Makes local writes to `[offset, offset + len)` visible to the peer.
    pub fn flush(&self, offset: usize, len: usize) {
        if let (Some(cache), Some(pa)) = (&self.cache, self.offset_to_phys(offset)) {
            cache.flush(pa, len);
        }
    }

    /// Drops stale local copies of `[offset, offset + len)` before reading peer writes.
    pub fn invalidate(&self, offset: usize, len: usize) {
        if let (Some(cache), Some(pa)) = (&self.cache, self.offset_to_phys(offset)) {
            cache.invalidate(pa, len);
        }
    }
}

/// A region doubles as a register block, for device-side MMIO emulation.
impl Bus for IoRegion {
    fn read(&self, addr: usize) -> u32 {
        self.read32(addr)
    }

    fn write(&self, addr: usize, value: u32) {
        self.write32(addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scalar_accessors_are_little_endian() {
        let io = IoRegion::heap(0x1000, 64);
        io.write32(4, 0x1122_3344);
        assert_eq!(io.read8(4), 0x44);
        assert_eq!(io.read16(6), 0x1122);
        io.write64(8, u64::MAX - 1);
        assert_eq!(io.read64(8), u64::MAX - 1);
    }

    #[test]
    fn out_of_range_reads_yield_zero_and_writes_drop() {
        let io = IoRegion::heap(0, 8);
        io.write32(6, 0xdead_beef);
        assert_eq!(io.read32(6), 0);
        assert_eq!(io.read16(6), 0);
        assert!(matches!(
            io.block_write(7, &[1, 2]),
            Err(IoError::OutOfRange { offset: 7, len: 2, size: 8 })
        ));
    }

    #[test]
    fn windows_share_bytes_and_shift_physical_base() {
        let io = IoRegion::heap(0x8000_0000, 0x1000);
        let win = io.window(0x100, 0x80).unwrap();
        assert_eq!(win.phys_base(), 0x8000_0100);
        win.write32(0, 0xabcd);
        assert_eq!(io.read32(0x100), 0xabcd);
        assert!(win.same_backing(&io));
        assert!(io.window(0xf80, 0x100).is_err());
    }

    #[test]
    fn translation_fails_closed() {
        let io = IoRegion::heap(0x2000, 0x100);
        assert_eq!(io.phys_to_offset(0x2010), Some(0x10));
        assert_eq!(io.phys_to_offset(0x1fff), None);
        assert_eq!(io.phys_to_offset(0x2100), None);
        assert_eq!(io.offset_to_phys(0xff), Some(0x20ff));
        assert_eq!(io.offset_to_phys(0x100), None);
    }

    struct CountingCache {
        flushes: AtomicUsize,
        invalidates: AtomicUsize,
    }

    impl CacheOps for CountingCache {
        fn flush(&self, _pa: u64, _len: usize) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn invalidate(&self, _pa: u64, _len: usize) {
            self.invalidates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cache_hooks_fire_only_when_attached() {
        let cache = Arc::new(CountingCache {
            flushes: AtomicUsize::new(0),
            invalidates: AtomicUsize::new(0),
        });
        let plain = IoRegion::heap(0, 32);
        plain.flush(0, 16);
        let cached = plain.clone().with_cache(cache.clone());
        cached.flush(0, 16);
        cached.invalidate(0, 16);
        cached.invalidate(64, 16);
        assert_eq!(cache.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.invalidates.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn block_write_then_read_matches(offset in 0usize..200, data in proptest::collection::vec(any::<u8>(), 0..56)) {
            let io = IoRegion::heap(0, 256);
            io.block_write(offset, &data).unwrap();
            let mut out = vec![0u8; data.len()];
            io.block_read(offset, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
