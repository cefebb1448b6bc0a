// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared buffer bookkeeping: the bump pool, rx held counts, the unsent-buffer
//! reclaimer and the zero-copy guards handed to users.
//!
//! Held counts live in a local table keyed by buffer offset; nothing about
//! buffer ownership is written into the message header.

use std::collections::BTreeMap;
use std::sync::Arc;

use amp_hal::IoRegion;
use static_assertions::const_assert;

use crate::config::RPMSG_MIN_BUFFER_SIZE;
use crate::device::DeviceShared;
use crate::wire::RPMSG_HEADER_SIZE;
use crate::{Error, Result};

/// Bump allocator over the shared buffer pool. Buffers are never freed individually.
#[derive(Clone, Debug)]
pub struct ShmPool {
    io: IoRegion,
    base: usize,
    size: usize,
    avail: usize,
}

impl ShmPool {
    /// Pool over `io[offset..offset + size]`.
    pub fn new(io: IoRegion, offset: usize, size: usize) -> Result<Self> {
        if size == 0 || !io.contains(offset, size) {
            return Err(Error::Param);
        }
        Ok(Self { io, base: offset, size, avail: size })
    }

    /// Memory the pool carves from.
    pub fn io(&self) -> &IoRegion {
        &self.io
    }

    /// Total pool size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes not handed out yet.
    pub fn available(&self) -> usize {
        self.avail
    }

    pub(crate) fn alloc(&mut self, len: usize) -> Option<usize> {
        if len == 0 || self.avail < len {
            return None;
        }
        let offset = self.base + self.size - self.avail;
        self.avail -= len;
        Some(offset)
    }

    /// Splits the untouched remainder in two 8-byte aligned halves (tx, rx).
    pub(crate) fn split_half(self) -> (ShmPool, ShmPool) {
        let start = self.base + self.size - self.avail;
        let half = (self.avail / 2) & !7;
        let tx = ShmPool { io: self.io.clone(), base: start, size: half, avail: half };
        let rest = self.avail - half;
        let rx = ShmPool { io: self.io, base: start + half, size: rest, avail: rest };
        (tx, rx)
    }
}

/// One transport buffer: where it lives, the descriptor it travels in, its capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BufSlot {
    pub(crate) offset: usize,
    pub(crate) head: u16,
    pub(crate) cap: u32,
}

/// Outcome of dropping one reference to an rx buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// Last reference gone; the buffer goes back to the ring.
    Returned(BufSlot),
    /// Other references remain.
    Held(u16),
    /// The buffer is not checked out.
    Unknown,
}

/// Held counts of rx buffers checked out of the receive ring, keyed by buffer offset.
///
/// Descriptor heads are not stable keys on the driver side: a head freed by
/// `get_buffer` can be reused for another buffer while this one is still held.
#[derive(Default)]
pub(crate) struct HeldTable {
    entries: BTreeMap<usize, (u16, BufSlot)>,
}

impl HeldTable {
    /// Checks a buffer out with one reference (the dispatch loop's).
    pub(crate) fn track(&mut self, slot: BufSlot) -> bool {
        if self.entries.contains_key(&slot.offset) {
            return false;
        }
        self.entries.insert(slot.offset, (1, slot));
        true
    }

    pub(crate) fn hold(&mut self, offset: usize) -> bool {
        match self.entries.get_mut(&offset) {
            Some((count, _)) => match count.checked_add(1) {
                Some(n) => {
                    *count = n;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub(crate) fn release(&mut self, offset: usize) -> Release {
        let Some((count, _)) = self.entries.get_mut(&offset) else {
            return Release::Unknown;
        };
        if *count > 1 {
            *count -= 1;
            return Release::Held(*count);
        }
        match self.entries.remove(&offset) {
            Some((_, slot)) => Release::Returned(slot),
            None => Release::Unknown,
        }
    }

    pub(crate) fn held(&self, offset: usize) -> Option<u16> {
        self.entries.get(&offset).map(|(count, _)| *count)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Size of the record a parked buffer carries: `next: u64, head: u16, pad: u16, cap: u32`.
pub(crate) const RECLAIM_RECORD_SIZE: usize = 16;

const_assert!(RECLAIM_RECORD_SIZE <= RPMSG_MIN_BUFFER_SIZE as usize);
const_assert!(RPMSG_HEADER_SIZE < RPMSG_MIN_BUFFER_SIZE as usize);

/// LIFO of transmit buffers released without being sent.
///
/// The list links are written into the parked buffers themselves, so their
/// contents do not survive parking.
#[derive(Default)]
pub(crate) struct Reclaimer {
    head: Option<usize>,
    parked: usize,
}

impl Reclaimer {
    pub(crate) fn park(&mut self, io: &IoRegion, slot: BufSlot) {
        let next = self.head.map_or(0, |off| off as u64 + 1);
        io.write64(slot.offset, next);
        io.write16(slot.offset + 8, slot.head);
        io.write16(slot.offset + 10, 0);
        io.write32(slot.offset + 12, slot.cap);
        self.head = Some(slot.offset);
        self.parked += 1;
    }

    pub(crate) fn take(&mut self, io: &IoRegion) -> Option<BufSlot> {
        let offset = self.head?;
        let next = io.read64(offset);
        let slot = BufSlot { offset, head: io.read16(offset + 8), cap: io.read32(offset + 12) };
        self.head = next.checked_sub(1).and_then(|n| usize::try_from(n).ok());
        self.parked -= 1;
        Some(slot)
    }

    pub(crate) fn len(&self) -> usize {
        self.parked
    }
}

/// A received message, valid for the duration of the rx callback.
pub struct RxMessage<'a> {
    pub(crate) src: u32,
    pub(crate) dst: u32,
    pub(crate) data: &'a [u8],
    pub(crate) slot: BufSlot,
    pub(crate) device: &'a Arc<DeviceShared>,
}

impl RxMessage<'_> {
    /// Sender address.
    pub fn src(&self) -> u32 {
        self.src
    }

    /// Recipient address.
    pub fn dst(&self) -> u32 {
        self.dst
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Keeps the underlying buffer out of the ring until the returned guard drops.
    pub fn hold(&self) -> Result<HeldRxBuffer> {
        HeldRxBuffer::acquire(self.device, self.slot, self.src, self.data.len())
    }
}

/// Reference to a receive buffer kept past its callback.
///
/// The buffer goes back to the ring when the last reference (including the
/// dispatch loop's own) is dropped.
pub struct HeldRxBuffer {
    device: Arc<DeviceShared>,
    slot: BufSlot,
    src: u32,
    len: usize,
}

impl HeldRxBuffer {
    fn acquire(device: &Arc<DeviceShared>, slot: BufSlot, src: u32, len: usize) -> Result<Self> {
        if !device.hold_rx(slot.offset) {
            return Err(Error::Param);
        }
        Ok(Self { device: Arc::clone(device), slot, src, len })
    }

    /// Sender address.
    pub fn src(&self) -> u32 {
        self.src
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the payload out of shared memory.
    pub fn read(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len];
        self.device
            .buffer_io()
            .block_read(self.slot.offset + RPMSG_HEADER_SIZE, &mut out)
            .map_err(|_| Error::Param)?;
        Ok(out)
    }

    /// Takes one more reference to the same buffer.
    pub fn hold(&self) -> Result<HeldRxBuffer> {
        Self::acquire(&self.device, self.slot, self.src, self.len)
    }

    /// Drops this reference.
    pub fn release(self) {}
}

impl Drop for HeldRxBuffer {
    fn drop(&mut self) {
        self.device.release_rx(self.slot.offset);
    }
}

/// A transmit buffer checked out for in-place filling.
///
/// Sending consumes it; dropping it unsent parks it for the next send.
pub struct TxBuffer {
    device: Arc<DeviceShared>,
    slot: BufSlot,
    armed: bool,
}

impl TxBuffer {
    pub(crate) fn new(device: Arc<DeviceShared>, slot: BufSlot) -> Self {
        Self { device, slot, armed: true }
    }

    /// Payload bytes available.
    pub fn capacity(&self) -> usize {
        (self.slot.cap as usize).saturating_sub(RPMSG_HEADER_SIZE)
    }

    /// Writes `data` at payload offset `at`.
    pub fn write(&mut self, at: usize, data: &[u8]) -> Result<()> {
        if at.checked_add(data.len()).map_or(true, |end| end > self.capacity()) {
            return Err(Error::BufferSize);
        }
        self.device
            .buffer_io()
            .block_write(self.slot.offset + RPMSG_HEADER_SIZE + at, data)
            .map_err(|_| Error::Param)
    }

    pub(crate) fn belongs_to(&self, device: &Arc<DeviceShared>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }

    pub(crate) fn into_slot(mut self) -> BufSlot {
        self.armed = false;
        self.slot
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if self.armed {
            self.device.reclaim_tx(self.slot);
        }
    }
}
