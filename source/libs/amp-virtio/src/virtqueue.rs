// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Split virtqueue bookkeeping.
//!
//! One `Virtqueue` value describes one side of one ring. Both sides of a channel build
//! their own value over the same ring bytes; the local free list, shadow indices and
//! cookies never leave this struct.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use amp_hal::{IoRegion, Notifier};
use log::{error, trace};
use thiserror::Error;

use crate::ring::VringLayout;
use crate::Role;

/// Base of the virtqueue error code range.
pub const VQ_ERROR_BASE: i32 = -3000;
/// Free-list terminator.
pub const VQ_RING_DESC_CHAIN_END: u16 = 32768;
/// Largest ring the split format can describe.
pub const VQ_MAX_DESCRIPTORS: u16 = 32768;

/// Descriptor continues via `next`.
pub const VRING_DESC_F_NEXT: u16 = 1;
/// Descriptor is device-writable.
pub const VRING_DESC_F_WRITE: u16 = 2;
/// Driver does not want used-ring interrupts.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Device does not want available-ring kicks.
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;

/// Virtqueue errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VqError {
    /// Not enough free descriptors for the chain.
    #[error("virtqueue ring full")]
    RingFull,
    /// A descriptor index is out of range or not in flight.
    #[error("invalid descriptor index")]
    InvalidDescIdx,
    /// Nothing to consume.
    #[error("virtqueue ring empty")]
    EmptyRing,
    /// The ring does not fit in the supplied memory.
    #[error("no memory for virtqueue")]
    NoMem,
    /// Too many descriptors requested.
    #[error("descriptor count exceeds ring limits")]
    MaxDesc,
    /// Size or alignment is not a power of two.
    #[error("virtqueue alignment")]
    Align,
    /// No buffer supplied.
    #[error("no buffer supplied")]
    NoBuffer,
    /// Bad argument, or an operation from the wrong role.
    #[error("invalid virtqueue parameter")]
    InvalidParam,
}

impl VqError {
    /// Flat negative error code.
    pub fn code(self) -> i32 {
        VQ_ERROR_BASE
            - match self {
                VqError::RingFull => 1,
                VqError::InvalidDescIdx => 2,
                VqError::EmptyRing => 3,
                VqError::NoMem => 4,
                VqError::MaxDesc => 5,
                VqError::Align => 6,
                VqError::NoBuffer => 7,
                VqError::InvalidParam => 8,
            }
    }
}

/// One scatter-gather element, addressed physically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VqBuf {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
}

/// A chain the device handed back (driver side).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedBuffer {
    /// Cookie passed to `add_buffer`.
    pub cookie: usize,
    /// Bytes the device reported as used.
    pub len: u32,
    /// Head descriptor index.
    pub head: u16,
}

/// A chain head the driver made available (device side).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AvailBuffer {
    /// Head descriptor index, handed back through `add_consumed_buffer`.
    pub head: u16,
    /// Physical address of the head buffer.
    pub addr: u64,
    /// Length of the head buffer.
    pub len: u32,
}

/// Parameters for `Virtqueue::new`.
pub struct VirtqueueConfig {
    /// Diagnostic name.
    pub name: String,
    /// Queue index within its device.
    pub index: u16,
    /// Notification id passed to the notifier on kick.
    pub notify_id: u32,
    /// Number of descriptors.
    pub num: u16,
    /// Used-ring alignment.
    pub align: u32,
    /// Memory holding the ring.
    pub io: IoRegion,
    /// Offset of the descriptor table within `io`.
    pub offset: usize,
    /// Side of the protocol this value implements.
    pub role: Role,
    /// Use `used_event`/`avail_event` instead of flag-based suppression.
    pub event_idx: bool,
    /// Doorbell towards the peer.
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// A doorbell decided on under a lock and rung after it is released.
#[must_use = "a prepared kick does nothing until rung"]
pub struct Kick {
    notifier: Arc<dyn Notifier>,
    id: u32,
}

impl Kick {
    /// Notifies the peer.
    pub fn ring(self) {
        self.notifier.notify(self.id);
    }
}

#[derive(Clone, Copy, Default)]
struct DescExtra {
    cookie: Option<usize>,
    ndescs: u16,
}

/// Local bookkeeping for one side of a split ring.
pub struct Virtqueue {
    name: String,
    index: u16,
    notify_id: u32,
    role: Role,
    io: IoRegion,
    base: usize,
    layout: VringLayout,
    event_idx: bool,
    notifier: Option<Arc<dyn Notifier>>,
    free_head: u16,
    free_cnt: u16,
    queued: u16,
    // Driver: next avail slot to publish. Device: next avail entry to consume.
    avail_idx: u16,
    // Driver: next used entry to reap. Device: next used slot to publish.
    used_idx: u16,
    signalled: u16,
    extra: Vec<DescExtra>,
    free_next: Vec<u16>,
}

impl std::fmt::Debug for Virtqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virtqueue")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("num", &self.layout.num)
            .field("free", &self.free_cnt)
            .finish()
    }
}

impl Virtqueue {
    /// Builds a queue over ring memory at `cfg.offset`.
    ///
    /// The driver side zeroes the ring; the device side leaves it untouched.
    pub fn new(cfg: VirtqueueConfig) -> Result<Self, VqError> {
        let layout = VringLayout::new(cfg.num, cfg.align)?;
        if !cfg.io.contains(cfg.offset, layout.size) {
            return Err(VqError::NoMem);
        }
        if cfg.role == Role::Driver {
            cfg.io
                .block_set(cfg.offset, 0, layout.size)
                .map_err(|_| VqError::NoMem)?;
            cfg.io.flush(cfg.offset, layout.size);
        }
        let n = cfg.num as usize;
        let free_next = (1..=n)
            .map(|i| if i == n { VQ_RING_DESC_CHAIN_END } else { i as u16 })
            .collect();
        Ok(Self {
            name: cfg.name,
            index: cfg.index,
            notify_id: cfg.notify_id,
            role: cfg.role,
            io: cfg.io,
            base: cfg.offset,
            layout,
            event_idx: cfg.event_idx,
            notifier: cfg.notifier,
            free_head: 0,
            free_cnt: cfg.num,
            queued: 0,
            avail_idx: 0,
            used_idx: 0,
            signalled: 0,
            extra: vec![DescExtra::default(); n],
            free_next,
        })
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue index within the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Notification id used on kick.
    pub fn notify_id(&self) -> u32 {
        self.notify_id
    }

    /// Side of the protocol.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of descriptors.
    pub fn num(&self) -> u16 {
        self.layout.num
    }

    /// Free descriptors (driver side).
    pub fn free_count(&self) -> u16 {
        self.free_cnt
    }

    /// Chains published and not yet reaped (driver side).
    pub fn queued(&self) -> u16 {
        self.queued
    }

    /// True when every descriptor is free.
    pub fn is_empty(&self) -> bool {
        self.free_cnt == self.layout.num
    }

    /// True when no descriptor is free.
    pub fn is_full(&self) -> bool {
        self.free_cnt == 0
    }

    /// Memory the ring and its buffers live in.
    pub fn io(&self) -> &IoRegion {
        &self.io
    }

    /// Physical addresses of `(desc, avail, used)`.
    pub fn ring_phys(&self) -> Option<(u64, u64, u64)> {
        Some((
            self.io.offset_to_phys(self.base)?,
            self.io.offset_to_phys(self.base + self.layout.avail)?,
            self.io.offset_to_phys(self.base + self.layout.used)?,
        ))
    }

    fn desc_off(&self, idx: u16) -> usize {
        self.base + self.layout.desc(idx)
    }

    fn avail_flags_off(&self) -> usize {
        self.base + self.layout.avail
    }

    fn avail_idx_off(&self) -> usize {
        self.base + self.layout.avail + 2
    }

    fn used_flags_off(&self) -> usize {
        self.base + self.layout.used
    }

    fn used_idx_off(&self) -> usize {
        self.base + self.layout.used + 2
    }

    fn slot(&self, idx: u16) -> u16 {
        idx & (self.layout.num - 1)
    }

    /// Publishes a descriptor chain: `readable` device-readable buffers followed by
    /// `writable` device-writable ones.
    pub fn add_buffer(
        &mut self,
        bufs: &[VqBuf],
        readable: usize,
        writable: usize,
        cookie: usize,
    ) -> Result<(), VqError> {
        if self.role != Role::Driver {
            return Err(VqError::InvalidParam);
        }
        let needed = readable + writable;
        if needed == 0 {
            return Err(VqError::NoBuffer);
        }
        if bufs.len() < needed {
            return Err(VqError::InvalidParam);
        }
        if needed > self.layout.num as usize {
            return Err(VqError::MaxDesc);
        }
        if (self.free_cnt as usize) < needed {
            return Err(VqError::RingFull);
        }

        let head = self.free_head;
        if head >= self.layout.num || self.extra[head as usize].cookie.is_some() {
            error!("{}: free list head {} is corrupt", self.name, head);
            return Err(VqError::InvalidDescIdx);
        }
        let mut idx = head;
        for (i, buf) in bufs[..needed].iter().enumerate() {
            if idx >= self.layout.num {
                error!("{}: free list ended early at {}", self.name, i);
                return Err(VqError::InvalidDescIdx);
            }
            let next = self.free_next[idx as usize];
            let mut flags = 0;
            if i >= readable {
                flags |= VRING_DESC_F_WRITE;
            }
            let last = i + 1 == needed;
            if !last {
                flags |= VRING_DESC_F_NEXT;
            }
            let off = self.desc_off(idx);
            self.io.write64(off, buf.addr);
            self.io.write32(off + 8, buf.len);
            self.io.write16(off + 12, flags);
            self.io.write16(off + 14, if last { 0 } else { next });
            idx = next;
        }
        self.free_head = idx;
        self.free_cnt -= needed as u16;
        debug_assert!(self.free_cnt != 0 || self.free_head == VQ_RING_DESC_CHAIN_END);
        self.extra[head as usize] = DescExtra { cookie: Some(cookie), ndescs: needed as u16 };

        let slot = self.slot(self.avail_idx);
        self.io.write16(self.base + self.layout.avail_ring(slot), head);
        self.io.flush(self.base, self.layout.used);
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.io.write16(self.avail_idx_off(), self.avail_idx);
        self.io.flush(self.avail_idx_off(), 2);
        self.queued += 1;
        trace!("{}: add head {} ({} descs)", self.name, head, needed);
        Ok(())
    }

    /// Reaps the next chain the device returned, handing back its cookie.
    pub fn get_buffer(&mut self) -> Option<UsedBuffer> {
        if self.role != Role::Driver {
            return None;
        }
        self.io.invalidate(self.used_idx_off(), 2);
        if self.io.read16(self.used_idx_off()) == self.used_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let elem = self.base + self.layout.used_ring(self.slot(self.used_idx));
        self.io.invalidate(elem, 8);
        let id = self.io.read32(elem);
        let len = self.io.read32(elem + 4);
        self.used_idx = self.used_idx.wrapping_add(1);

        let head = match u16::try_from(id) {
            Ok(head) if head < self.layout.num => head,
            _ => {
                error!("{}: used ring names descriptor {} out of range", self.name, id);
                return None;
            }
        };
        let DescExtra { cookie, ndescs } = self.extra[head as usize];
        let Some(cookie) = cookie else {
            error!("{}: used ring names descriptor {} not in flight", self.name, head);
            return None;
        };
        self.free_chain(head, ndescs);
        self.queued = self.queued.saturating_sub(1);
        Some(UsedBuffer { cookie, len, head })
    }

    // The chain was carved off the free list in order, so `free_next` still links it.
    fn free_chain(&mut self, head: u16, ndescs: u16) {
        let mut last = head;
        for _ in 1..ndescs {
            last = self.free_next[last as usize];
        }
        self.free_next[last as usize] = self.free_head;
        self.free_head = head;
        self.free_cnt += ndescs;
        self.extra[head as usize] = DescExtra::default();
        debug_assert!(self.free_cnt <= self.layout.num);
    }

    /// Takes the next chain head the driver made available (device side).
    pub fn get_available_buffer(&mut self) -> Option<AvailBuffer> {
        if self.role != Role::Device {
            return None;
        }
        self.io.invalidate(self.avail_idx_off(), 2);
        if self.io.read16(self.avail_idx_off()) == self.avail_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let slot_off = self.base + self.layout.avail_ring(self.slot(self.avail_idx));
        self.io.invalidate(slot_off, 2);
        let head = self.io.read16(slot_off);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        if head >= self.layout.num {
            error!("{}: avail ring names descriptor {} out of range", self.name, head);
            return None;
        }
        let off = self.desc_off(head);
        self.io.invalidate(off, 16);
        Some(AvailBuffer { head, addr: self.io.read64(off), len: self.io.read32(off + 8) })
    }

    /// Returns a consumed chain to the driver through the used ring (device side).
    pub fn add_consumed_buffer(&mut self, head: u16, len: u32) -> Result<(), VqError> {
        if self.role != Role::Device {
            return Err(VqError::InvalidParam);
        }
        if head >= self.layout.num {
            return Err(VqError::InvalidDescIdx);
        }
        let elem = self.base + self.layout.used_ring(self.slot(self.used_idx));
        self.io.write32(elem, head as u32);
        self.io.write32(elem + 4, len);
        self.io.flush(elem, 8);
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        self.io.write16(self.used_idx_off(), self.used_idx);
        self.io.flush(self.used_idx_off(), 2);
        Ok(())
    }

    /// Length of the next available buffer without consuming it (device side), or 0.
    pub fn desc_size(&self) -> u32 {
        if self.role != Role::Device {
            return 0;
        }
        if self.io.read16(self.avail_idx_off()) == self.avail_idx {
            return 0;
        }
        let head = self.io.read16(self.base + self.layout.avail_ring(self.slot(self.avail_idx)));
        if head >= self.layout.num {
            return 0;
        }
        self.io.read32(self.desc_off(head) + 8)
    }

    /// Length stored in descriptor `idx`.
    pub fn buffer_length(&self, idx: u16) -> u32 {
        if idx >= self.layout.num {
            return 0;
        }
        self.io.read32(self.desc_off(idx) + 8)
    }

    // Index this side produces and the event index the peer publishes for it.
    fn produced(&self) -> (u16, usize) {
        match self.role {
            Role::Driver => (self.avail_idx, self.base + self.layout.avail_event()),
            Role::Device => (self.used_idx, self.base + self.layout.used_event()),
        }
    }

    fn should_notify(&self) -> bool {
        let (new, event_off) = self.produced();
        if self.event_idx {
            let event = self.io.read16(event_off);
            return new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(self.signalled);
        }
        match self.role {
            Role::Driver => self.io.read16(self.used_flags_off()) & VRING_USED_F_NO_NOTIFY == 0,
            Role::Device => {
                self.io.read16(self.avail_flags_off()) & VRING_AVAIL_F_NO_INTERRUPT == 0
            }
        }
    }

    /// Signals the peer, unless it asked for suppression.
    pub fn kick(&mut self) {
        if let Some(kick) = self.prepare_kick() {
            kick.ring();
        }
    }

    /// Decides whether the peer needs a signal and hands back the doorbell instead of
    /// ringing it, so callers can drop their locks first.
    pub fn prepare_kick(&mut self) -> Option<Kick> {
        fence(Ordering::SeqCst);
        let kick = if self.should_notify() {
            self.notifier
                .as_ref()
                .map(|notifier| Kick { notifier: Arc::clone(notifier), id: self.notify_id })
        } else {
            None
        };
        self.signalled = self.produced().0;
        kick
    }

    /// Asks the peer to signal again. Returns true if work arrived meanwhile.
    pub fn enable_cb(&mut self) -> bool {
        match self.role {
            Role::Driver => {
                if self.event_idx {
                    self.io.write16(self.base + self.layout.used_event(), self.used_idx);
                } else {
                    let flags = self.io.read16(self.avail_flags_off());
                    self.io.write16(self.avail_flags_off(), flags & !VRING_AVAIL_F_NO_INTERRUPT);
                }
                fence(Ordering::SeqCst);
                self.io.read16(self.used_idx_off()) != self.used_idx
            }
            Role::Device => {
                if self.event_idx {
                    self.io.write16(self.base + self.layout.avail_event(), self.avail_idx);
                } else {
                    let flags = self.io.read16(self.used_flags_off());
                    self.io.write16(self.used_flags_off(), flags & !VRING_USED_F_NO_NOTIFY);
                }
                fence(Ordering::SeqCst);
                self.io.read16(self.avail_idx_off()) != self.avail_idx
            }
        }
    }

    /// Hints the peer that signals are not needed.
    pub fn disable_cb(&mut self) {
        let num = self.layout.num;
        match self.role {
            Role::Driver => {
                if self.event_idx {
                    let idx = self.used_idx.wrapping_sub(num).wrapping_sub(1);
                    self.io.write16(self.base + self.layout.used_event(), idx);
                } else {
                    let flags = self.io.read16(self.avail_flags_off());
                    self.io.write16(self.avail_flags_off(), flags | VRING_AVAIL_F_NO_INTERRUPT);
                }
            }
            Role::Device => {
                if self.event_idx {
                    let idx = self.avail_idx.wrapping_sub(num).wrapping_sub(1);
                    self.io.write16(self.base + self.layout.avail_event(), idx);
                } else {
                    let flags = self.io.read16(self.used_flags_off());
                    self.io.write16(self.used_flags_off(), flags | VRING_USED_F_NO_NOTIFY);
                }
            }
        }
    }
}
