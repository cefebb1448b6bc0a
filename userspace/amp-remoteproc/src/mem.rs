// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory regions tracked per remote processor.
//!
//! Each region pairs the local view (an `IoRegion` whose physical base is the
//! region's `pa`) with the device address the remote core uses for the same
//! bytes. Regions are never split or merged.

use amp_hal::IoRegion;
use bitflags::bitflags;

bitflags! {
    /// Attributes requested when the platform maps memory.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MemAttr: u32 {
        /// Shared with the remote core.
        const SHARED = 0x1;
        /// Must not be cached locally.
        const UNCACHED = 0x2;
        /// Device registers.
        const DEVICE = 0x4;
        /// Holds remote executable code.
        const EXEC = 0x8;
    }
}

/// What the platform is asked to map. `None` addresses mean "any".
#[derive(Clone, Copy, Debug)]
pub struct MmapRequest<'a> {
    /// Physical address, if fixed.
    pub pa: Option<u64>,
    /// Device address, if fixed.
    pub da: Option<u64>,
    /// Bytes needed.
    pub size: usize,
    /// Mapping attributes.
    pub attr: MemAttr,
    /// Resource name when the request comes from a table entry.
    pub name: Option<&'a str>,
}

/// One tracked memory region.
#[derive(Clone, Debug)]
pub struct RemoteprocMem {
    name: String,
    da: u64,
    io: IoRegion,
}

impl RemoteprocMem {
    /// A region whose local bytes are `io`, seen by the remote at `da`.
    pub fn new(name: impl Into<String>, da: u64, io: IoRegion) -> Self {
        Self { name: name.into(), da, io }
    }

    /// Region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical base.
    pub fn pa(&self) -> u64 {
        self.io.phys_base()
    }

    /// Device address base.
    pub fn da(&self) -> u64 {
        self.da
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.io.size()
    }

    /// Local access to the region.
    pub fn io(&self) -> &IoRegion {
        &self.io
    }

    pub(crate) fn covers_pa(&self, pa: u64, len: usize) -> bool {
        covers(self.pa(), self.size(), pa, len)
    }

    pub(crate) fn covers_da(&self, da: u64, len: usize) -> bool {
        covers(self.da, self.size(), da, len)
    }

    /// Mapping for a physical address inside the region.
    pub(crate) fn at_pa(&self, pa: u64) -> Mapping {
        let offset = (pa - self.pa()) as usize;
        Mapping { io: self.io.clone(), offset, pa, da: self.da + offset as u64 }
    }

    /// Mapping for a device address inside the region.
    pub(crate) fn at_da(&self, da: u64) -> Mapping {
        let offset = (da - self.da) as usize;
        Mapping { io: self.io.clone(), offset, pa: self.pa() + offset as u64, da }
    }
}

/// Result of a successful map: where the bytes are locally, and both addresses.
#[derive(Clone, Debug)]
pub struct Mapping {
    /// Region holding the bytes.
    pub io: IoRegion,
    /// Offset of the first byte within `io`.
    pub offset: usize,
    /// Physical address.
    pub pa: u64,
    /// Device address.
    pub da: u64,
}

fn covers(base: u64, size: usize, addr: u64, len: usize) -> bool {
    let (Some(end), Some(last)) = (base.checked_add(size as u64), addr.checked_add(len as u64))
    else {
        return false;
    };
    addr >= base && last <= end && (len > 0 || addr < end)
}

/// Linear region list; cardinalities stay small.
#[derive(Default)]
pub(crate) struct MemList {
    mems: Vec<RemoteprocMem>,
}

impl MemList {
    pub(crate) fn add(&mut self, mem: RemoteprocMem) {
        self.mems.push(mem);
    }

    pub(crate) fn clear(&mut self) {
        self.mems.clear();
    }

    /// Forgets every region added after the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.mems.truncate(len);
    }

    pub(crate) fn len(&self) -> usize {
        self.mems.len()
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<&RemoteprocMem> {
        self.mems.iter().find(|m| m.name == name)
    }

    pub(crate) fn by_pa(&self, pa: u64, len: usize) -> Option<&RemoteprocMem> {
        self.mems.iter().find(|m| m.covers_pa(pa, len))
    }

    pub(crate) fn by_da(&self, da: u64, len: usize) -> Option<&RemoteprocMem> {
        self.mems.iter().find(|m| m.covers_da(da, len))
    }

    /// The region that owns byte `offset` of `io`.
    pub(crate) fn by_va(&self, io: &IoRegion, offset: usize) -> Option<&RemoteprocMem> {
        let pa = io.offset_to_phys(offset)?;
        self.mems.iter().find(|m| m.io.same_backing(io) && m.covers_pa(pa, 1))
    }

    /// Local-only lookup; `pa` wins over `da` when both are given.
    pub(crate) fn lookup(&self, pa: Option<u64>, da: Option<u64>, size: usize) -> Option<Mapping> {
        match (pa, da) {
            (Some(pa), _) => self.by_pa(pa, size).map(|m| m.at_pa(pa)),
            (None, Some(da)) => self.by_da(da, size).map(|m| m.at_da(da)),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> (MemList, IoRegion) {
        let shm = IoRegion::heap(0x8000_0000, 0x4000);
        let mut mems = MemList::default();
        mems.add(RemoteprocMem::new("tcm", 0x0, shm.window(0, 0x1000).unwrap()));
        mems.add(RemoteprocMem::new("ddr", 0x1000_0000, shm.window(0x2000, 0x2000).unwrap()));
        (mems, shm)
    }

    #[test]
    fn lookups_by_every_key() {
        let (mems, shm) = list();
        assert_eq!(mems.by_name("ddr").unwrap().pa(), 0x8000_2000);
        assert!(mems.by_name("sram").is_none());
        assert_eq!(mems.by_pa(0x8000_0ff0, 0x10).unwrap().name(), "tcm");
        assert!(mems.by_pa(0x8000_0ff0, 0x11).is_none());
        assert_eq!(mems.by_da(0x1000_1fff, 1).unwrap().name(), "ddr");
        assert_eq!(mems.by_va(&shm, 0x2100).unwrap().name(), "ddr");
        assert!(mems.by_va(&shm, 0x1800).is_none());
        assert!(mems.by_va(&IoRegion::heap(0x8000_0000, 0x4000), 0x10).is_none());
    }

    #[test]
    fn lookup_translates_between_address_spaces() {
        let (mems, _) = list();
        let m = mems.lookup(None, Some(0x1000_0010), 4).unwrap();
        assert_eq!((m.pa, m.offset), (0x8000_2010, 0x10));
        let m = mems.lookup(Some(0x8000_0020), None, 4).unwrap();
        assert_eq!((m.da, m.offset), (0x20, 0x20));
        assert!(mems.lookup(None, None, 4).is_none());
        // The end address itself is outside a zero-length query.
        assert!(mems.lookup(None, Some(0x1000), 0).is_none());
    }

    #[test]
    fn truncate_keeps_older_regions() {
        let (mut mems, _) = list();
        mems.truncate(1);
        assert_eq!(mems.len(), 1);
        assert!(mems.by_name("tcm").is_some());
        assert!(mems.by_da(0x1000_0000, 1).is_none());
    }
}
