// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Resource table layout, validation and entry dispatch.
//!
//! Layout (little-endian): `{ver, num, reserved[2]}` followed by `num` u32
//! offsets, each pointing at an entry that starts with a u32 type tag. The
//! whole table is checked before any handler runs, so a malformed table never
//! leaves mapped memory behind.

use log::{debug, info, warn};
use scroll::{Pread, Pwrite, LE};

use crate::mem::{Mapping, MemAttr};
use crate::{Error, Result};

/// The only table version understood.
pub const RSC_TAB_SUPPORTED_VERSION: u32 = 1;
/// Table header size, before the offset array.
pub const RSC_TAB_HEADER_SIZE: usize = 16;
/// "Any address" in carveout/devmem/vring entries.
pub const FW_RSC_ADDR_ANY: u32 = u32::MAX;
/// "Any id" for notification ids.
pub const RSC_NOTIFY_ID_ANY: u32 = u32::MAX;
/// Most vrings a vdev entry may declare.
pub const RSC_TAB_MAX_VRINGS: u8 = 2;
/// Size of the name field in carveout/devmem/trace entries.
pub const RSC_NAME_SIZE: usize = 32;

/// Physically contiguous memory for the remote.
pub const RSC_CARVEOUT: u32 = 0;
/// Device memory (registers) the remote needs mapped.
pub const RSC_DEVMEM: u32 = 1;
/// Trace buffer.
pub const RSC_TRACE: u32 = 2;
/// Virtio device.
pub const RSC_VDEV: u32 = 3;
/// Memory the remote pre-assigned for its own use.
pub const RSC_RPROC_MEM: u32 = 4;
/// Firmware checksum.
pub const RSC_FW_CHKSUM: u32 = 5;
/// First vendor-specific type.
pub const RSC_VENDOR_START: u32 = 128;
/// End (exclusive) of the vendor-specific range.
pub const RSC_VENDOR_END: u32 = 512;
const RSC_VENDOR_LAST: u32 = RSC_VENDOR_END - 1;

/// Fixed size of a carveout or devmem entry.
pub const CARVEOUT_ENTRY_SIZE: usize = 56;
/// Fixed size of a trace entry.
pub const TRACE_ENTRY_SIZE: usize = 48;
/// Size of a vdev entry before its vrings.
pub const VDEV_ENTRY_SIZE: usize = 28;
/// Size of one vring descriptor inside a vdev entry.
pub const VRING_ENTRY_SIZE: usize = 20;
/// Size of an rproc-mem entry.
pub const RPROC_MEM_ENTRY_SIZE: usize = 20;
/// Size of a firmware checksum entry.
pub const FW_CHKSUM_ENTRY_SIZE: usize = 84;
/// Header of a vendor entry.
pub const VENDOR_ENTRY_SIZE: usize = 8;

pub(crate) const VDEV_NOTIFYID: usize = 8;
pub(crate) const VDEV_DFEATURES: usize = 12;
pub(crate) const VDEV_GFEATURES: usize = 16;
pub(crate) const VDEV_CONFIG_LEN: usize = 20;
pub(crate) const VDEV_STATUS: usize = 24;
const VDEV_NUM_VRINGS: usize = 25;

/// A carveout or devmem entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Carveout {
    /// Device address, or `FW_RSC_ADDR_ANY`.
    pub da: u32,
    /// Physical address, or `FW_RSC_ADDR_ANY`.
    pub pa: u32,
    /// Length in bytes.
    pub len: u32,
    /// Platform flags.
    pub flags: u32,
    /// Region name.
    pub name: String,
}

/// One vring of a vdev entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringRsc {
    /// Device address of the ring.
    pub da: u32,
    /// Used-ring alignment.
    pub align: u32,
    /// Descriptor count.
    pub num: u32,
    /// Notification id, or `RSC_NOTIFY_ID_ANY`.
    pub notifyid: u32,
}

/// A vdev entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VdevRsc {
    /// Virtio device id.
    pub id: u32,
    /// Notification id of the device itself.
    pub notifyid: u32,
    /// Features the device offers.
    pub dfeatures: u32,
    /// Features the driver accepted.
    pub gfeatures: u32,
    /// Config space size, stored after the vrings.
    pub config_len: u32,
    /// Virtio status byte.
    pub status: u8,
    /// Rings.
    pub vrings: Vec<VringRsc>,
}

impl VdevRsc {
    /// Decodes the vdev entry at `off`.
    pub fn read(table: &[u8], off: usize) -> Result<Self> {
        let num = *table.get(off + VDEV_NUM_VRINGS).ok_or(Error::RscTruncated)?;
        let vrings = (0..num as usize)
            .map(|i| {
                let v = vring_offset(off, i);
                Ok(VringRsc {
                    da: rd32(table, v)?,
                    align: rd32(table, v + 4)?,
                    num: rd32(table, v + 8)?,
                    notifyid: rd32(table, v + 12)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: rd32(table, off + 4)?,
            notifyid: rd32(table, off + VDEV_NOTIFYID)?,
            dfeatures: rd32(table, off + VDEV_DFEATURES)?,
            gfeatures: rd32(table, off + VDEV_GFEATURES)?,
            config_len: rd32(table, off + VDEV_CONFIG_LEN)?,
            status: table[off + VDEV_STATUS],
            vrings,
        })
    }

    /// Offset of the config space relative to the entry start.
    pub fn config_offset(&self) -> usize {
        VDEV_ENTRY_SIZE + self.vrings.len() * VRING_ENTRY_SIZE
    }
}

/// Offset of vring `i` of the vdev entry at `off`.
pub(crate) fn vring_offset(off: usize, i: usize) -> usize {
    off + VDEV_ENTRY_SIZE + i * VRING_ENTRY_SIZE
}

/// Platform side of table parsing.
pub(crate) trait RscHandler {
    /// Maps an entry's memory. `None` addresses are to be chosen by the platform.
    fn map(
        &mut self,
        pa: Option<u64>,
        da: Option<u64>,
        len: usize,
        attr: MemAttr,
        name: &str,
    ) -> Result<Mapping>;
    /// Claims a notification id in `[start, end)`; `RSC_NOTIFY_ID_ANY` widens either bound.
    fn allocate_id(&mut self, start: u32, end: u32) -> Option<u32>;
    /// Handles a vendor entry.
    fn vendor(&mut self, entry: &mut [u8]) -> Result<()>;
}

fn rd32(table: &[u8], off: usize) -> Result<u32> {
    table.pread_with::<u32>(off, LE).map_err(|_| Error::RscTruncated)
}

fn wr32(table: &mut [u8], off: usize, value: u32) -> Result<()> {
    table
        .pwrite_with::<u32>(value, off, LE)
        .map(|_| ())
        .map_err(|_| Error::RscTruncated)
}

fn name_at(table: &[u8], off: usize) -> String {
    let raw = table.get(off..off + RSC_NAME_SIZE).unwrap_or_default();
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn any(addr: u32) -> Option<u64> {
    (addr != FW_RSC_ADDR_ANY).then_some(addr as u64)
}

fn entry_offsets(table: &[u8]) -> Result<Vec<usize>> {
    let num = rd32(table, 4)? as usize;
    (0..num)
        .map(|i| rd32(table, RSC_TAB_HEADER_SIZE + 4 * i).map(|o| o as usize))
        .collect()
}

/// Structural check of the whole table: header, bounds of every entry and
/// reserved fields.
pub fn validate(table: &[u8]) -> Result<()> {
    if table.len() < RSC_TAB_HEADER_SIZE {
        return Err(Error::RscTruncated);
    }
    let ver = rd32(table, 0)?;
    if ver != RSC_TAB_SUPPORTED_VERSION {
        return Err(Error::RscVersion(ver));
    }
    let num = rd32(table, 4)? as usize;
    let offsets_end = num
        .checked_mul(4)
        .and_then(|n| n.checked_add(RSC_TAB_HEADER_SIZE))
        .ok_or(Error::RscTruncated)?;
    if offsets_end > table.len() {
        return Err(Error::RscTruncated);
    }
    if rd32(table, 8)? != 0 || rd32(table, 12)? != 0 {
        return Err(Error::RscReserved);
    }
    for off in entry_offsets(table)? {
        validate_entry(table, off)?;
    }
    Ok(())
}

fn validate_entry(table: &[u8], off: usize) -> Result<()> {
    let fits = |size: usize| off.checked_add(size).map_or(false, |end| end <= table.len());
    let ty = rd32(table, off)?;
    let (size, reserved_at) = match ty {
        RSC_CARVEOUT | RSC_DEVMEM => (CARVEOUT_ENTRY_SIZE, Some(20)),
        RSC_TRACE => (TRACE_ENTRY_SIZE, Some(12)),
        RSC_RPROC_MEM => (RPROC_MEM_ENTRY_SIZE, Some(16)),
        RSC_FW_CHKSUM => (FW_CHKSUM_ENTRY_SIZE, None),
        RSC_VDEV => (VDEV_ENTRY_SIZE, None),
        RSC_VENDOR_START..=RSC_VENDOR_LAST => (VENDOR_ENTRY_SIZE, None),
        _ => (4, None),
    };
    if !fits(size) {
        return Err(Error::RscTruncated);
    }
    if let Some(at) = reserved_at {
        if rd32(table, off + at)? != 0 {
            return Err(Error::RscReserved);
        }
    }
    if ty == RSC_VDEV {
        let nrings = table[off + VDEV_NUM_VRINGS];
        if nrings > RSC_TAB_MAX_VRINGS {
            return Err(Error::VdevRings(nrings));
        }
        if table[off + 26] != 0 || table[off + 27] != 0 {
            return Err(Error::RscReserved);
        }
        let config_len = rd32(table, off + VDEV_CONFIG_LEN)? as usize;
        if !fits(VDEV_ENTRY_SIZE + nrings as usize * VRING_ENTRY_SIZE + config_len) {
            return Err(Error::RscTruncated);
        }
        for i in 0..nrings as usize {
            if rd32(table, vring_offset(off, i) + 16)? != 0 {
                return Err(Error::RscReserved);
            }
        }
    }
    Ok(())
}

/// Offset of the `index`-th entry of type `ty`.
pub fn find_rsc(table: &[u8], ty: u32, index: usize) -> Option<usize> {
    entry_offsets(table)
        .ok()?
        .into_iter()
        .filter(|&off| rd32(table, off).ok() == Some(ty))
        .nth(index)
}

/// Validates `table`, then runs the handler for every entry in order. Entries
/// are updated in place with resolved addresses and allocated ids.
pub(crate) fn handle_rsc_table(table: &mut [u8], handler: &mut dyn RscHandler) -> Result<()> {
    validate(table)?;
    for off in entry_offsets(table)? {
        let ty = rd32(table, off)?;
        match ty {
            RSC_CARVEOUT => handle_carveout(table, off, handler)?,
            RSC_DEVMEM => {
                let (da, pa, len) = (rd32(table, off + 4)?, rd32(table, off + 8)?, rd32(table, off + 12)?);
                handler.map(any(pa), any(da), len as usize, MemAttr::DEVICE, &name_at(table, off + 24))?;
            }
            RSC_TRACE => {
                let (da, len) = (rd32(table, off + 4)?, rd32(table, off + 8)?);
                let name = name_at(table, off + 16);
                handler.map(None, any(da), len as usize, MemAttr::SHARED, &name)?;
                info!("rsc: trace buffer '{name}' at da {da:#x}, {len} bytes");
            }
            RSC_VDEV => handle_vdev(table, off, handler)?,
            RSC_RPROC_MEM => {
                let (da, pa, len) = (rd32(table, off + 4)?, rd32(table, off + 8)?, rd32(table, off + 12)?);
                handler.map(any(pa), any(da), len as usize, MemAttr::SHARED, "rproc-mem")?;
            }
            RSC_FW_CHKSUM => {
                let algo = String::from_utf8_lossy(&table[off + 4..off + 20]);
                info!("rsc: firmware checksum ({})", algo.trim_end_matches('\0'));
            }
            RSC_VENDOR_START..=RSC_VENDOR_LAST => match handler.vendor(&mut table[off..]) {
                Ok(()) => {}
                Err(Error::NotSupported) => debug!("rsc: vendor entry {ty} not handled"),
                Err(e) => return Err(e),
            },
            _ => warn!("rsc: skipping unknown entry type {ty} at {off:#x}"),
        }
    }
    Ok(())
}

fn handle_carveout(table: &mut [u8], off: usize, handler: &mut dyn RscHandler) -> Result<()> {
    let (da, pa, len) = (rd32(table, off + 4)?, rd32(table, off + 8)?, rd32(table, off + 12)?);
    let name = name_at(table, off + 24);
    let m = handler.map(any(pa), any(da), len as usize, MemAttr::SHARED | MemAttr::UNCACHED, &name)?;
    debug!("rsc: carveout '{name}' da {:#x} pa {:#x} len {len:#x}", m.da, m.pa);
    if da == FW_RSC_ADDR_ANY {
        wr32(table, off + 4, u32::try_from(m.da).map_err(|_| Error::Invalid("carveout da"))?)?;
    }
    if pa == FW_RSC_ADDR_ANY {
        wr32(table, off + 8, u32::try_from(m.pa).map_err(|_| Error::Invalid("carveout pa"))?)?;
    }
    Ok(())
}

fn claim_id(handler: &mut dyn RscHandler, id: u32) -> Result<u32> {
    let claimed = if id == RSC_NOTIFY_ID_ANY {
        handler.allocate_id(RSC_NOTIFY_ID_ANY, RSC_NOTIFY_ID_ANY)
    } else {
        handler.allocate_id(id, id.saturating_add(1))
    };
    claimed.ok_or_else(|| {
        warn!("rsc: notify id {id:#x} unavailable");
        Error::Invalid("notify id unavailable")
    })
}

fn handle_vdev(table: &mut [u8], off: usize, handler: &mut dyn RscHandler) -> Result<()> {
    let id = claim_id(handler, rd32(table, off + VDEV_NOTIFYID)?)?;
    wr32(table, off + VDEV_NOTIFYID, id)?;
    let nrings = table[off + VDEV_NUM_VRINGS] as usize;
    for i in 0..nrings {
        let at = vring_offset(off, i) + 12;
        let id = claim_id(handler, rd32(table, at)?)?;
        wr32(table, at, id)?;
    }
    debug!("rsc: vdev id {} with {nrings} vrings", rd32(table, off + 4)?);
    Ok(())
}

/// Builds resource tables (firmware images, tests).
#[derive(Clone, Debug)]
pub struct ResourceTableBuilder {
    version: u32,
    entries: Vec<Vec<u8>>,
}

impl Default for ResourceTableBuilder {
    fn default() -> Self {
        Self { version: RSC_TAB_SUPPORTED_VERSION, entries: Vec::new() }
    }
}

fn put32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    let mut raw = [0u8; RSC_NAME_SIZE];
    let n = name.len().min(RSC_NAME_SIZE - 1);
    raw[..n].copy_from_slice(&name.as_bytes()[..n]);
    buf.extend_from_slice(&raw);
}

impl ResourceTableBuilder {
    /// An empty version-1 table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the header version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn mem_entry(mut self, ty: u32, c: &Carveout) -> Self {
        let mut e = Vec::with_capacity(CARVEOUT_ENTRY_SIZE);
        for v in [ty, c.da, c.pa, c.len, c.flags, 0] {
            put32(&mut e, v);
        }
        put_name(&mut e, &c.name);
        self.entries.push(e);
        self
    }

    /// Appends a carveout.
    pub fn carveout(self, c: &Carveout) -> Self {
        self.mem_entry(RSC_CARVEOUT, c)
    }

    /// Appends a devmem entry.
    pub fn devmem(self, c: &Carveout) -> Self {
        self.mem_entry(RSC_DEVMEM, c)
    }

    /// Appends a trace buffer.
    pub fn trace(mut self, da: u32, len: u32, name: &str) -> Self {
        let mut e = Vec::with_capacity(TRACE_ENTRY_SIZE);
        for v in [RSC_TRACE, da, len, 0] {
            put32(&mut e, v);
        }
        put_name(&mut e, name);
        self.entries.push(e);
        self
    }

    /// Appends a vdev entry followed by `config_len` zeroed config bytes.
    pub fn vdev(mut self, v: &VdevRsc) -> Self {
        let mut e = Vec::new();
        for x in [RSC_VDEV, v.id, v.notifyid, v.dfeatures, v.gfeatures, v.config_len] {
            put32(&mut e, x);
        }
        e.extend_from_slice(&[v.status, v.vrings.len() as u8, 0, 0]);
        for r in &v.vrings {
            for x in [r.da, r.align, r.num, r.notifyid, 0] {
                put32(&mut e, x);
            }
        }
        e.resize(e.len() + v.config_len as usize, 0);
        self.entries.push(e);
        self
    }

    /// Appends an rproc-mem entry.
    pub fn rproc_mem(mut self, da: u32, pa: u32, len: u32) -> Self {
        let mut e = Vec::with_capacity(RPROC_MEM_ENTRY_SIZE);
        for v in [RSC_RPROC_MEM, da, pa, len, 0] {
            put32(&mut e, v);
        }
        self.entries.push(e);
        self
    }

    /// Appends a raw entry: the type tag followed by `body`.
    pub fn raw(mut self, ty: u32, body: &[u8]) -> Self {
        let mut e = Vec::with_capacity(4 + body.len());
        put32(&mut e, ty);
        e.extend_from_slice(body);
        self.entries.push(e);
        self
    }

    /// Serializes the table. Entries are 4-byte aligned.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for v in [self.version, self.entries.len() as u32, 0, 0] {
            put32(&mut out, v);
        }
        let mut at = RSC_TAB_HEADER_SIZE + 4 * self.entries.len();
        for e in &self.entries {
            put32(&mut out, at as u32);
            at += (e.len() + 3) & !3;
        }
        for e in &self.entries {
            out.extend_from_slice(e);
            out.resize((out.len() + 3) & !3, 0);
        }
        out
    }
}
