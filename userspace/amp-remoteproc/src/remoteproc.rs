// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One remote processor: lifecycle, memory, firmware and vdevs
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/lifecycle.rs, tests/loader.rs, tests/virtio.rs
//!
//! State machine:
//!   OFFLINE --load--> READY --start--> RUNNING --stop--> STOPPED
//!   start failure -> ERROR; shutdown from anywhere -> OFFLINE
//!
//! Locking: a single instance lock guards state, regions, the notify-id bitmap,
//! the resource table location and the vdev list. Platform ops run under it,
//! except `notify`, which runs from virtqueue kicks without it.

use std::sync::Arc;

use amp_hal::{IoRegion, Notifier};
use amp_virtio::{vring_size, Role, VirtioDevice};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::elf::{ElfLoader, ImageLoader, Mapper, IMAGE_HEAD_SIZE};
use crate::mem::{Mapping, MemAttr, MemList, MmapRequest, RemoteprocMem};
use crate::rsc::{self, RscHandler, VdevRsc, RSC_NOTIFY_ID_ANY, RSC_VDEV};
use crate::store::{load_data, ImageStore, LoadMode};
use crate::virtio::{RprocVirtio, Vring};
use crate::{Error, Result, State};

const NOTIFY_ID_BITS: u32 = u64::BITS;

/// Platform hooks for one remote processor.
pub trait RemoteprocOps: Send + Sync {
    /// Called once when the instance is created.
    fn init(&self) -> Result<()> {
        Ok(())
    }
    /// Called when the instance is removed.
    fn remove(&self) {}
    /// Maps memory no tracked region covers. The returned region is tracked
    /// from then on.
    fn mmap(&self, req: &MmapRequest<'_>) -> Result<RemoteprocMem> {
        let _ = req;
        Err(Error::NotSupported)
    }
    /// Handles a vendor resource-table entry (starting at its type tag).
    fn handle_rsc(&self, entry: &mut [u8]) -> Result<()> {
        let _ = entry;
        Err(Error::NotSupported)
    }
    /// Releases the processor from reset at `bootaddr`.
    fn start(&self, bootaddr: u64) -> Result<()>;
    /// Halts the processor; resources stay held.
    fn stop(&self) -> Result<()> {
        Ok(())
    }
    /// Powers the processor down and releases platform resources.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    /// Rings the doorbell for notification id `id`.
    fn notify(&self, id: u32) -> Result<()>;
}

#[derive(Clone)]
struct RscLocation {
    io: IoRegion,
    offset: usize,
    len: usize,
}

impl RscLocation {
    fn read(&self) -> Result<Vec<u8>> {
        let mut table = vec![0u8; self.len];
        self.io.invalidate(self.offset, self.len);
        self.io.block_read(self.offset, &mut table)?;
        Ok(table)
    }

    fn write(&self, table: &[u8]) -> Result<()> {
        self.io.block_write(self.offset, table)?;
        self.io.flush(self.offset, table.len());
        Ok(())
    }
}

struct Inner {
    state: State,
    bootaddr: u64,
    mems: MemList,
    notify_ids: u64,
    rsc: Option<RscLocation>,
    vdevs: Vec<Arc<RprocVirtio>>,
}

impl Inner {
    fn mmap(&mut self, ops: &dyn RemoteprocOps, req: MmapRequest<'_>) -> Result<Mapping> {
        if let Some(m) = self.mems.lookup(req.pa, req.da, req.size) {
            return Ok(m);
        }
        let mem = ops.mmap(&req).map_err(|e| {
            warn!("remoteproc: platform mmap pa {:?} da {:?} size {:#x} failed: {e}", req.pa, req.da, req.size);
            e
        })?;
        let m = match (req.pa, req.da) {
            (Some(pa), _) if mem.covers_pa(pa, req.size) => mem.at_pa(pa),
            (None, Some(da)) if mem.covers_da(da, req.size) => mem.at_da(da),
            (None, None) if mem.size() >= req.size => mem.at_pa(mem.pa()),
            _ => {
                error!("remoteproc: platform region '{}' does not cover the request", mem.name());
                return Err(Error::NoMem);
            }
        };
        debug!(
            "remoteproc: new region '{}' pa {:#x} da {:#x} size {:#x}",
            mem.name(),
            mem.pa(),
            mem.da(),
            mem.size()
        );
        self.mems.add(mem);
        Ok(m)
    }

    /// Drops everything derived from the current resource table.
    fn release_table(&mut self) {
        for vdev in self.vdevs.drain(..) {
            vdev.delete_virtqueues();
        }
        self.rsc = None;
        self.notify_ids = 0;
    }

    fn allocate_id(&mut self, start: u32, end: u32) -> Option<u32> {
        let start = if start == RSC_NOTIFY_ID_ANY { 0 } else { start };
        let end = if end == RSC_NOTIFY_ID_ANY { NOTIFY_ID_BITS } else { end.min(NOTIFY_ID_BITS) };
        let id = (start..end).find(|id| self.notify_ids & (1 << id) == 0)?;
        self.notify_ids |= 1 << id;
        Some(id)
    }
}

/// Instance state plus platform ops, handed to the loader and the table parser.
struct Resources<'a> {
    inner: &'a mut Inner,
    ops: &'a dyn RemoteprocOps,
}

impl Resources<'_> {
    fn map_da(&mut self, da: u64, size: usize, attr: MemAttr) -> Result<Mapping> {
        let req = MmapRequest { pa: None, da: Some(da), size, attr, name: None };
        self.inner.mmap(self.ops, req)
    }

    /// Copies a table parsed from the image to its place in target memory.
    fn place_rsc_table(&mut self, da: u64, table: &[u8]) -> Result<Option<RscLocation>> {
        let m = match self.map_da(da, table.len(), MemAttr::SHARED) {
            Ok(m) => m,
            Err(e) => {
                warn!("remoteproc: resource table at da {da:#x} not updated: {e}");
                return Ok(None);
            }
        };
        let loc = RscLocation { io: m.io, offset: m.offset, len: table.len() };
        loc.write(table)?;
        Ok(Some(loc))
    }

    /// Parses a table that only exists in target memory (forward-only stores).
    fn adopt_rsc_table(&mut self, da: u64, len: usize) -> Result<RscLocation> {
        let m = self.map_da(da, len, MemAttr::SHARED)?;
        let loc = RscLocation { io: m.io, offset: m.offset, len };
        let mut table = loc.read()?;
        rsc::handle_rsc_table(&mut table, self)?;
        loc.write(&table)?;
        Ok(loc)
    }
}

impl Mapper for Resources<'_> {
    fn map(&mut self, da: u64, size: usize) -> Result<Mapping> {
        self.map_da(da, size, MemAttr::EXEC)
    }
}

impl RscHandler for Resources<'_> {
    fn map(
        &mut self,
        pa: Option<u64>,
        da: Option<u64>,
        len: usize,
        attr: MemAttr,
        name: &str,
    ) -> Result<Mapping> {
        let req = MmapRequest { pa, da, size: len, attr, name: Some(name) };
        self.inner.mmap(self.ops, req)
    }

    fn allocate_id(&mut self, start: u32, end: u32) -> Option<u32> {
        self.inner.allocate_id(start, end)
    }

    fn vendor(&mut self, entry: &mut [u8]) -> Result<()> {
        self.ops.handle_rsc(entry)
    }
}

/// Loads the image; the loader context is dropped before the caller closes the store.
fn load_image(
    res: &mut Resources<'_>,
    store: &mut dyn ImageStore,
) -> Result<(u64, Option<RscLocation>)> {
    let mut head = [0u8; IMAGE_HEAD_SIZE];
    let n = load_data(store, 0, &mut head, LoadMode::Sync)?;
    if n == 0 {
        return Err(Error::Invalid("empty image"));
    }
    if !ElfLoader::identify(&head[..n]) {
        return Err(Error::Invalid("unknown image format"));
    }
    let mut loader: Box<dyn ImageLoader> = Box::new(ElfLoader::parse(store)?);

    let early = match loader.rsc_table() {
        Some((da, _)) => {
            let mut table = loader.copy_rsc_table(store)?;
            rsc::handle_rsc_table(&mut table, &mut *res)?;
            Some((da, table))
        }
        None => None,
    };
    loader.load(store, &mut *res)?;

    let rsc = match (early, loader.rsc_table()) {
        (Some((da, table)), _) => res.place_rsc_table(da, &table)?,
        (None, Some((da, len))) => Some(res.adopt_rsc_table(da, len)?),
        (None, None) => None,
    };
    Ok((loader.entry(), rsc))
}

struct OpsNotifier(Arc<dyn RemoteprocOps>);

impl Notifier for OpsNotifier {
    fn notify(&self, id: u32) {
        if let Err(e) = self.0.notify(id) {
            warn!("remoteproc: notify {id} failed: {e}");
        }
    }
}

/// A remote processor.
pub struct Remoteproc {
    ops: Arc<dyn RemoteprocOps>,
    inner: Mutex<Inner>,
}

impl Remoteproc {
    /// Runs `ops.init` and returns an OFFLINE instance.
    pub fn new(ops: Arc<dyn RemoteprocOps>) -> Result<Self> {
        ops.init()?;
        Ok(Self {
            ops,
            inner: Mutex::new(Inner {
                state: State::Offline,
                bootaddr: 0,
                mems: MemList::default(),
                notify_ids: 0,
                rsc: None,
                vdevs: Vec::new(),
            }),
        })
    }

    /// Releases the instance. Only legal while OFFLINE.
    pub fn remove(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.state != State::Offline {
            return Err(Error::Busy(inner.state));
        }
        self.ops.remove();
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Entry point used by `start`.
    pub fn bootaddr(&self) -> u64 {
        self.inner.lock().bootaddr
    }

    /// Overrides the entry point.
    pub fn set_bootaddr(&self, addr: u64) {
        self.inner.lock().bootaddr = addr;
    }

    /// Loads firmware from `store`, handling its resource table.
    ///
    /// Reloading a loaded instance first drops the previous image's table,
    /// vdevs and notify ids. On failure the loader context and the store are
    /// closed, the platform is shut down, and every region and notify id
    /// claimed by this call is released.
    pub fn load(&self, store: &mut dyn ImageStore) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Running | State::Error) {
            error!("remoteproc: load rejected in state {:?}", inner.state);
            return Err(Error::Busy(inner.state));
        }
        store.open().map_err(|e| {
            error!("remoteproc: opening image failed: {e}");
            e
        })?;
        if inner.state != State::Offline {
            inner.release_table();
        }
        let mems = inner.mems.len();
        let notify_ids = inner.notify_ids;
        let loaded = load_image(&mut Resources { inner: &mut *inner, ops: &*self.ops }, store);
        store.close();
        match loaded {
            Ok((entry, rsc)) => {
                inner.bootaddr = entry;
                if rsc.is_some() {
                    inner.rsc = rsc;
                }
                inner.state = State::Ready;
                info!("remoteproc: firmware loaded, entry {entry:#x}");
                Ok(())
            }
            Err(e) => {
                error!("remoteproc: load failed: {e}");
                if let Err(se) = self.ops.shutdown() {
                    warn!("remoteproc: shutdown after failed load: {se}");
                }
                inner.mems.truncate(mems);
                inner.notify_ids = notify_ids;
                inner.state = State::Offline;
                Err(e)
            }
        }
    }

    /// READY -> RUNNING.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != State::Ready {
            return Err(Error::Busy(inner.state));
        }
        match self.ops.start(inner.bootaddr) {
            Ok(()) => {
                inner.state = State::Running;
                info!("remoteproc: started at {:#x}", inner.bootaddr);
                Ok(())
            }
            Err(e) => {
                inner.state = State::Error;
                error!("remoteproc: start failed: {e}");
                Err(e)
            }
        }
    }

    /// Halts the processor, keeping its resources. A no-op when already
    /// stopped or offline.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Stopped | State::Offline) {
            return Ok(());
        }
        self.ops.stop()?;
        inner.state = State::Stopped;
        Ok(())
    }

    /// Stops if needed, shuts the platform down and forgets every region.
    ///
    /// The instance ends OFFLINE even when a platform op fails; the first
    /// failure is returned. While OFFLINE the platform is not called, but
    /// tracked regions, vdevs and notify ids are still released.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Offline {
            inner.release_table();
            inner.mems.clear();
            return Ok(());
        }
        let stopped = match inner.state {
            State::Stopped => Ok(()),
            _ => self.ops.stop(),
        };
        let shut = self.ops.shutdown();
        inner.release_table();
        inner.mems.clear();
        inner.state = State::Offline;
        info!("remoteproc: offline");
        stopped.and(shut)
    }

    /// Maps memory, preferring tracked regions over the platform `mmap`.
    pub fn mmap(
        &self,
        pa: Option<u64>,
        da: Option<u64>,
        size: usize,
        attr: MemAttr,
    ) -> Result<Mapping> {
        let req = MmapRequest { pa, da, size, attr, name: None };
        self.inner.lock().mmap(&*self.ops, req)
    }

    /// Starts tracking a region the platform set up itself.
    pub fn add_mem(&self, mem: RemoteprocMem) {
        self.inner.lock().mems.add(mem);
    }

    /// Number of tracked regions.
    pub fn mem_count(&self) -> usize {
        self.inner.lock().mems.len()
    }

    /// Region by name.
    pub fn mem_with_name(&self, name: &str) -> Option<RemoteprocMem> {
        self.inner.lock().mems.by_name(name).cloned()
    }

    /// Region containing physical address `pa`.
    pub fn mem_with_pa(&self, pa: u64) -> Option<RemoteprocMem> {
        self.inner.lock().mems.by_pa(pa, 1).cloned()
    }

    /// Region containing device address `da`, with the offset of `da` in it.
    pub fn mem_with_da(&self, da: u64) -> Option<(RemoteprocMem, usize)> {
        let inner = self.inner.lock();
        let mem = inner.mems.by_da(da, 1)?;
        Some((mem.clone(), (da - mem.da()) as usize))
    }

    /// Region owning byte `offset` of `io`.
    pub fn mem_with_va(&self, io: &IoRegion, offset: usize) -> Option<RemoteprocMem> {
        self.inner.lock().mems.by_va(io, offset).cloned()
    }

    /// Local view of device address `da`, from tracked regions only.
    pub fn da_to_va(&self, da: u64) -> Option<Mapping> {
        self.inner.lock().mems.lookup(None, Some(da), 1)
    }

    /// Claims a notification id in `[start, end)`. `RSC_NOTIFY_ID_ANY` widens
    /// either bound.
    pub fn allocate_id(&self, start: u32, end: u32) -> Option<u32> {
        self.inner.lock().allocate_id(start, end)
    }

    /// Runs the table handlers over `table`, updating it in place.
    pub fn parse_rsc_table(&self, table: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        rsc::handle_rsc_table(table, &mut Resources { inner: &mut *inner, ops: &*self.ops })
    }

    /// Adopts a resource table already in memory, e.g. the remote's own
    /// linked-in table. `io` must belong to a tracked region.
    pub fn set_rsc_table(&self, io: &IoRegion, offset: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.mems.by_va(io, offset).is_none() {
            return Err(Error::Invalid("resource table outside tracked memory"));
        }
        let loc = RscLocation { io: io.clone(), offset, len };
        let mut table = loc.read()?;
        rsc::handle_rsc_table(&mut table, &mut Resources { inner: &mut *inner, ops: &*self.ops })?;
        loc.write(&table)?;
        inner.rsc = Some(loc);
        Ok(())
    }

    /// A copy of the current resource table.
    pub fn rsc_table(&self) -> Result<Vec<u8>> {
        self.inner.lock().rsc.as_ref().ok_or(Error::RscMissing)?.read()
    }

    /// Builds the virtio device for the `index`-th vdev entry, mapping its
    /// vrings. Returns the existing device if it was already created.
    pub fn create_virtio(&self, index: usize, role: Role) -> Result<Arc<RprocVirtio>> {
        let mut inner = self.inner.lock();
        let loc = inner.rsc.clone().ok_or(Error::RscMissing)?;
        let table = loc.read()?;
        let entry = rsc::find_rsc(&table, RSC_VDEV, index).ok_or(Error::NoDevice)?;
        let vdev = VdevRsc::read(&table, entry)?;
        if let Some(dev) = inner.vdevs.iter().find(|d| d.notify_id() == vdev.notifyid) {
            return Ok(Arc::clone(dev));
        }

        let mut vrings = Vec::with_capacity(vdev.vrings.len());
        for r in &vdev.vrings {
            let num = u16::try_from(r.num).map_err(|_| Error::Invalid("vring size"))?;
            let size = vring_size(num, r.align);
            if size == 0 {
                return Err(Error::Invalid("vring geometry"));
            }
            let req = MmapRequest {
                pa: None,
                da: Some(r.da as u64),
                size,
                attr: MemAttr::SHARED | MemAttr::UNCACHED,
                name: None,
            };
            let map = inner.mmap(&*self.ops, req)?;
            vrings.push(Vring { notify_id: r.notifyid, num, align: r.align, map });
        }
        let notifier: Arc<dyn Notifier> = Arc::new(OpsNotifier(Arc::clone(&self.ops)));
        let dev = Arc::new(RprocVirtio::new(
            role,
            loc.io.clone(),
            loc.offset + entry,
            &vdev,
            vrings,
            notifier,
        ));
        inner.vdevs.push(Arc::clone(&dev));
        Ok(dev)
    }

    /// Forgets a device built by `create_virtio`.
    pub fn remove_virtio(&self, vdev: &Arc<RprocVirtio>) {
        self.inner.lock().vdevs.retain(|d| !Arc::ptr_eq(d, vdev));
        vdev.delete_virtqueues();
    }

    /// Dispatches an incoming notification to every vdev.
    pub fn get_notification(&self, notify_id: u32) {
        let vdevs = self.inner.lock().vdevs.clone();
        for vdev in vdevs {
            vdev.notified(notify_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps a fixed 64 KiB window at pa == da == 0x4000_0000.
    struct Ops {
        shm: IoRegion,
        mmaps: AtomicUsize,
    }

    impl RemoteprocOps for Ops {
        fn mmap(&self, req: &MmapRequest<'_>) -> Result<RemoteprocMem> {
            self.mmaps.fetch_add(1, Ordering::SeqCst);
            let da = req.da.or(req.pa).unwrap_or(0x4000_0000) & !0xfff;
            let offset = self.shm.phys_to_offset(da).ok_or(Error::NoMem)?;
            let io = self.shm.window(offset, 0x1000)?;
            Ok(RemoteprocMem::new(req.name.unwrap_or("anon"), da, io))
        }
        fn start(&self, _bootaddr: u64) -> Result<()> {
            Ok(())
        }
        fn notify(&self, _id: u32) -> Result<()> {
            Ok(())
        }
    }

    fn rproc() -> (Remoteproc, Arc<Ops>) {
        let ops = Arc::new(Ops {
            shm: IoRegion::heap(0x4000_0000, 0x10000),
            mmaps: AtomicUsize::new(0),
        });
        (Remoteproc::new(ops.clone()).unwrap(), ops)
    }

    #[test]
    fn notify_ids_are_claimed_once() {
        let (rp, _) = rproc();
        assert_eq!(rp.allocate_id(RSC_NOTIFY_ID_ANY, RSC_NOTIFY_ID_ANY), Some(0));
        assert_eq!(rp.allocate_id(RSC_NOTIFY_ID_ANY, RSC_NOTIFY_ID_ANY), Some(1));
        assert_eq!(rp.allocate_id(1, 2), None);
        assert_eq!(rp.allocate_id(5, 6), Some(5));
        assert_eq!(rp.allocate_id(0, 3), Some(2));
        assert_eq!(rp.allocate_id(64, 70), None);
    }

    #[test]
    fn tracked_regions_win_over_platform_mmap() {
        let (rp, ops) = rproc();
        let first = rp.mmap(None, Some(0x4000_1010), 0x10, MemAttr::SHARED).unwrap();
        assert_eq!(first.pa, 0x4000_1010);
        assert_eq!(first.offset, 0x10);
        assert_eq!(ops.mmaps.load(Ordering::SeqCst), 1);

        let again = rp.mmap(Some(0x4000_1800), None, 0x100, MemAttr::SHARED).unwrap();
        assert_eq!(again.da, 0x4000_1800);
        assert_eq!(ops.mmaps.load(Ordering::SeqCst), 1);
        assert_eq!(rp.mem_count(), 1);
        assert!(rp.da_to_va(0x4000_1fff).is_some());
        assert!(rp.da_to_va(0x4000_2000).is_none());
    }

    #[test]
    fn platform_region_must_cover_the_request() {
        let (rp, _) = rproc();
        assert_eq!(
            rp.mmap(None, Some(0x4000_3f00), 0x200, MemAttr::SHARED).err(),
            Some(Error::NoMem)
        );
        assert_eq!(rp.mem_count(), 0);
    }

    #[test]
    fn rsc_table_outside_tracked_memory_is_rejected() {
        let (rp, ops) = rproc();
        assert_eq!(
            rp.set_rsc_table(&ops.shm, 0, 16).err(),
            Some(Error::Invalid("resource table outside tracked memory"))
        );
        assert_eq!(rp.rsc_table().err(), Some(Error::RscMissing));
        assert_eq!(rp.create_virtio(0, Role::Driver).err(), Some(Error::RscMissing));
    }

    #[test]
    fn remove_needs_offline() {
        let (rp, _) = rproc();
        assert!(rp.remove().is_ok());
    }
}
