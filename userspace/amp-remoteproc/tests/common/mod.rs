// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulated platform: a fixed bank map over one heap region, plus a call log
//! shared with the image store so unwind order can be checked.

#![allow(dead_code)]

pub mod elf;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use amp_hal::IoRegion;
use amp_remoteproc::rsc::{ResourceTableBuilder, VdevRsc, VringRsc, RSC_NOTIFY_ID_ANY};
use amp_remoteproc::{
    Error, ImageStore, LoadMode, MemoryStore, MmapRequest, Remoteproc, RemoteprocMem,
    RemoteprocOps, Result, StoreFeatures,
};
use parking_lot::Mutex;

pub const SHM_BASE: u64 = 0x9000_0000;
pub const SHM_SIZE: usize = 0x30000;

pub const TEXT_DA: u64 = 0x9000_0000;
pub const RSC_DA: u64 = 0x9000_1000;
pub const VRING0_DA: u32 = 0x9000_4000;
pub const VRING1_DA: u32 = 0x9000_6000;
pub const VRING_NUM: u32 = 16;
pub const VRING_ALIGN: u32 = 0x1000;
pub const BUFFER_DA: u32 = 0x9001_0000;
pub const BUFFER_LEN: u32 = 0x8000;

/// Banks the platform can map, identity mapped (pa == da).
const BANKS: &[(&str, u64, usize)] = &[
    ("text", 0x9000_0000, 0x4000),
    ("vrings", 0x9000_4000, 0x4000),
    ("buffers", 0x9001_0000, 0x8000),
    ("dyn", 0x9002_0000, 0x8000),
];

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct TestOps {
    pub shm: IoRegion,
    pub log: CallLog,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_shutdown: AtomicBool,
    pub notified: Mutex<Vec<u32>>,
}

impl TestOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shm: IoRegion::heap(SHM_BASE, SHM_SIZE),
            log: CallLog::default(),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_shutdown: AtomicBool::new(false),
            notified: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().push(call.into());
    }
}

impl RemoteprocOps for TestOps {
    fn init(&self) -> Result<()> {
        self.record("init");
        Ok(())
    }

    fn remove(&self) {
        self.record("remove");
    }

    fn mmap(&self, req: &MmapRequest<'_>) -> Result<RemoteprocMem> {
        let (name, base, size) = match req.pa.or(req.da) {
            Some(addr) => BANKS
                .iter()
                .find(|(_, base, size)| addr >= *base && addr < base + *size as u64)
                .copied()
                .ok_or(Error::NoMem)?,
            None => BANKS[3],
        };
        self.record(format!("mmap({base:#x})"));
        let io = self.shm.window((base - SHM_BASE) as usize, size)?;
        Ok(RemoteprocMem::new(req.name.unwrap_or(name), base, io))
    }

    fn start(&self, bootaddr: u64) -> Result<()> {
        self.record(format!("start({bootaddr:#x})"));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.record("shutdown");
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    fn notify(&self, id: u32) -> Result<()> {
        self.notified.lock().push(id);
        Ok(())
    }
}

/// A seekable store that logs `close` into the platform call log.
pub struct LoggedStore {
    inner: MemoryStore,
    log: CallLog,
}

impl LoggedStore {
    pub fn new(image: Vec<u8>, log: &CallLog) -> Self {
        Self { inner: MemoryStore::new(image), log: Arc::clone(log) }
    }
}

impl ImageStore for LoggedStore {
    fn open(&mut self) -> Result<()> {
        self.log.lock().push("store.open".into());
        self.inner.open()
    }

    fn close(&mut self) {
        self.log.lock().push("store.close".into());
        self.inner.close();
    }

    fn load(&mut self, offset: u64, dst: &mut [u8], mode: LoadMode) -> Result<usize> {
        self.inner.load(offset, dst, mode)
    }

    fn features(&self) -> StoreFeatures {
        self.inner.features()
    }
}

/// vdev 7 (rpmsg) with two 16-entry rings, every notify id left to the host.
pub fn rpmsg_vdev(dfeatures: u32, config_len: u32) -> VdevRsc {
    let ring = |da| VringRsc { da, align: VRING_ALIGN, num: VRING_NUM, notifyid: RSC_NOTIFY_ID_ANY };
    VdevRsc {
        id: 7,
        notifyid: RSC_NOTIFY_ID_ANY,
        dfeatures,
        gfeatures: 0,
        config_len,
        status: 0,
        vrings: vec![ring(VRING0_DA), ring(VRING1_DA)],
    }
}

/// The table used by most tests: one vdev and a named buffer carveout.
pub fn default_table() -> Vec<u8> {
    use amp_remoteproc::rsc::Carveout;
    ResourceTableBuilder::new()
        .vdev(&rpmsg_vdev(0x1, 8))
        .carveout(&Carveout {
            da: BUFFER_DA,
            pa: BUFFER_DA,
            len: BUFFER_LEN,
            flags: 0,
            name: "vdev0buffer".into(),
        })
        .build()
}

/// An image with code, bss and the resource table.
pub fn firmware(image: elf::ElfImage, table: &[u8]) -> Vec<u8> {
    image
        .entry(TEXT_DA + 0x100)
        .segment(TEXT_DA, &[0xaa; 0x300], 0x800)
        .rsc_table(RSC_DA, table)
        .build()
}

/// A remoteproc that has loaded the default firmware.
pub fn loaded() -> (Remoteproc, Arc<TestOps>) {
    let ops = TestOps::new();
    let rp = Remoteproc::new(ops.clone()).expect("init");
    let image = firmware(elf::ElfImage::elf32_le(), &default_table());
    rp.load(&mut MemoryStore::new(image)).expect("load");
    (rp, ops)
}
