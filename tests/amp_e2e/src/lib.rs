// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-only two-core harness for the AMP stack.
//!
//! One heap region stands in for the memory both cores see. The host core
//! loads firmware through `amp-remoteproc`, drives the rpmsg vdev as the
//! virtio driver and "releases" the remote from reset. The remote core adopts
//! the resource table its firmware linked in and serves the vdev as the
//! virtio device. Doorbells are synchronous: a notify on one core runs the
//! peer's `get_notification` on the calling thread.

#![forbid(unsafe_code)]

#[path = "../../../userspace/amp-remoteproc/tests/common/elf.rs"]
mod elf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use amp_hal::IoRegion;
use amp_remoteproc::rsc::{Carveout, ResourceTableBuilder, VdevRsc, VringRsc, RSC_NOTIFY_ID_ANY};
use amp_remoteproc::{MemAttr, MemoryStore, MmapRequest, Remoteproc, RemoteprocMem, RemoteprocOps};
use amp_rpmsg::{RpmsgDevice, ShmPool, VIRTIO_RPMSG_F_FC, VIRTIO_RPMSG_F_NS};
use amp_virtio::{Role, VIRTIO_ID_RPMSG};
use anyhow::{Context, Result};
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

/// Physical base of the shared region.
pub const SHM_BASE: u64 = 0x9000_0000;
/// Size of the shared region.
pub const SHM_SIZE: usize = 0x30000;
/// Firmware text.
pub const TEXT_DA: u64 = 0x9000_0000;
/// Firmware entry point.
pub const ENTRY: u64 = TEXT_DA + 0x100;
/// Where the firmware links its resource table.
pub const RSC_DA: u64 = 0x9000_1000;
/// First vring.
pub const VRING0_DA: u32 = 0x9000_4000;
/// Second vring.
pub const VRING1_DA: u32 = 0x9000_6000;
/// Descriptors per vring.
pub const VRING_NUM: u32 = 16;
/// Used-ring alignment.
pub const VRING_ALIGN: u32 = 0x1000;
/// rpmsg buffer carveout.
pub const BUFFER_DA: u32 = 0x9001_0000;
/// rpmsg buffer carveout size.
pub const BUFFER_LEN: u32 = 0x8000;
/// Name of the rpmsg buffer carveout.
pub const BUFFER_NAME: &str = "vdev0buffer";

/// Identity-mapped banks either core may map.
const BANKS: &[(&str, u64, usize)] = &[
    ("text", 0x9000_0000, 0x4000),
    ("vrings", 0x9000_4000, 0x4000),
    ("buffers", 0x9001_0000, 0x8000),
];

/// Harness failures that are not errors of the stack itself.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A request fell outside every bank.
    #[error("address {0:#x} is not in any bank")]
    Unmapped(u64),
    /// A region the firmware declares was not mapped.
    #[error("region '{0}' missing")]
    MissingRegion(&'static str),
}

/// Platform ops of one core.
pub struct Platform {
    core: &'static str,
    shm: IoRegion,
    peer: OnceLock<Weak<Remoteproc>>,
    started_at: AtomicU64,
    doorbells: Mutex<Vec<u32>>,
}

impl Platform {
    fn new(core: &'static str, shm: IoRegion) -> Arc<Self> {
        Arc::new(Self {
            core,
            shm,
            peer: OnceLock::new(),
            started_at: AtomicU64::new(0),
            doorbells: Mutex::new(Vec::new()),
        })
    }

    /// Entry address the core was last started at, 0 if never.
    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::SeqCst)
    }

    /// Notification ids rung by this core, in order.
    pub fn doorbells(&self) -> Vec<u32> {
        self.doorbells.lock().clone()
    }
}

impl RemoteprocOps for Platform {
    fn mmap(&self, req: &MmapRequest<'_>) -> amp_remoteproc::Result<RemoteprocMem> {
        let addr = req.pa.or(req.da).ok_or(amp_remoteproc::Error::NoMem)?;
        let (bank, base, size) = BANKS
            .iter()
            .find(|(_, base, size)| addr >= *base && addr < base + *size as u64)
            .copied()
            .ok_or_else(|| {
                debug!("{}: {}", self.core, HarnessError::Unmapped(addr));
                amp_remoteproc::Error::NoMem
            })?;
        let io = self.shm.window((base - SHM_BASE) as usize, size)?;
        Ok(RemoteprocMem::new(req.name.unwrap_or(bank), base, io))
    }

    fn start(&self, bootaddr: u64) -> amp_remoteproc::Result<()> {
        debug!("{}: release from reset at {bootaddr:#x}", self.core);
        self.started_at.store(bootaddr, Ordering::SeqCst);
        Ok(())
    }

    fn notify(&self, id: u32) -> amp_remoteproc::Result<()> {
        self.doorbells.lock().push(id);
        if let Some(peer) = self.peer.get().and_then(Weak::upgrade) {
            peer.get_notification(id);
        }
        Ok(())
    }
}

/// The resource table the firmware links at `RSC_DA`.
pub fn resource_table() -> Vec<u8> {
    let ring = |da| VringRsc { da, align: VRING_ALIGN, num: VRING_NUM, notifyid: RSC_NOTIFY_ID_ANY };
    ResourceTableBuilder::new()
        .vdev(&VdevRsc {
            id: VIRTIO_ID_RPMSG,
            notifyid: RSC_NOTIFY_ID_ANY,
            dfeatures: (1 << VIRTIO_RPMSG_F_NS) | (1 << VIRTIO_RPMSG_F_FC),
            gfeatures: 0,
            config_len: 0,
            status: 0,
            vrings: vec![ring(VRING0_DA), ring(VRING1_DA)],
        })
        .carveout(&Carveout {
            da: BUFFER_DA,
            pa: BUFFER_DA,
            len: BUFFER_LEN,
            flags: 0,
            name: BUFFER_NAME.into(),
        })
        .build()
}

/// Remote firmware: some text, bss and the resource table.
pub fn firmware() -> Vec<u8> {
    elf::ElfImage::elf32_le()
        .entry(ENTRY)
        .segment(TEXT_DA, &[0x13; 0x400], 0x800)
        .rsc_table(RSC_DA, &resource_table())
        .build()
}

/// Both cores, wired to each other's doorbells.
pub struct AmpPair {
    /// Host-side view of the remote processor.
    pub host: Arc<Remoteproc>,
    /// The remote core's own instance.
    pub remote: Arc<Remoteproc>,
    /// Host platform.
    pub host_ops: Arc<Platform>,
    /// Remote platform.
    pub remote_ops: Arc<Platform>,
}

impl AmpPair {
    /// Creates both instances over one shared region.
    pub fn new() -> Result<Self> {
        let shm = IoRegion::heap(SHM_BASE, SHM_SIZE);
        let host_ops = Platform::new("host", shm.clone());
        let remote_ops = Platform::new("remote", shm);
        let host = Arc::new(Remoteproc::new(host_ops.clone()).context("host init")?);
        let remote = Arc::new(Remoteproc::new(remote_ops.clone()).context("remote init")?);
        let _ = host_ops.peer.set(Arc::downgrade(&remote));
        let _ = remote_ops.peer.set(Arc::downgrade(&host));
        Ok(Self { host, remote, host_ops, remote_ops })
    }

    /// Host: loads the firmware image.
    pub fn load(&self) -> Result<()> {
        self.host.load(&mut MemoryStore::new(firmware())).context("load firmware")?;
        Ok(())
    }

    /// Host: creates the vdev and brings the rpmsg driver up.
    pub fn host_channel(
        &self,
        configure: impl FnOnce(amp_rpmsg::RpmsgDeviceBuilder) -> amp_rpmsg::RpmsgDeviceBuilder,
    ) -> Result<RpmsgDevice> {
        let vdev = self.host.create_virtio(0, Role::Driver).context("host vdev")?;
        let buffers = self
            .host
            .mem_with_name(BUFFER_NAME)
            .ok_or(HarnessError::MissingRegion(BUFFER_NAME))?;
        let pool = ShmPool::new(buffers.io().clone(), 0, buffers.size())?;
        let dev = configure(RpmsgDevice::builder(vdev).pool(pool)).init().context("host rpmsg")?;
        Ok(dev)
    }

    /// Remote: adopts the linked-in table, creates the vdev and serves it.
    pub fn remote_channel(&self) -> Result<RpmsgDevice> {
        let len = resource_table().len();
        let table = self
            .remote
            .mmap(Some(RSC_DA), None, len, MemAttr::SHARED)
            .context("map resource table")?;
        self.remote.set_rsc_table(&table.io, table.offset, len).context("adopt table")?;
        let vdev = self.remote.create_virtio(0, Role::Device).context("remote vdev")?;
        let buffers = self
            .remote
            .mem_with_name(BUFFER_NAME)
            .ok_or(HarnessError::MissingRegion(BUFFER_NAME))?;
        let dev = RpmsgDevice::builder(vdev)
            .buffer_region(buffers.io().clone())
            .init()
            .context("remote rpmsg")?;
        Ok(dev)
    }
}
