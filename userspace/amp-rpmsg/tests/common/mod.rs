// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loopback virtio link: a driver and a device sharing one memory region, with
//! kicks delivered synchronously to the peer's queue callbacks.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use amp_hal::{IoRegion, Notifier};
use amp_rpmsg::{RpmsgDevice, ShmPool, VIRTIO_RPMSG_F_FC, VIRTIO_RPMSG_F_NS};
use amp_virtio::{
    vring_size, DeviceId, DeviceStatus, Role, VirtioDevice, VirtioError, VqCallback,
    VqCallbacks, Virtqueue, VirtqueueConfig, VIRTIO_ID_RPMSG, VIRTIO_RING_F_EVENT_IDX,
};

pub const SHM_PHYS: u64 = 0x9000_0000;
pub const SHM_SIZE: usize = 0x8000;
pub const RING_ALIGN: u32 = 64;
pub const RING_SPACING: usize = 0x1000;
pub const POOL_OFFSET: usize = 2 * RING_SPACING;

pub struct Link {
    pub io: IoRegion,
    num: u16,
    status: AtomicU8,
    offered: u64,
    accepted: AtomicU64,
    callbacks: [VqCallbacks; 2],
    pub kicks: AtomicUsize,
}

impl Link {
    fn side(role: Role) -> usize {
        match role {
            Role::Driver => 0,
            Role::Device => 1,
        }
    }
}

struct LoopNotifier {
    link: Arc<Link>,
    to: Role,
}

impl Notifier for LoopNotifier {
    fn notify(&self, id: u32) {
        self.link.kicks.fetch_add(1, Ordering::SeqCst);
        self.link.callbacks[Link::side(self.to)].dispatch(id);
    }
}

pub struct LoopDevice {
    pub link: Arc<Link>,
    role: Role,
}

impl VirtioDevice for LoopDevice {
    fn role(&self) -> Role {
        self.role
    }

    fn id(&self) -> DeviceId {
        DeviceId { device: VIRTIO_ID_RPMSG, vendor: 0, version: 0 }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.link.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: DeviceStatus) -> Result<(), VirtioError> {
        self.link.status.store(status.bits(), Ordering::SeqCst);
        Ok(())
    }

    fn device_features(&self) -> u64 {
        self.link.offered
    }

    fn features(&self) -> u64 {
        self.link.accepted.load(Ordering::SeqCst)
    }

    fn set_features(&self, features: u64) -> Result<(), VirtioError> {
        self.link.accepted.store(features, Ordering::SeqCst);
        Ok(())
    }

    fn read_config(&self, _offset: usize, _dst: &mut [u8]) -> Result<(), VirtioError> {
        Err(VirtioError::ConfigRange)
    }

    fn write_config(&self, _offset: usize, _src: &[u8]) -> Result<(), VirtioError> {
        Err(VirtioError::ConfigRange)
    }

    fn reset(&self) {
        self.link.status.store(0, Ordering::SeqCst);
    }

    fn vring_count(&self) -> usize {
        2
    }

    fn create_virtqueues(
        &self,
        names: &[&str],
        callbacks: Vec<Option<VqCallback>>,
    ) -> Result<Vec<Virtqueue>, VirtioError> {
        if names.len() != 2 || callbacks.len() != 2 {
            return Err(VirtioError::QueueCount { expected: 2, got: names.len() });
        }
        let peer = match self.role {
            Role::Driver => Role::Device,
            Role::Device => Role::Driver,
        };
        let event_idx = self.features() & VIRTIO_RING_F_EVENT_IDX != 0;
        let mut vqs = Vec::with_capacity(2);
        for (i, name) in names.iter().enumerate() {
            vqs.push(Virtqueue::new(VirtqueueConfig {
                name: (*name).to_owned(),
                index: i as u16,
                notify_id: i as u32,
                num: self.link.num,
                align: RING_ALIGN,
                io: self.link.io.clone(),
                offset: i * RING_SPACING,
                role: self.role,
                event_idx,
                notifier: Some(Arc::new(LoopNotifier { link: Arc::clone(&self.link), to: peer })),
            })?);
        }
        let registry = &self.link.callbacks[Link::side(self.role)];
        for (i, cb) in callbacks.into_iter().enumerate() {
            if let Some(cb) = cb {
                registry.register(i as u32, cb);
            }
        }
        Ok(vqs)
    }

    fn delete_virtqueues(&self) {
        self.link.callbacks[Link::side(self.role)].clear();
    }

    fn notified(&self, notify_id: u32) {
        self.link.callbacks[Link::side(self.role)].dispatch(notify_id);
    }
}

/// Both ends of a fresh link with `num`-entry rings.
pub fn link(num: u16, features: u64) -> (Arc<LoopDevice>, Arc<LoopDevice>) {
    assert!(vring_size(num, RING_ALIGN) <= RING_SPACING);
    let link = Arc::new(Link {
        io: IoRegion::heap(SHM_PHYS, SHM_SIZE),
        num,
        status: AtomicU8::new(0),
        offered: features,
        accepted: AtomicU64::new(0),
        callbacks: [VqCallbacks::default(), VqCallbacks::default()],
        kicks: AtomicUsize::new(0),
    });
    let driver = Arc::new(LoopDevice { link: Arc::clone(&link), role: Role::Driver });
    let device = Arc::new(LoopDevice { link, role: Role::Device });
    (driver, device)
}

pub fn default_features() -> u64 {
    (1 << VIRTIO_RPMSG_F_NS) | (1 << VIRTIO_RPMSG_F_FC)
}

/// The buffer pool behind the rings, `size` bytes long.
pub fn pool(dev: &LoopDevice, size: usize) -> ShmPool {
    ShmPool::new(dev.link.io.clone(), POOL_OFFSET, size).expect("pool fits")
}

/// A host (driver) and a remote (device) channel with default settings.
pub fn pair() -> (RpmsgDevice, RpmsgDevice) {
    let (drv, dev) = link(8, default_features());
    let host = RpmsgDevice::builder(drv.clone())
        .pool(pool(&drv, 0x4000))
        .init()
        .expect("host init");
    let remote = RpmsgDevice::builder(dev).init().expect("remote init");
    (host, remote)
}
