// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtio device backed by a vdev resource-table entry.
//!
//! Status, features and config space live in the table itself, which both
//! processors see; every change is followed by a notification on the vdev's
//! own notify id. Queue notifications use the per-vring ids.

use std::sync::Arc;

use amp_hal::{IoRegion, Notifier};
use amp_virtio::{
    DeviceId, DeviceStatus, Role, VirtioDevice, VirtioError, VqCallback, VqCallbacks, Virtqueue,
    VirtqueueConfig, VIRTIO_RING_F_EVENT_IDX,
};
use log::{debug, trace};

use crate::mem::Mapping;
use crate::rsc::{VdevRsc, RSC_NOTIFY_ID_ANY, VDEV_DFEATURES, VDEV_GFEATURES, VDEV_STATUS};

pub(crate) struct Vring {
    pub(crate) notify_id: u32,
    pub(crate) num: u16,
    pub(crate) align: u32,
    pub(crate) map: Mapping,
}

/// A virtio device whose control state is a vdev entry in shared memory.
pub struct RprocVirtio {
    role: Role,
    device_id: u32,
    notify_id: u32,
    rsc: IoRegion,
    entry: usize,
    config: usize,
    config_len: usize,
    vrings: Vec<Vring>,
    notifier: Arc<dyn Notifier>,
    callbacks: VqCallbacks,
}

impl RprocVirtio {
    pub(crate) fn new(
        role: Role,
        rsc: IoRegion,
        entry: usize,
        vdev: &VdevRsc,
        vrings: Vec<Vring>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        debug!(
            "rproc-virtio: vdev {} (notify id {}) as {role:?}, {} vrings",
            vdev.id,
            vdev.notifyid,
            vrings.len()
        );
        Self {
            role,
            device_id: vdev.id,
            notify_id: vdev.notifyid,
            config: entry + vdev.config_offset(),
            config_len: vdev.config_len as usize,
            rsc,
            entry,
            vrings,
            notifier,
            callbacks: VqCallbacks::default(),
        }
    }

    /// Notification id of the device itself.
    pub fn notify_id(&self) -> u32 {
        self.notify_id
    }

    /// Notification ids of the vrings, in queue order.
    pub fn vring_notify_ids(&self) -> Vec<u32> {
        self.vrings.iter().map(|v| v.notify_id).collect()
    }

    fn read_u32(&self, field: usize) -> u32 {
        self.rsc.invalidate(self.entry + field, 4);
        self.rsc.read32(self.entry + field)
    }

    fn write_u32(&self, field: usize, value: u32) {
        self.rsc.write32(self.entry + field, value);
        self.rsc.flush(self.entry + field, 4);
    }

    fn write_status(&self, status: DeviceStatus) {
        self.rsc.write8(self.entry + VDEV_STATUS, status.bits());
        self.rsc.flush(self.entry + VDEV_STATUS, 1);
        self.notifier.notify(self.notify_id);
    }

    fn config_range(&self, offset: usize, len: usize) -> Result<usize, VirtioError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.config_len => Ok(self.config + offset),
            _ => Err(VirtioError::ConfigRange),
        }
    }
}

impl VirtioDevice for RprocVirtio {
    fn role(&self) -> Role {
        self.role
    }

    fn id(&self) -> DeviceId {
        DeviceId { device: self.device_id, vendor: 0, version: 0 }
    }

    fn status(&self) -> DeviceStatus {
        self.rsc.invalidate(self.entry + VDEV_STATUS, 1);
        DeviceStatus::from_bits_retain(self.rsc.read8(self.entry + VDEV_STATUS))
    }

    fn set_status(&self, status: DeviceStatus) -> Result<(), VirtioError> {
        let from = self.status();
        let legal = match self.role {
            Role::Driver => from.can_transition_to(status),
            Role::Device => status == from | DeviceStatus::NEEDS_RESET,
        };
        if !legal {
            return Err(match self.role {
                Role::Driver => VirtioError::InvalidStatus { from, to: status },
                Role::Device => VirtioError::NotSupported,
            });
        }
        self.write_status(status);
        Ok(())
    }

    fn device_features(&self) -> u64 {
        self.read_u32(VDEV_DFEATURES) as u64
    }

    fn features(&self) -> u64 {
        (self.read_u32(VDEV_DFEATURES) & self.read_u32(VDEV_GFEATURES)) as u64
    }

    fn set_features(&self, features: u64) -> Result<(), VirtioError> {
        if self.role != Role::Driver {
            return Err(VirtioError::NotSupported);
        }
        self.write_u32(VDEV_GFEATURES, features as u32);
        self.notifier.notify(self.notify_id);
        Ok(())
    }

    fn read_config(&self, offset: usize, dst: &mut [u8]) -> Result<(), VirtioError> {
        let at = self.config_range(offset, dst.len())?;
        self.rsc.invalidate(at, dst.len());
        self.rsc.block_read(at, dst)?;
        Ok(())
    }

    fn write_config(&self, offset: usize, src: &[u8]) -> Result<(), VirtioError> {
        let at = self.config_range(offset, src.len())?;
        self.rsc.block_write(at, src)?;
        self.rsc.flush(at, src.len());
        self.notifier.notify(self.notify_id);
        Ok(())
    }

    fn reset(&self) {
        match self.role {
            Role::Driver => self.write_status(DeviceStatus::RESET),
            Role::Device => self.write_status(self.status() | DeviceStatus::NEEDS_RESET),
        }
    }

    fn vring_count(&self) -> usize {
        self.vrings.len()
    }

    fn create_virtqueues(
        &self,
        names: &[&str],
        callbacks: Vec<Option<VqCallback>>,
    ) -> Result<Vec<Virtqueue>, VirtioError> {
        if names.len() != self.vrings.len() || callbacks.len() != names.len() {
            return Err(VirtioError::QueueCount { expected: self.vrings.len(), got: names.len() });
        }
        let event_idx = self.features() & VIRTIO_RING_F_EVENT_IDX != 0;
        let mut vqs = Vec::with_capacity(names.len());
        for (i, (name, ring)) in names.iter().zip(&self.vrings).enumerate() {
            vqs.push(Virtqueue::new(VirtqueueConfig {
                name: (*name).to_owned(),
                index: i as u16,
                notify_id: ring.notify_id,
                num: ring.num,
                align: ring.align,
                io: ring.map.io.clone(),
                offset: ring.map.offset,
                role: self.role,
                event_idx,
                notifier: Some(Arc::clone(&self.notifier)),
            })?);
        }
        for (ring, cb) in self.vrings.iter().zip(callbacks) {
            if let Some(cb) = cb {
                self.callbacks.register(ring.notify_id, cb);
            }
        }
        Ok(vqs)
    }

    fn delete_virtqueues(&self) {
        self.callbacks.clear();
    }

    fn notified(&self, notify_id: u32) {
        if notify_id == self.notify_id {
            trace!("rproc-virtio: vdev {} config/status notification", self.notify_id);
        } else if notify_id == RSC_NOTIFY_ID_ANY {
            self.callbacks.dispatch_all();
        } else {
            self.callbacks.dispatch(notify_id);
        }
    }
}
