// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The transport-independent virtio device contract.

use std::sync::Arc;

use amp_hal::IoError;
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::status::DeviceStatus;
use crate::virtqueue::{VqError, Virtqueue};
use crate::Role;

/// Virtio device id: network card.
pub const VIRTIO_ID_NET: u32 = 1;
/// Virtio device id: block device.
pub const VIRTIO_ID_BLOCK: u32 = 2;
/// Virtio device id: console.
pub const VIRTIO_ID_CONSOLE: u32 = 3;
/// Virtio device id: entropy source.
pub const VIRTIO_ID_ENTROPY: u32 = 4;
/// Virtio device id: rpmsg.
pub const VIRTIO_ID_RPMSG: u32 = 7;

/// Device signals even when the available ring is empty.
pub const VIRTIO_F_NOTIFY_ON_EMPTY: u64 = 1 << 24;
/// Indirect descriptor tables.
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 1 << 28;
/// `used_event`/`avail_event` notification suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;
/// Virtio 1.0 compliance.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Errors raised by virtio transports.
#[derive(Debug, Error)]
pub enum VirtioError {
    /// The MMIO magic register did not read "virt".
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    /// Unknown MMIO transport version.
    #[error("unsupported transport version {0}")]
    UnsupportedVersion(u32),
    /// Probed device id differs from the expected one.
    #[error("unexpected device id {found} (expected {expected})")]
    UnexpectedDevice {
        /// Id the caller asked for.
        expected: u32,
        /// Id the device reported.
        found: u32,
    },
    /// Queue does not exist or is already live.
    #[error("queue {0} unavailable")]
    QueueUnavailable(u16),
    /// Queue is smaller than requested.
    #[error("queue {index} supports {max} entries, {wanted} requested")]
    QueueTooSmall {
        /// Queue index.
        index: u16,
        /// Device maximum.
        max: u32,
        /// Requested size.
        wanted: u16,
    },
    /// `create_virtqueues` was called with the wrong number of queues.
    #[error("device expects {expected} queues, {got} requested")]
    QueueCount {
        /// Queues the device exposes.
        expected: usize,
        /// Queues requested.
        got: usize,
    },
    /// The device cleared FEATURES_OK.
    #[error("device rejected features")]
    FeaturesRejected,
    /// Status change violates the virtio state machine.
    #[error("illegal status change {from:?} -> {to:?}")]
    InvalidStatus {
        /// Current status.
        from: DeviceStatus,
        /// Requested status.
        to: DeviceStatus,
    },
    /// Operation is not meaningful for this role/transport.
    #[error("operation not supported for this role")]
    NotSupported,
    /// Config access out of range.
    #[error("config access out of range")]
    ConfigRange,
    /// Config generation kept changing; no consistent snapshot was read.
    #[error("config space kept changing during read")]
    ConfigUnstable,
    /// Ring setup failed.
    #[error(transparent)]
    Vq(#[from] VqError),
    /// Shared memory access failed.
    #[error(transparent)]
    Io(#[from] IoError),
}

impl VirtioError {
    /// Flat negative error code (virtqueue range).
    pub fn code(&self) -> i32 {
        match self {
            VirtioError::Vq(e) => e.code(),
            VirtioError::Io(_) => VqError::NoMem.code(),
            VirtioError::QueueTooSmall { .. } => VqError::MaxDesc.code(),
            _ => VqError::InvalidParam.code(),
        }
    }
}

/// Callback invoked when a queue is notified.
pub type VqCallback = Arc<dyn Fn() + Send + Sync>;

/// Identification of a probed device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId {
    /// Virtio device type (`VIRTIO_ID_*`).
    pub device: u32,
    /// Vendor id.
    pub vendor: u32,
    /// Transport version (1 legacy, 2 modern; 0 when not applicable).
    pub version: u32,
}

/// One virtio device, as seen by a driver or a device implementation.
pub trait VirtioDevice: Send + Sync {
    /// Side of the protocol this handle implements.
    fn role(&self) -> Role;
    /// Device identification.
    fn id(&self) -> DeviceId;
    /// Current status byte.
    fn status(&self) -> DeviceStatus;
    /// Writes the status byte.
    fn set_status(&self, status: DeviceStatus) -> Result<(), VirtioError>;
    /// Features the device offers.
    fn device_features(&self) -> u64;
    /// Negotiated features.
    fn features(&self) -> u64;
    /// Records the accepted feature set.
    fn set_features(&self, features: u64) -> Result<(), VirtioError>;
    /// Reads device config space.
    fn read_config(&self, offset: usize, dst: &mut [u8]) -> Result<(), VirtioError>;
    /// Writes device config space.
    fn write_config(&self, offset: usize, src: &[u8]) -> Result<(), VirtioError>;
    /// Returns the device to RESET.
    fn reset(&self);
    /// Number of queues the device exposes.
    fn vring_count(&self) -> usize;
    /// Builds exactly `vring_count()` queues and registers their callbacks.
    fn create_virtqueues(
        &self,
        names: &[&str],
        callbacks: Vec<Option<VqCallback>>,
    ) -> Result<Vec<Virtqueue>, VirtioError>;
    /// Drops all registered queue callbacks.
    fn delete_virtqueues(&self);
    /// Dispatches an incoming notification to the queue registered under `notify_id`.
    fn notified(&self, notify_id: u32);
}

/// Runs ACKNOWLEDGE, DRIVER, feature negotiation and FEATURES_OK.
///
/// Returns the accepted feature set. On rejection FAILED is raised.
pub fn negotiate(dev: &dyn VirtioDevice, driver_features: u64) -> Result<u64, VirtioError> {
    if dev.role() != Role::Driver {
        return Err(VirtioError::NotSupported);
    }
    dev.set_status(DeviceStatus::ACKNOWLEDGE)?;
    let base = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
    dev.set_status(base)?;
    let accepted = driver_features & dev.device_features();
    dev.set_features(accepted)?;
    dev.set_status(base | DeviceStatus::FEATURES_OK)?;
    if !dev.status().contains(DeviceStatus::FEATURES_OK) {
        warn!("virtio: device rejected features {accepted:#x}");
        dev.set_status(base | DeviceStatus::FAILED)?;
        return Err(VirtioError::FeaturesRejected);
    }
    debug!("virtio: negotiated features {accepted:#x}");
    Ok(accepted)
}

/// Raises DRIVER_OK on top of the current status.
pub fn set_driver_ok(dev: &dyn VirtioDevice) -> Result<(), VirtioError> {
    dev.set_status(dev.status() | DeviceStatus::DRIVER_OK)
}

/// Queue callbacks keyed by notification id.
///
/// Callbacks run without the registry lock held, so they may re-enter the transport.
#[derive(Default)]
pub struct VqCallbacks {
    slots: Mutex<Vec<(u32, VqCallback)>>,
}

impl VqCallbacks {
    /// Registers (or replaces) the callback for `notify_id`.
    pub fn register(&self, notify_id: u32, callback: VqCallback) {
        let mut slots = self.slots.lock();
        slots.retain(|(id, _)| *id != notify_id);
        slots.push((notify_id, callback));
    }

    /// Removes every callback.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Runs the callback for `notify_id`. Returns false if none is registered.
    pub fn dispatch(&self, notify_id: u32) -> bool {
        let callback = self
            .slots
            .lock()
            .iter()
            .find(|(id, _)| *id == notify_id)
            .map(|(_, cb)| Arc::clone(cb));
        match callback {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    /// Runs every callback; used when a shared interrupt line cannot tell queues apart.
    pub fn dispatch_all(&self) -> usize {
        let callbacks: Vec<VqCallback> =
            self.slots.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for cb in &callbacks {
            cb();
        }
        callbacks.len()
    }
}
