// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: virtio-mmio transport binding for AMP shared-memory virtqueues
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host) over a banked register-file mock
//!
//! PUBLIC API:
//! - `VirtioMmio`: `VirtioDevice` over a virtio-mmio control register block
//! - `MmioConfig` / `QueuePlan`: role, expected device and vring placement
//! - `InterruptStatus`: decoded interrupt-status bits
//!
//! NOTE:
//! - DRIVER role probes, negotiates and programs queues; DEVICE role publishes its
//!   identity and discovers queues from what the driver programmed.
//! - One interrupt line serves every queue; `handle_interrupt` fans out to all of them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::sync::Arc;

use amp_hal::{Bus, IoRegion, Notifier};
use amp_virtio::{
    DeviceId, DeviceStatus, Role, VirtioDevice, VirtioError, VqCallback, VqCallbacks, VqError,
    Virtqueue, VirtqueueConfig, VringLayout, VIRTIO_RING_F_EVENT_IDX,
};
use bitflags::bitflags;
use log::{debug, info, warn};
use parking_lot::Mutex;

/// VirtIO MMIO magic ("virt" LE).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
/// VirtIO MMIO legacy version.
pub const VIRTIO_MMIO_VERSION_LEGACY: u32 = 1;
/// VirtIO MMIO modern version.
pub const VIRTIO_MMIO_VERSION_MODERN: u32 = 2;
/// Page size used for legacy PFN programming.
pub const LEGACY_PAGE_SIZE: u32 = 4096;

// VirtIO MMIO register offsets (bytes).
const REG_MAGIC: usize = 0x000;
const REG_VERSION: usize = 0x004;
const REG_DEVICE_ID: usize = 0x008;
const REG_VENDOR_ID: usize = 0x00c;
const REG_DEVICE_FEATURES: usize = 0x010;
const REG_DEVICE_FEATURES_SEL: usize = 0x014;
const REG_DRIVER_FEATURES: usize = 0x020;
const REG_DRIVER_FEATURES_SEL: usize = 0x024;
const REG_GUEST_PAGE_SIZE: usize = 0x028; // legacy only
const REG_QUEUE_SEL: usize = 0x030;
const REG_QUEUE_NUM_MAX: usize = 0x034;
const REG_QUEUE_NUM: usize = 0x038;
const REG_QUEUE_ALIGN: usize = 0x03c; // legacy only
const REG_QUEUE_PFN: usize = 0x040; // legacy only
const REG_QUEUE_READY: usize = 0x044;
const REG_QUEUE_NOTIFY: usize = 0x050;
const REG_INTERRUPT_STATUS: usize = 0x060;
const REG_INTERRUPT_ACK: usize = 0x064;
const REG_STATUS: usize = 0x070;

const REG_QUEUE_DESC_LOW: usize = 0x080;
const REG_QUEUE_DRIVER_LOW: usize = 0x090;
const REG_QUEUE_DEVICE_LOW: usize = 0x0a0;
const REG_CONFIG_GENERATION: usize = 0x0fc;
const REG_CONFIG: usize = 0x100;

const CONFIG_SPACE_SIZE: usize = 0x100;
const CONFIG_READ_RETRIES: usize = 8;

bitflags! {
    /// Interrupt-status register bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        /// A used ring was updated.
        const VRING = 1 << 0;
        /// Configuration space changed.
        const CONFIG = 1 << 1;
    }
}

/// Placement of one vring inside the shared region (DRIVER role).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuePlan {
    /// Number of descriptors.
    pub num: u16,
    /// Offset of the descriptor table in the shared region.
    pub offset: usize,
}

/// Binding parameters.
pub struct MmioConfig {
    /// Device id the driver insists on; DEVICE role publishes it.
    pub device_id: u32,
    /// Vendor id published by the DEVICE role.
    pub vendor_id: u32,
    /// Transport version published by the DEVICE role.
    pub version: u32,
    /// Features offered by the DEVICE role.
    pub device_features: u64,
    /// Queue geometry; the DEVICE role only uses `num` as QUEUE_NUM_MAX.
    pub queues: Vec<QueuePlan>,
    /// Used-ring alignment.
    pub align: u32,
    /// Platform interrupt towards the driver (DEVICE role).
    pub irq: Option<Arc<dyn Notifier>>,
}

struct QueueNotify<B> {
    bus: Arc<B>,
}

impl<B: Bus + Send + Sync> Notifier for QueueNotify<B> {
    fn notify(&self, id: u32) {
        self.bus.write(REG_QUEUE_NOTIFY, id);
    }
}

struct RaiseInterrupt<B> {
    bus: Arc<B>,
    bits: InterruptStatus,
    irq: Option<Arc<dyn Notifier>>,
}

impl<B: Bus + Send + Sync> Notifier for RaiseInterrupt<B> {
    fn notify(&self, id: u32) {
        let st = self.bus.read(REG_INTERRUPT_STATUS);
        self.bus.write(REG_INTERRUPT_STATUS, st | self.bits.bits());
        if let Some(irq) = &self.irq {
            irq.notify(id);
        }
    }
}

/// A virtio-mmio device handle.
///
/// `bus.read/write(offset)` addresses are interpreted as **MMIO register offsets**.
pub struct VirtioMmio<B: Bus + Send + Sync + 'static> {
    bus: Arc<B>,
    role: Role,
    shm: IoRegion,
    id: DeviceId,
    offered: u64,
    negotiated: Mutex<u64>,
    queues: Vec<QueuePlan>,
    align: u32,
    irq: Option<Arc<dyn Notifier>>,
    callbacks: VqCallbacks,
    config_cb: Mutex<Option<VqCallback>>,
}

impl<B: Bus + Send + Sync + 'static> VirtioMmio<B> {
    /// DRIVER role: validates magic, version and device id.
    pub fn probe(bus: Arc<B>, shm: IoRegion, cfg: MmioConfig) -> Result<Self, VirtioError> {
        let magic = bus.read(REG_MAGIC);
        if magic != VIRTIO_MMIO_MAGIC {
            return Err(VirtioError::BadMagic(magic));
        }
        let version = bus.read(REG_VERSION);
        if version != VIRTIO_MMIO_VERSION_LEGACY && version != VIRTIO_MMIO_VERSION_MODERN {
            return Err(VirtioError::UnsupportedVersion(version));
        }
        let device = bus.read(REG_DEVICE_ID);
        if device != cfg.device_id {
            return Err(VirtioError::UnexpectedDevice { expected: cfg.device_id, found: device });
        }
        let vendor = bus.read(REG_VENDOR_ID);
        info!("virtio-mmio: probed device {device} vendor {vendor:#x} v{version}");
        Ok(Self::build(bus, shm, cfg, Role::Driver, DeviceId { device, vendor, version }))
    }

    /// DEVICE role: publishes identity, offered features and queue limits.
    pub fn publish(bus: Arc<B>, shm: IoRegion, cfg: MmioConfig) -> Result<Self, VirtioError> {
        if cfg.version != VIRTIO_MMIO_VERSION_LEGACY && cfg.version != VIRTIO_MMIO_VERSION_MODERN
        {
            return Err(VirtioError::UnsupportedVersion(cfg.version));
        }
        bus.write(REG_MAGIC, VIRTIO_MMIO_MAGIC);
        bus.write(REG_VERSION, cfg.version);
        bus.write(REG_DEVICE_ID, cfg.device_id);
        bus.write(REG_VENDOR_ID, cfg.vendor_id);
        bus.write(REG_DEVICE_FEATURES_SEL, 0);
        bus.write(REG_DEVICE_FEATURES, cfg.device_features as u32);
        bus.write(REG_DEVICE_FEATURES_SEL, 1);
        bus.write(REG_DEVICE_FEATURES, (cfg.device_features >> 32) as u32);
        for (index, queue) in cfg.queues.iter().enumerate() {
            bus.write(REG_QUEUE_SEL, index as u32);
            bus.write(REG_QUEUE_NUM_MAX, queue.num as u32);
        }
        bus.write(REG_STATUS, 0);
        let id = DeviceId { device: cfg.device_id, vendor: cfg.vendor_id, version: cfg.version };
        Ok(Self::build(bus, shm, cfg, Role::Device, id))
    }

    fn build(bus: Arc<B>, shm: IoRegion, cfg: MmioConfig, role: Role, id: DeviceId) -> Self {
        Self {
            bus,
            role,
            shm,
            id,
            offered: cfg.device_features,
            negotiated: Mutex::new(0),
            queues: cfg.queues,
            align: cfg.align,
            irq: cfg.irq,
            callbacks: VqCallbacks::default(),
            config_cb: Mutex::new(None),
        }
    }

    /// Installs the configuration-change callback.
    pub fn set_config_callback(&self, callback: VqCallback) {
        *self.config_cb.lock() = Some(callback);
    }

    /// DRIVER-side ISR: acknowledges pending bits and fans out to every queue callback.
    pub fn handle_interrupt(&self) -> InterruptStatus {
        let status = InterruptStatus::from_bits_truncate(self.bus.read(REG_INTERRUPT_STATUS));
        if status.is_empty() {
            return status;
        }
        self.bus.write(REG_INTERRUPT_ACK, status.bits());
        if status.contains(InterruptStatus::VRING) {
            self.callbacks.dispatch_all();
        }
        if status.contains(InterruptStatus::CONFIG) {
            let cb = self.config_cb.lock().clone();
            match cb {
                Some(cb) => cb(),
                None => debug!("virtio-mmio: config change without handler"),
            }
        }
        status
    }

    /// DEVICE-side doorbell handler: dispatches the queue named in QUEUE_NOTIFY.
    pub fn handle_queue_notify(&self) {
        let index = self.bus.read(REG_QUEUE_NOTIFY);
        if !self.callbacks.dispatch(index) {
            debug!("virtio-mmio: notify for unregistered queue {index}");
        }
    }

    fn read_features(&self, sel_reg: usize, reg: usize) -> u64 {
        self.bus.write(sel_reg, 0);
        let lo = self.bus.read(reg);
        self.bus.write(sel_reg, 1);
        let hi = self.bus.read(reg);
        (lo as u64) | ((hi as u64) << 32)
    }

    fn config_byte(&self, offset: usize) -> u8 {
        let word = self.bus.read(REG_CONFIG + (offset & !3));
        (word >> ((offset & 3) * 8)) as u8
    }

    fn check_config(offset: usize, len: usize) -> Result<(), VirtioError> {
        match offset.checked_add(len) {
            Some(end) if end <= CONFIG_SPACE_SIZE => Ok(()),
            _ => Err(VirtioError::ConfigRange),
        }
    }

    fn setup_driver_queue(
        &self,
        index: u16,
        name: &str,
        plan: QueuePlan,
        event_idx: bool,
    ) -> Result<Virtqueue, VirtioError> {
        self.bus.write(REG_QUEUE_SEL, index as u32);
        if self.id.version == VIRTIO_MMIO_VERSION_MODERN && self.bus.read(REG_QUEUE_READY) != 0 {
            return Err(VirtioError::QueueUnavailable(index));
        }
        let max = self.bus.read(REG_QUEUE_NUM_MAX);
        if max == 0 {
            return Err(VirtioError::QueueUnavailable(index));
        }
        if plan.num as u32 > max {
            return Err(VirtioError::QueueTooSmall { index, max, wanted: plan.num });
        }
        let vq = Virtqueue::new(VirtqueueConfig {
            name: name.to_string(),
            index,
            notify_id: index as u32,
            num: plan.num,
            align: self.align,
            io: self.shm.clone(),
            offset: plan.offset,
            role: Role::Driver,
            event_idx,
            notifier: Some(Arc::new(QueueNotify { bus: Arc::clone(&self.bus) })),
        })?;
        let (desc, avail, used) = vq.ring_phys().ok_or(VqError::NoMem)?;
        self.bus.write(REG_QUEUE_NUM, plan.num as u32);
        if self.id.version == VIRTIO_MMIO_VERSION_MODERN {
            write_u64_mmio(&*self.bus, REG_QUEUE_DESC_LOW, desc);
            write_u64_mmio(&*self.bus, REG_QUEUE_DRIVER_LOW, avail);
            write_u64_mmio(&*self.bus, REG_QUEUE_DEVICE_LOW, used);
            self.bus.write(REG_QUEUE_READY, 1);
        } else {
            if desc % LEGACY_PAGE_SIZE as u64 != 0 {
                return Err(VqError::Align.into());
            }
            // Legacy virtio-mmio requires the guest page size register to interpret PFNs.
            self.bus.write(REG_GUEST_PAGE_SIZE, LEGACY_PAGE_SIZE);
            self.bus.write(REG_QUEUE_ALIGN, self.align);
            self.bus.write(REG_QUEUE_PFN, (desc / LEGACY_PAGE_SIZE as u64) as u32);
        }
        Ok(vq)
    }

    fn discover_device_queue(
        &self,
        index: u16,
        name: &str,
        event_idx: bool,
    ) -> Result<Virtqueue, VirtioError> {
        self.bus.write(REG_QUEUE_SEL, index as u32);
        let num = self.bus.read(REG_QUEUE_NUM);
        let num = u16::try_from(num).map_err(|_| VqError::MaxDesc)?;
        let layout = VringLayout::new(num, self.align)?;
        let desc = if self.id.version == VIRTIO_MMIO_VERSION_MODERN {
            if self.bus.read(REG_QUEUE_READY) == 0 {
                return Err(VirtioError::QueueUnavailable(index));
            }
            let desc = read_u64_mmio(&*self.bus, REG_QUEUE_DESC_LOW);
            let avail = read_u64_mmio(&*self.bus, REG_QUEUE_DRIVER_LOW);
            let used = read_u64_mmio(&*self.bus, REG_QUEUE_DEVICE_LOW);
            if avail != desc + layout.avail as u64 || used != desc + layout.used as u64 {
                warn!("virtio-mmio: queue {index} rings are not contiguous");
                return Err(VirtioError::NotSupported);
            }
            desc
        } else {
            let pfn = self.bus.read(REG_QUEUE_PFN);
            if pfn == 0 {
                return Err(VirtioError::QueueUnavailable(index));
            }
            pfn as u64 * self.bus.read(REG_GUEST_PAGE_SIZE) as u64
        };
        let offset = self.shm.phys_to_offset(desc).ok_or(VqError::NoMem)?;
        let notifier = RaiseInterrupt {
            bus: Arc::clone(&self.bus),
            bits: InterruptStatus::VRING,
            irq: self.irq.clone(),
        };
        Ok(Virtqueue::new(VirtqueueConfig {
            name: name.to_string(),
            index,
            notify_id: index as u32,
            num,
            align: self.align,
            io: self.shm.clone(),
            offset,
            role: Role::Device,
            event_idx,
            notifier: Some(Arc::new(notifier)),
        })?)
    }
}

impl<B: Bus + Send + Sync + 'static> VirtioDevice for VirtioMmio<B> {
    fn role(&self) -> Role {
        self.role
    }

    fn id(&self) -> DeviceId {
        self.id
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.bus.read(REG_STATUS) as u8)
    }

    fn set_status(&self, status: DeviceStatus) -> Result<(), VirtioError> {
        let from = self.status();
        match self.role {
            Role::Driver => {
                if !from.can_transition_to(status) {
                    return Err(VirtioError::InvalidStatus { from, to: status });
                }
                self.bus.write(REG_STATUS, status.bits() as u32);
                Ok(())
            }
            // The device side may only flag that it needs a reset.
            Role::Device if status == from | DeviceStatus::NEEDS_RESET => {
                self.bus.write(REG_STATUS, status.bits() as u32);
                RaiseInterrupt {
                    bus: Arc::clone(&self.bus),
                    bits: InterruptStatus::CONFIG,
                    irq: self.irq.clone(),
                }
                .notify(0);
                Ok(())
            }
            Role::Device => Err(VirtioError::NotSupported),
        }
    }

    fn device_features(&self) -> u64 {
        match self.role {
            Role::Driver => self.read_features(REG_DEVICE_FEATURES_SEL, REG_DEVICE_FEATURES),
            Role::Device => self.offered,
        }
    }

    fn features(&self) -> u64 {
        match self.role {
            Role::Driver => *self.negotiated.lock(),
            Role::Device => {
                self.read_features(REG_DRIVER_FEATURES_SEL, REG_DRIVER_FEATURES) & self.offered
            }
        }
    }

    fn set_features(&self, features: u64) -> Result<(), VirtioError> {
        if self.role != Role::Driver {
            return Err(VirtioError::NotSupported);
        }
        self.bus.write(REG_DRIVER_FEATURES_SEL, 0);
        self.bus.write(REG_DRIVER_FEATURES, features as u32);
        self.bus.write(REG_DRIVER_FEATURES_SEL, 1);
        self.bus.write(REG_DRIVER_FEATURES, (features >> 32) as u32);
        *self.negotiated.lock() = features;
        Ok(())
    }

    fn read_config(&self, offset: usize, dst: &mut [u8]) -> Result<(), VirtioError> {
        Self::check_config(offset, dst.len())?;
        for _ in 0..CONFIG_READ_RETRIES {
            let generation = self.bus.read(REG_CONFIG_GENERATION);
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = self.config_byte(offset + i);
            }
            if self.bus.read(REG_CONFIG_GENERATION) == generation {
                return Ok(());
            }
        }
        warn!("virtio-mmio: config kept changing during read");
        Err(VirtioError::ConfigUnstable)
    }

    fn write_config(&self, offset: usize, src: &[u8]) -> Result<(), VirtioError> {
        Self::check_config(offset, src.len())?;
        for (i, byte) in src.iter().enumerate() {
            let off = offset + i;
            let reg = REG_CONFIG + (off & !3);
            let shift = (off & 3) * 8;
            let word = self.bus.read(reg) & !(0xff << shift);
            self.bus.write(reg, word | ((*byte as u32) << shift));
        }
        Ok(())
    }

    fn reset(&self) {
        match self.role {
            Role::Driver => self.bus.write(REG_STATUS, 0),
            Role::Device => warn!("virtio-mmio: device side cannot reset the transport"),
        }
    }

    fn vring_count(&self) -> usize {
        self.queues.len()
    }

    fn create_virtqueues(
        &self,
        names: &[&str],
        callbacks: Vec<Option<VqCallback>>,
    ) -> Result<Vec<Virtqueue>, VirtioError> {
        if names.len() != self.queues.len() || callbacks.len() != names.len() {
            return Err(VirtioError::QueueCount {
                expected: self.queues.len(),
                got: names.len(),
            });
        }
        let event_idx = self.features() & VIRTIO_RING_F_EVENT_IDX != 0;
        let mut vqs = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let index = i as u16;
            let vq = match self.role {
                Role::Driver => self.setup_driver_queue(index, name, self.queues[i], event_idx),
                Role::Device => self.discover_device_queue(index, name, event_idx),
            };
            match vq {
                Ok(vq) => vqs.push(vq),
                Err(err) => {
                    self.delete_virtqueues();
                    return Err(err);
                }
            }
        }
        for (i, cb) in callbacks.into_iter().enumerate() {
            if let Some(cb) = cb {
                self.callbacks.register(i as u32, cb);
            }
        }
        Ok(vqs)
    }

    fn delete_virtqueues(&self) {
        if self.role == Role::Driver {
            for index in 0..self.queues.len() {
                self.bus.write(REG_QUEUE_SEL, index as u32);
                if self.id.version == VIRTIO_MMIO_VERSION_MODERN {
                    self.bus.write(REG_QUEUE_READY, 0);
                } else {
                    self.bus.write(REG_QUEUE_PFN, 0);
                }
            }
        }
        self.callbacks.clear();
    }

    fn notified(&self, notify_id: u32) {
        self.callbacks.dispatch(notify_id);
    }
}

fn write_u64_mmio<B: Bus + ?Sized>(bus: &B, low_reg: usize, value: u64) {
    let lo = (value & 0xffff_ffff) as u32;
    let hi = (value >> 32) as u32;
    bus.write(low_reg, lo);
    bus.write(low_reg + 4, hi);
}

fn read_u64_mmio<B: Bus + ?Sized>(bus: &B, low_reg: usize) -> u64 {
    (bus.read(low_reg) as u64) | ((bus.read(low_reg + 4) as u64) << 32)
}
