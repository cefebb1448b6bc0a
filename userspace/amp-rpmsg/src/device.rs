// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One rpmsg channel over a two-queue virtio device
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/transport.rs, tests/nocopy.rs
//!
//! Queue assignment: vring 0 carries device-to-driver traffic, vring 1
//! driver-to-device. The driver provisions every buffer; the device only ever
//! borrows buffers the driver made available.
//!
//! Locking: one mutex guards the rings, the endpoint registry, the address
//! bitmap, the held table and the reclaimer. It is released before user
//! callbacks run, before the peer is kicked and between transmit polls.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use amp_hal::IoRegion;
use amp_virtio::{
    negotiate, set_driver_ok, DeviceStatus, Kick, Role, VirtioDevice, VqBuf, VqCallback,
    Virtqueue,
};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::addr::AddressBitmap;
use crate::budget::{poll_budgeted, Clock, HostClock};
use crate::buffer::{
    BufSlot, HeldRxBuffer, HeldTable, Reclaimer, Release, RxMessage, ShmPool, TxBuffer,
};
use crate::config::RpmsgConfig;
use crate::endpoint::{Endpoint, EndpointConfig, EndpointRef};
use crate::wire::{NsMessage, RpmsgHeader, RPMSG_HEADER_SIZE, RPMSG_NS_CREATE, RPMSG_NS_DESTROY};
use crate::{
    fc, ns, Error, Result, Wait, RPMSG_ADDR_ANY, RPMSG_NAME_SIZE, RPMSG_NS_EPT_ADDR,
    RPMSG_RESERVED_ADDRESSES, RPMSG_TX_POLL_INTERVAL, VIRTIO_RPMSG_F_FC, VIRTIO_RPMSG_F_NS,
};

/// Called when the remote side announces (or withdraws) a service that has no
/// local endpoint: `(device, name, remote address)`.
pub type NsBindCallback = Arc<dyn Fn(&RpmsgDevice, &str, u32) + Send + Sync>;
/// Called instead of sleeping while a send waits for a buffer, with the notify id
/// of the transmit queue. Returns false to fall back to sleeping.
pub type NotifyWaitCallback = Arc<dyn Fn(&RpmsgDevice, u32) -> bool + Send + Sync>;

struct State {
    live: bool,
    rvq: Virtqueue,
    svq: Virtqueue,
    tx_pool: Option<ShmPool>,
    endpoints: BTreeMap<u32, EndpointRef>,
    addrs: AddressBitmap,
    held: HeldTable,
    reclaimer: Reclaimer,
}

pub(crate) struct DeviceShared {
    this: Weak<DeviceShared>,
    vdev: Arc<dyn VirtioDevice>,
    role: Role,
    features: u64,
    io: IoRegion,
    txbuf_size: u32,
    rxbuf_size: u32,
    svq_notify_id: u32,
    clock: Arc<dyn Clock>,
    ns_bind: Option<NsBindCallback>,
    ns_unbind: Option<NsBindCallback>,
    notify_wait: Option<NotifyWaitCallback>,
    state: Mutex<State>,
}

/// Builder for `RpmsgDevice`.
pub struct RpmsgDeviceBuilder {
    vdev: Arc<dyn VirtioDevice>,
    pool: Option<ShmPool>,
    buffers: Option<IoRegion>,
    config: RpmsgConfig,
    features: u64,
    clock: Option<Arc<dyn Clock>>,
    ns_bind: Option<NsBindCallback>,
    ns_unbind: Option<NsBindCallback>,
    notify_wait: Option<NotifyWaitCallback>,
}

impl RpmsgDeviceBuilder {
    /// Shared buffer pool (driver role; required there).
    pub fn pool(mut self, pool: ShmPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Memory holding the buffers the driver hands out (device role). Defaults to
    /// the receive ring's region.
    pub fn buffer_region(mut self, io: IoRegion) -> Self {
        self.buffers = Some(io);
        self
    }

    /// Buffer sizing.
    pub fn config(mut self, config: RpmsgConfig) -> Self {
        self.config = config;
        self
    }

    /// rpmsg feature bits the driver offers (default: name service and flow control).
    pub fn features(mut self, features: u64) -> Self {
        self.features = features;
        self
    }

    /// Clock for transmit waits and the device-side ready poll.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Called for announced services with no local endpoint.
    pub fn on_ns_bind(
        mut self,
        cb: impl Fn(&RpmsgDevice, &str, u32) + Send + Sync + 'static,
    ) -> Self {
        self.ns_bind = Some(Arc::new(cb));
        self
    }

    /// Called for every withdrawn service.
    pub fn on_ns_unbind(
        mut self,
        cb: impl Fn(&RpmsgDevice, &str, u32) + Send + Sync + 'static,
    ) -> Self {
        self.ns_unbind = Some(Arc::new(cb));
        self
    }

    /// Platform hook used instead of sleeping while waiting for a transmit buffer.
    pub fn notify_wait(mut self, cb: impl Fn(&RpmsgDevice, u32) -> bool + Send + Sync + 'static) -> Self {
        self.notify_wait = Some(Arc::new(cb));
        self
    }

    /// Brings the channel up.
    ///
    /// Driver role: negotiates features, creates the queues, fills the receive
    /// queue from the pool and raises DRIVER_OK. Device role: waits for DRIVER_OK
    /// and creates the queues. Both register the name-service and flow-control
    /// endpoints when the feature bits are set.
    pub fn init(self) -> Result<RpmsgDevice> {
        let vdev = self.vdev;
        let role = vdev.role();
        self.config.validate().map_err(|e| {
            warn!("rpmsg: rejecting config: {e}");
            Error::Param
        })?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(HostClock::new()));

        let features = match role {
            Role::Driver => {
                if self.pool.is_none() {
                    return Err(Error::NoMem);
                }
                negotiate(&*vdev, self.features).map_err(|e| {
                    error!("rpmsg: feature negotiation failed: {e}");
                    Error::Init
                })?
            }
            Role::Device => {
                wait_driver_ok(&*vdev, &*clock)?;
                vdev.features()
            }
        };
        if vdev.vring_count() != 2 {
            return Err(Error::MaxVq);
        }

        let slot: Arc<OnceLock<Weak<DeviceShared>>> = Arc::default();
        let rx_cb: VqCallback = {
            let slot = Arc::clone(&slot);
            Arc::new(move || {
                if let Some(dev) = slot.get().and_then(Weak::upgrade) {
                    dev.handle_rx();
                }
            })
        };
        let (names, callbacks) = match role {
            Role::Driver => (["rx_vq", "tx_vq"], vec![Some(rx_cb), None]),
            Role::Device => (["tx_vq", "rx_vq"], vec![None, Some(rx_cb)]),
        };
        let mut vqs = vdev.create_virtqueues(&names, callbacks).map_err(|e| {
            error!("rpmsg: creating virtqueues failed: {e}");
            Error::Init
        })?;
        let (Some(vq1), Some(vq0), None) = (vqs.pop(), vqs.pop(), vqs.pop()) else {
            vdev.delete_virtqueues();
            return Err(Error::MaxVq);
        };
        let (mut rvq, svq) = match role {
            Role::Driver => (vq0, vq1),
            Role::Device => (vq1, vq0),
        };

        let (txbuf_size, rxbuf_size) = (self.config.h2r_buf_size, self.config.r2h_buf_size);
        let (io, tx_pool) = match role {
            Role::Driver => {
                let Some(pool) = self.pool else {
                    vdev.delete_virtqueues();
                    return Err(Error::NoMem);
                };
                let io = pool.io().clone();
                match fill_rx_ring(&mut rvq, pool, &self.config) {
                    Ok(tx_pool) => (io, Some(tx_pool)),
                    Err(e) => {
                        vdev.delete_virtqueues();
                        return Err(e);
                    }
                }
            }
            Role::Device => (self.buffers.unwrap_or_else(|| rvq.io().clone()), None),
        };

        let svq_notify_id = svq.notify_id();
        let shared = Arc::new_cyclic(|this| DeviceShared {
            this: this.clone(),
            vdev: Arc::clone(&vdev),
            role,
            features,
            io,
            txbuf_size,
            rxbuf_size,
            svq_notify_id,
            clock,
            ns_bind: self.ns_bind,
            ns_unbind: self.ns_unbind,
            notify_wait: self.notify_wait,
            state: Mutex::new(State {
                live: true,
                rvq,
                svq,
                tx_pool,
                endpoints: BTreeMap::new(),
                addrs: AddressBitmap::default(),
                held: HeldTable::default(),
                reclaimer: Reclaimer::default(),
            }),
        });
        let _ = slot.set(Arc::downgrade(&shared));

        let dev = RpmsgDevice { shared };
        if let Err(e) = dev.start() {
            dev.deinit();
            return Err(e);
        }
        info!("rpmsg: {role:?} up, features {features:#x}");
        Ok(dev)
    }
}

fn wait_driver_ok(vdev: &dyn VirtioDevice, clock: &dyn Clock) -> Result<()> {
    loop {
        let status = vdev.status();
        if status.intersects(DeviceStatus::FAILED | DeviceStatus::NEEDS_RESET) {
            return Err(Error::DevState);
        }
        if status.contains(DeviceStatus::DRIVER_OK) {
            return Ok(());
        }
        clock.yield_now();
    }
}

/// Publishes receive buffers and returns the pool transmit buffers come from.
fn fill_rx_ring(rvq: &mut Virtqueue, pool: ShmPool, cfg: &RpmsgConfig) -> Result<ShmPool> {
    let (rx_len, tx_len) = (cfg.r2h_buf_size as usize, cfg.h2r_buf_size as usize);
    let (mut tx_pool, mut rx_pool) = if cfg.split_shpool {
        let (tx, rx) = pool.split_half();
        (tx, Some(rx))
    } else {
        (pool, None)
    };
    // A shared pool keeps one transmit buffer in reserve per receive buffer.
    let count = match &rx_pool {
        Some(rx) => rx.available() / rx_len,
        None => tx_pool.available() / (rx_len + tx_len),
    }
    .min(rvq.num() as usize);
    if count == 0 {
        return Err(Error::NoBuffer);
    }
    for _ in 0..count {
        let pool = rx_pool.as_mut().unwrap_or(&mut tx_pool);
        let offset = pool.alloc(rx_len).ok_or(Error::NoBuffer)?;
        let io = pool.io().clone();
        io.block_set(offset, 0, rx_len).map_err(|_| Error::NoMem)?;
        let addr = io.offset_to_phys(offset).ok_or(Error::Param)?;
        rvq.add_buffer(&[VqBuf { addr, len: cfg.r2h_buf_size }], 0, 1, offset)
            .map_err(|_| Error::NoBuffer)?;
    }
    debug!("rpmsg: {count} rx buffers of {rx_len} bytes published");
    Ok(tx_pool)
}

/// Releases the dispatch loop's own reference to an rx buffer on every exit path.
struct RxGuard<'a> {
    dev: &'a DeviceShared,
    offset: usize,
}

impl Drop for RxGuard<'_> {
    fn drop(&mut self) {
        self.dev.release_rx(self.offset);
    }
}

impl DeviceShared {
    fn has_feature(&self, bit: u32) -> bool {
        self.features & (1u64 << bit) != 0
    }

    fn handle(&self) -> Option<RpmsgDevice> {
        self.this.upgrade().map(|shared| RpmsgDevice { shared })
    }

    pub(crate) fn buffer_io(&self) -> &IoRegion {
        &self.io
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.vdev.status().is_ready() || !self.state.lock().live {
            return Err(Error::DevState);
        }
        Ok(())
    }

    fn phys(&self, offset: usize) -> Result<u64> {
        self.io.offset_to_phys(offset).ok_or(Error::Param)
    }

    // Device side: turns a driver-supplied descriptor into a local buffer, or
    // hands it straight back when it points outside our buffer memory.
    fn borrow_from_driver(&self, vq: &mut Virtqueue) -> Option<BufSlot> {
        loop {
            let avail = vq.get_available_buffer()?;
            match self.io.phys_to_offset(avail.addr) {
                Some(offset) if self.io.contains(offset, avail.len as usize) => {
                    return Some(BufSlot { offset, head: avail.head, cap: avail.len });
                }
                _ => {
                    error!("rpmsg: {}: buffer {:#x} outside shared memory", vq.name(), avail.addr);
                    if let Err(e) = vq.add_consumed_buffer(avail.head, 0) {
                        error!("rpmsg: {}: returning buffer {} failed: {e}", vq.name(), avail.head);
                        return None;
                    }
                }
            }
        }
    }

    fn try_get_tx(&self) -> Option<BufSlot> {
        let mut st = self.state.lock();
        if !st.live {
            return None;
        }
        if let Some(slot) = st.reclaimer.take(&self.io) {
            trace!("rpmsg: reusing parked buffer {:#x}", slot.offset);
            return Some(slot);
        }
        let State { svq, tx_pool, .. } = &mut *st;
        match self.role {
            Role::Driver => {
                if let Some(used) = svq.get_buffer() {
                    return Some(BufSlot { offset: used.cookie, head: used.head, cap: self.txbuf_size });
                }
                if svq.is_full() {
                    return None;
                }
                let offset = tx_pool.as_mut()?.alloc(self.txbuf_size as usize)?;
                Some(BufSlot { offset, head: 0, cap: self.txbuf_size })
            }
            Role::Device => self.borrow_from_driver(svq),
        }
    }

    fn acquire_tx(&self, wait: Wait) -> Result<BufSlot> {
        poll_budgeted(
            &*self.clock,
            wait,
            RPMSG_TX_POLL_INTERVAL,
            || self.try_get_tx(),
            || match (&self.notify_wait, self.handle()) {
                (Some(cb), Some(dev)) => cb(&dev, self.svq_notify_id),
                _ => false,
            },
        )
    }

    fn write_header(&self, slot: BufSlot, src: u32, dst: u32, len: usize) -> Result<()> {
        let len16 = u16::try_from(len).map_err(|_| Error::BufferSize)?;
        let hdr = RpmsgHeader { src, dst, len: len16, flags: 0 };
        self.io.block_write(slot.offset, &hdr.encode()?).map_err(|_| Error::Param)
    }

    // Publishes a filled buffer and kicks the peer. Payload and header must be
    // flushed before the descriptor becomes visible.
    fn enqueue(&self, slot: BufSlot, len: usize) -> Result<()> {
        self.io.flush(slot.offset, len);
        let kick = {
            let mut st = self.state.lock();
            if !st.live {
                st.reclaimer.park(&self.io, slot);
                return Err(Error::DevState);
            }
            let res = match self.role {
                Role::Driver => self.phys(slot.offset).and_then(|addr| {
                    st.svq
                        .add_buffer(&[VqBuf { addr, len: len as u32 }], 1, 0, slot.offset)
                        .map_err(|_| Error::NoBuffer)
                }),
                Role::Device => {
                    st.svq.add_consumed_buffer(slot.head, len as u32).map_err(|_| Error::NoBuffer)
                }
            };
            if let Err(e) = res {
                error!("rpmsg: enqueue of {:#x} failed: {e}", slot.offset);
                st.reclaimer.park(&self.io, slot);
                return Err(e);
            }
            st.svq.prepare_kick()
        };
        if let Some(kick) = kick {
            kick.ring();
        }
        Ok(())
    }

    /// Payload capacity of a transmit buffer; 0 when unknown (device side, nothing offered).
    fn tx_payload_size(&self) -> usize {
        let size = match self.role {
            Role::Driver => self.txbuf_size,
            Role::Device => self.state.lock().svq.desc_size(),
        };
        (size as usize).saturating_sub(RPMSG_HEADER_SIZE)
    }

    fn rx_payload_size(&self) -> usize {
        let size = match self.role {
            Role::Driver => self.rxbuf_size,
            Role::Device => self.state.lock().rvq.desc_size(),
        };
        (size as usize).saturating_sub(RPMSG_HEADER_SIZE)
    }

    pub(crate) fn send_raw(&self, src: u32, dst: u32, data: &[u8], wait: Wait) -> Result<usize> {
        if src == RPMSG_ADDR_ANY || dst == RPMSG_ADDR_ANY {
            return Err(Error::Param);
        }
        self.ensure_ready()?;
        let known = self.tx_payload_size();
        if known != 0 && data.len() > known {
            return Err(Error::BufferSize);
        }
        let slot = self.acquire_tx(wait)?;
        if data.len() > (slot.cap as usize).saturating_sub(RPMSG_HEADER_SIZE) {
            self.reclaim_tx(slot);
            return Err(Error::BufferSize);
        }
        let written = self.write_header(slot, src, dst, data.len()).and_then(|()| {
            self.io
                .block_write(slot.offset + RPMSG_HEADER_SIZE, data)
                .map_err(|_| Error::Param)
        });
        if let Err(e) = written {
            self.reclaim_tx(slot);
            return Err(e);
        }
        self.enqueue(slot, RPMSG_HEADER_SIZE + data.len())?;
        trace!("rpmsg: sent {} bytes {src:#x} -> {dst:#x}", data.len());
        Ok(data.len())
    }

    pub(crate) fn send_nocopy(
        self: &Arc<Self>,
        src: u32,
        dst: u32,
        buf: TxBuffer,
        len: usize,
    ) -> Result<usize> {
        if !buf.belongs_to(self) || src == RPMSG_ADDR_ANY || dst == RPMSG_ADDR_ANY {
            return Err(Error::Param);
        }
        self.ensure_ready()?;
        if len > buf.capacity() {
            return Err(Error::BufferSize);
        }
        let slot = buf.into_slot();
        if let Err(e) = self.write_header(slot, src, dst, len) {
            self.reclaim_tx(slot);
            return Err(e);
        }
        self.enqueue(slot, RPMSG_HEADER_SIZE + len)?;
        Ok(len)
    }

    pub(crate) fn reclaim_tx(&self, slot: BufSlot) {
        self.state.lock().reclaimer.park(&self.io, slot);
    }

    pub(crate) fn hold_rx(&self, offset: usize) -> bool {
        self.state.lock().held.hold(offset)
    }

    pub(crate) fn release_rx(&self, offset: usize) {
        let kick = {
            let mut st = self.state.lock();
            match st.held.release(offset) {
                Release::Returned(slot) => self.return_rx(&mut st, slot),
                Release::Held(_) => None,
                Release::Unknown => {
                    warn!("rpmsg: release of rx buffer {offset:#x} that is not checked out");
                    None
                }
            }
        };
        if let Some(kick) = kick {
            kick.ring();
        }
    }

    fn return_rx(&self, st: &mut State, slot: BufSlot) -> Option<Kick> {
        if !st.live {
            return None;
        }
        let res = match self.role {
            Role::Driver => self.phys(slot.offset).and_then(|addr| {
                st.rvq
                    .add_buffer(&[VqBuf { addr, len: slot.cap }], 0, 1, slot.offset)
                    .map_err(|_| Error::NoBuffer)
            }),
            Role::Device => {
                st.rvq.add_consumed_buffer(slot.head, slot.cap).map_err(|_| Error::NoBuffer)
            }
        };
        if let Err(e) = res {
            error!("rpmsg: returning rx buffer {:#x} failed: {e}", slot.offset);
            return None;
        }
        st.rvq.prepare_kick()
    }

    fn next_rx(&self) -> Option<BufSlot> {
        let mut st = self.state.lock();
        if !st.live {
            return None;
        }
        let slot = match self.role {
            Role::Driver => {
                let used = st.rvq.get_buffer()?;
                BufSlot { offset: used.cookie, head: used.head, cap: self.rxbuf_size }
            }
            Role::Device => self.borrow_from_driver(&mut st.rvq)?,
        };
        if !st.held.track(slot) {
            error!("rpmsg: rx buffer {:#x} delivered twice", slot.offset);
            return None;
        }
        Some(slot)
    }

    /// Drains every pending receive buffer.
    pub(crate) fn handle_rx(&self) {
        while let Some(slot) = self.next_rx() {
            self.dispatch(slot);
        }
    }

    fn dispatch(&self, slot: BufSlot) {
        let _guard = RxGuard { dev: self, offset: slot.offset };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.io.invalidate(slot.offset, slot.cap as usize);
        let mut raw = [0u8; RPMSG_HEADER_SIZE];
        if self.io.block_read(slot.offset, &mut raw).is_err() {
            return;
        }
        let Ok(hdr) = RpmsgHeader::decode(&raw) else {
            return;
        };
        let len = hdr.len as usize;
        if RPMSG_HEADER_SIZE + len > slot.cap as usize {
            warn!("rpmsg: dropping {len}-byte message from {:#x}: exceeds buffer", hdr.src);
            return;
        }
        let mut payload = vec![0u8; len];
        if self.io.block_read(slot.offset + RPMSG_HEADER_SIZE, &mut payload).is_err() {
            return;
        }
        let target = self.state.lock().endpoints.get(&hdr.dst).cloned();
        let Some(target) = target else {
            debug!("rpmsg: no endpoint at {:#x}, dropping {len} bytes from {:#x}", hdr.dst, hdr.src);
            return;
        };
        let ept = target.endpoint();
        ept.bind_if_unbound(hdr.src);
        let msg = RxMessage { src: hdr.src, dst: hdr.dst, data: &payload, slot, device: &this };
        if let Err(e) = ept.deliver(&msg) {
            debug!("rpmsg: endpoint {:#x} rx callback: {e}", ept.local_addr());
        }
    }

    pub(crate) fn create_endpoint(&self, cfg: EndpointConfig) -> Result<Endpoint> {
        if cfg.name.len() > RPMSG_NAME_SIZE {
            return Err(Error::Param);
        }
        let announce = !cfg.name.is_empty()
            && self.has_feature(VIRTIO_RPMSG_F_NS)
            && cfg.dest == RPMSG_ADDR_ANY;
        let ept = {
            let mut st = self.state.lock();
            if !st.live {
                return Err(Error::DevState);
            }
            let addr = match cfg.src {
                RPMSG_ADDR_ANY => st.addrs.alloc().ok_or(Error::Addr)?,
                0 => return Err(Error::Addr),
                src => {
                    if st.endpoints.contains_key(&src) || !st.addrs.reserve(src) {
                        return Err(Error::Addr);
                    }
                    src
                }
            };
            let ept = Endpoint::new(cfg, addr, self.this.clone());
            st.endpoints.insert(addr, ept.acquire());
            ept
        };
        debug!("rpmsg: endpoint '{}' at {:#x}", ept.name(), ept.local_addr());
        if announce {
            if let Err(e) = self.send_ns(&ept, RPMSG_NS_CREATE) {
                warn!("rpmsg: announcing '{}' failed: {e}", ept.name());
                ept.mark_unregistered();
                drop(self.unregister(&ept));
                return Err(e);
            }
        }
        Ok(ept)
    }

    fn send_ns(&self, ept: &Endpoint, flags: u32) -> Result<usize> {
        let msg = NsMessage::new(ept.name(), ept.local_addr(), flags).encode()?;
        self.send_raw(ept.local_addr(), RPMSG_NS_EPT_ADDR, &msg, Wait::Blocking)
    }

    fn unregister(&self, ept: &Endpoint) -> Option<EndpointRef> {
        let mut st = self.state.lock();
        let addr = ept.local_addr();
        if !st.endpoints.get(&addr).is_some_and(|r| r.endpoint().same(ept)) {
            return None;
        }
        st.addrs.release(addr);
        st.endpoints.remove(&addr)
    }

    pub(crate) fn destroy_endpoint(&self, ept: &Endpoint) {
        if !ept.mark_unregistered() {
            return;
        }
        if !ept.name().is_empty()
            && self.has_feature(VIRTIO_RPMSG_F_NS)
            && ept.local_addr() >= RPMSG_RESERVED_ADDRESSES
        {
            if let Err(e) = self.send_ns(ept, RPMSG_NS_DESTROY) {
                warn!("rpmsg: withdrawing '{}' failed: {e}", ept.name());
            }
        }
        // Dropped outside the lock: this may be the last reference.
        let registry_ref = self.unregister(ept);
        debug!("rpmsg: endpoint '{}' at {:#x} destroyed", ept.name(), ept.local_addr());
        drop(registry_ref);
    }

    pub(crate) fn endpoint_ref(&self, addr: u32) -> Option<EndpointRef> {
        self.state.lock().endpoints.get(&addr).cloned()
    }

    /// Endpoint named `name` already bound to `dest`, else one with that name still unbound.
    pub(crate) fn find_by_name(&self, name: &str, dest: u32) -> Option<EndpointRef> {
        let st = self.state.lock();
        let mut unbound = None;
        for r in st.endpoints.values() {
            let ept = r.endpoint();
            if ept.name() != name {
                continue;
            }
            if dest != RPMSG_ADDR_ANY && ept.dest_addr() == dest {
                return Some(r.clone());
            }
            if unbound.is_none() && ept.dest_addr() == RPMSG_ADDR_ANY {
                unbound = Some(r);
            }
        }
        unbound.cloned()
    }

    pub(crate) fn fire_ns_bind(&self, name: &str, dest: u32) {
        match (&self.ns_bind, self.handle()) {
            (Some(cb), Some(dev)) => cb(&dev, name, dest),
            _ => debug!("rpmsg: ignoring announcement of '{name}' at {dest:#x}"),
        }
    }

    pub(crate) fn fire_ns_unbind(&self, name: &str, dest: u32) {
        if let (Some(cb), Some(dev)) = (&self.ns_unbind, self.handle()) {
            cb(&dev, name, dest);
        }
    }
}

/// One rpmsg channel over a virtio device.
#[derive(Clone)]
pub struct RpmsgDevice {
    shared: Arc<DeviceShared>,
}

impl RpmsgDevice {
    /// Starts building a channel over `vdev`.
    pub fn builder(vdev: Arc<dyn VirtioDevice>) -> RpmsgDeviceBuilder {
        RpmsgDeviceBuilder {
            vdev,
            pool: None,
            buffers: None,
            config: RpmsgConfig::default(),
            features: (1 << VIRTIO_RPMSG_F_NS) | (1 << VIRTIO_RPMSG_F_FC),
            clock: None,
            ns_bind: None,
            ns_unbind: None,
            notify_wait: None,
        }
    }

    // Registers the built-in endpoints and, as driver, tells the device we are live.
    fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.has_feature(VIRTIO_RPMSG_F_NS) {
            shared.create_endpoint(ns::endpoint_config())?;
        }
        if shared.has_feature(VIRTIO_RPMSG_F_FC) {
            shared.create_endpoint(fc::endpoint_config())?;
        }
        if shared.role == Role::Driver {
            set_driver_ok(&*shared.vdev).map_err(|e| {
                error!("rpmsg: raising DRIVER_OK failed: {e}");
                Error::Init
            })?;
        }
        Ok(())
    }

    /// Side of the virtio protocol this channel runs.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Negotiated rpmsg feature bits.
    pub fn features(&self) -> u64 {
        self.shared.features
    }

    /// Underlying virtio device.
    pub fn virtio(&self) -> &Arc<dyn VirtioDevice> {
        &self.shared.vdev
    }

    /// Registers an endpoint. Named endpoints without a destination are announced
    /// to the remote side when name service is on.
    pub fn create_endpoint(&self, cfg: EndpointConfig) -> Result<Endpoint> {
        self.shared.create_endpoint(cfg)
    }

    /// Destroys `ept`; same as `Endpoint::destroy`.
    pub fn destroy_endpoint(&self, ept: &Endpoint) {
        self.shared.destroy_endpoint(ept);
    }

    /// Endpoint bound at local address `addr`.
    pub fn endpoint(&self, addr: u32) -> Option<Endpoint> {
        self.shared.endpoint_ref(addr).map(|r| r.endpoint().clone())
    }

    /// Endpoint named `name`, preferring one bound to `dest`.
    pub fn find_endpoint(&self, name: &str, dest: u32) -> Option<Endpoint> {
        self.shared.find_by_name(name, dest).map(|r| r.endpoint().clone())
    }

    /// Number of registered endpoints, including the built-in ones.
    pub fn endpoint_count(&self) -> usize {
        self.shared.state.lock().endpoints.len()
    }

    /// Largest payload one send can carry; 0 when not known yet.
    pub fn tx_buffer_size(&self) -> usize {
        self.shared.tx_payload_size()
    }

    /// Largest payload one received message can carry; 0 when not known yet.
    pub fn rx_buffer_size(&self) -> usize {
        self.shared.rx_payload_size()
    }

    /// Checks out a transmit buffer to fill in place.
    pub fn get_tx_payload_buffer(&self, wait: Wait) -> Result<TxBuffer> {
        self.shared.ensure_ready()?;
        let slot = self.shared.acquire_tx(wait)?;
        Ok(TxBuffer::new(Arc::clone(&self.shared), slot))
    }

    /// Gives an unsent transmit buffer back; same as dropping it.
    pub fn release_tx_buffer(&self, buf: TxBuffer) {
        drop(buf);
    }

    /// Drops one reference to a held receive buffer.
    pub fn release_rx_buffer(&self, buf: HeldRxBuffer) {
        drop(buf);
    }

    /// Transmit buffers released unsent and waiting for reuse.
    pub fn parked_tx_buffers(&self) -> usize {
        self.shared.state.lock().reclaimer.len()
    }

    /// Receive buffers currently checked out of the ring.
    pub fn held_rx_buffers(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// Drains the receive queue without waiting for a notification.
    pub fn poll(&self) {
        self.shared.handle_rx();
    }

    /// Destroys every endpoint and detaches from the virtqueues.
    pub fn deinit(self) {
        let endpoints: Vec<Endpoint> = self
            .shared
            .state
            .lock()
            .endpoints
            .values()
            .map(|r| r.endpoint().clone())
            .collect();
        for ept in &endpoints {
            self.shared.destroy_endpoint(ept);
        }
        self.shared.state.lock().live = false;
        self.shared.vdev.delete_virtqueues();
        info!("rpmsg: {:?} down", self.shared.role);
    }
}
