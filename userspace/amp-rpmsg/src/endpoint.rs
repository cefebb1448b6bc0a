// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Endpoints: named, addressable message sinks.
//!
//! An endpoint is shared between its owner, the device registry and every
//! dispatch currently running its callbacks. Each of those holds an
//! `EndpointRef`; the release callback runs when the last one drops.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::{RxMessage, TxBuffer};
use crate::device::DeviceShared;
use crate::wire::{FcMessage, RPMSG_FC_MSG_SIZE};
use crate::{Error, Result, Wait, RPMSG_ADDR_ANY, RPMSG_FC_EPT_ADDR};

/// Called for every message addressed to the endpoint.
pub type RxCallback = Arc<dyn Fn(&Endpoint, &RxMessage<'_>) -> Result<()> + Send + Sync>;
/// Called when the remote side withdraws the service.
pub type UnbindCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;
/// Called with `(flags, remote address)` when the remote side pauses or resumes the stream.
pub type FlowCallback = Arc<dyn Fn(&Endpoint, u32, u32) + Send + Sync>;
/// Called once the endpoint is destroyed and no dispatch references it any more.
pub type ReleaseCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

/// Parameters for `RpmsgDevice::create_endpoint`.
pub struct EndpointConfig {
    pub(crate) name: String,
    pub(crate) src: u32,
    pub(crate) dest: u32,
    pub(crate) rx: RxCallback,
    pub(crate) unbind: Option<UnbindCallback>,
    pub(crate) flow: Option<FlowCallback>,
    pub(crate) release: Option<ReleaseCallback>,
}

impl EndpointConfig {
    /// `src` may be `RPMSG_ADDR_ANY` to get a dynamic address; `dest` may be
    /// `RPMSG_ADDR_ANY` until the remote side is known.
    pub fn new(
        name: impl Into<String>,
        src: u32,
        dest: u32,
        rx: impl Fn(&Endpoint, &RxMessage<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            src,
            dest,
            rx: Arc::new(rx),
            unbind: None,
            flow: None,
            release: None,
        }
    }

    /// Sets the unbind callback.
    pub fn on_unbind(mut self, cb: impl Fn(&Endpoint) + Send + Sync + 'static) -> Self {
        self.unbind = Some(Arc::new(cb));
        self
    }

    /// Sets the flow-control callback.
    pub fn on_flow_control(mut self, cb: impl Fn(&Endpoint, u32, u32) + Send + Sync + 'static) -> Self {
        self.flow = Some(Arc::new(cb));
        self
    }

    /// Sets the release callback.
    pub fn on_release(mut self, cb: impl Fn(&Endpoint) + Send + Sync + 'static) -> Self {
        self.release = Some(Arc::new(cb));
        self
    }
}

pub(crate) struct EndpointInner {
    name: String,
    addr: u32,
    dest: AtomicU32,
    rx: RxCallback,
    unbind: Option<UnbindCallback>,
    flow: Option<FlowCallback>,
    release: Option<ReleaseCallback>,
    refs: AtomicUsize,
    registered: AtomicBool,
    device: Weak<DeviceShared>,
}

/// Handle to an endpoint. Cloning the handle does not extend the endpoint's life
/// in the registry; `destroy` ends it.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("addr", &self.inner.addr)
            .field("dest", &self.dest_addr())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(cfg: EndpointConfig, addr: u32, device: Weak<DeviceShared>) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                name: cfg.name,
                addr,
                dest: AtomicU32::new(cfg.dest),
                rx: cfg.rx,
                unbind: cfg.unbind,
                flow: cfg.flow,
                release: cfg.release,
                refs: AtomicUsize::new(0),
                registered: AtomicBool::new(true),
                device,
            }),
        }
    }

    /// Service name; empty for anonymous endpoints.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local address.
    pub fn local_addr(&self) -> u32 {
        self.inner.addr
    }

    /// Remote address, or `RPMSG_ADDR_ANY` while unbound.
    pub fn dest_addr(&self) -> u32 {
        self.inner.dest.load(Ordering::Acquire)
    }

    /// True once the remote address is known.
    pub fn is_ready(&self) -> bool {
        self.dest_addr() != RPMSG_ADDR_ANY
    }

    /// False once the endpoint has been destroyed.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_dest(&self, dest: u32) {
        self.inner.dest.store(dest, Ordering::Release);
    }

    /// Learns the remote address from the first message of an unbound endpoint.
    pub(crate) fn bind_if_unbound(&self, dest: u32) {
        let _ = self.inner.dest.compare_exchange(
            RPMSG_ADDR_ANY,
            dest,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_unregistered(&self) -> bool {
        self.inner.registered.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn same(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Takes a counted reference; see `EndpointRef`.
    pub(crate) fn acquire(&self) -> EndpointRef {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        EndpointRef { ept: self.clone() }
    }

    pub(crate) fn deliver(&self, msg: &RxMessage<'_>) -> Result<()> {
        (self.inner.rx)(self, msg)
    }

    pub(crate) fn fire_unbind(&self) {
        if let Some(cb) = &self.inner.unbind {
            cb(self);
        }
    }

    pub(crate) fn fire_flow(&self, flags: u32, src: u32) {
        if let Some(cb) = &self.inner.flow {
            cb(self, flags, src);
        }
    }

    fn device(&self) -> Result<Arc<DeviceShared>> {
        self.inner.device.upgrade().ok_or(Error::DevState)
    }

    fn bound_dest(&self) -> Result<u32> {
        match self.dest_addr() {
            RPMSG_ADDR_ANY => Err(Error::Addr),
            dest => Ok(dest),
        }
    }

    /// Sends to the bound remote address, waiting for a buffer if needed.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_offchannel(self.local_addr(), self.bound_dest()?, data)
    }

    /// Sends to `dst`, waiting for a buffer if needed.
    pub fn sendto(&self, dst: u32, data: &[u8]) -> Result<usize> {
        self.send_offchannel(self.local_addr(), dst, data)
    }

    /// Sends with explicit addresses, waiting for a buffer if needed.
    pub fn send_offchannel(&self, src: u32, dst: u32, data: &[u8]) -> Result<usize> {
        self.device()?.send_raw(src, dst, data, Wait::Blocking)
    }

    /// Sends to the bound remote address; fails with `NoBuffer` instead of waiting.
    pub fn trysend(&self, data: &[u8]) -> Result<usize> {
        self.trysend_offchannel(self.local_addr(), self.bound_dest()?, data)
    }

    /// Sends to `dst`; fails with `NoBuffer` instead of waiting.
    pub fn trysendto(&self, dst: u32, data: &[u8]) -> Result<usize> {
        self.trysend_offchannel(self.local_addr(), dst, data)
    }

    /// Sends with explicit addresses; fails with `NoBuffer` instead of waiting.
    pub fn trysend_offchannel(&self, src: u32, dst: u32, data: &[u8]) -> Result<usize> {
        self.device()?.send_raw(src, dst, data, Wait::NonBlocking)
    }

    /// Sends with an explicit wait mode.
    pub fn send_with(&self, dst: u32, data: &[u8], wait: Wait) -> Result<usize> {
        self.device()?.send_raw(self.local_addr(), dst, data, wait)
    }

    /// Sends `len` bytes already written into `buf` to the bound remote address.
    pub fn send_nocopy(&self, buf: TxBuffer, len: usize) -> Result<usize> {
        self.send_offchannel_nocopy(self.local_addr(), self.bound_dest()?, buf, len)
    }

    /// Sends `len` bytes already written into `buf` to `dst`.
    pub fn sendto_nocopy(&self, dst: u32, buf: TxBuffer, len: usize) -> Result<usize> {
        self.send_offchannel_nocopy(self.local_addr(), dst, buf, len)
    }

    /// Sends `len` bytes already written into `buf` with explicit addresses.
    ///
    /// On error the buffer is parked for reuse, never leaked.
    pub fn send_offchannel_nocopy(
        &self,
        src: u32,
        dst: u32,
        buf: TxBuffer,
        len: usize,
    ) -> Result<usize> {
        self.device()?.send_nocopy(src, dst, buf, len)
    }

    /// Tells the remote endpoint to pause (`RPMSG_EPT_OFF`) or resume (`RPMSG_EPT_ON`).
    /// Never waits for a buffer.
    pub fn set_flow_control(&self, flags: u32) -> Result<usize> {
        let msg = FcMessage { src: self.local_addr(), dst: self.dest_addr(), flags };
        let bytes: [u8; RPMSG_FC_MSG_SIZE] = msg.encode()?;
        self.trysendto(RPMSG_FC_EPT_ADDR, &bytes)
    }

    /// Unregisters the endpoint, announcing the withdrawal when name service is on.
    /// Safe to call from the endpoint's own callbacks; later calls are no-ops.
    pub fn destroy(&self) {
        match self.inner.device.upgrade() {
            Some(device) => device.destroy_endpoint(self),
            // The registry went away with the device and already dropped its reference.
            None => {
                self.mark_unregistered();
            }
        }
    }
}

/// One counted reference to an endpoint. The registry owns one for as long as
/// the endpoint is registered; dispatch takes one around each callback.
pub(crate) struct EndpointRef {
    ept: Endpoint,
}

impl EndpointRef {
    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.ept
    }
}

impl Clone for EndpointRef {
    fn clone(&self) -> Self {
        self.ept.acquire()
    }
}

impl Drop for EndpointRef {
    fn drop(&mut self) {
        if self.ept.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cb) = &self.ept.inner.release {
                cb(&self.ept);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ept_with_release(hits: Arc<AtomicUsize>) -> Endpoint {
        let cfg = EndpointConfig::new("svc", 1024, RPMSG_ADDR_ANY, |_, _| Ok(())).on_release(
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
        );
        Endpoint::new(cfg, 1024, Weak::new())
    }

    #[test]
    fn release_fires_after_last_reference() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ept = ept_with_release(hits.clone());
        let registry = ept.acquire();
        let dispatch = registry.clone();
        drop(registry);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(dispatch);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_message_binds_destination_once() {
        let ept = ept_with_release(Arc::new(AtomicUsize::new(0)));
        assert!(!ept.is_ready());
        ept.bind_if_unbound(0x400);
        ept.bind_if_unbound(0x401);
        assert_eq!(ept.dest_addr(), 0x400);
        assert!(ept.is_ready());
    }

    #[test]
    fn orphaned_endpoint_cannot_send_but_destroys_cleanly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ept = ept_with_release(hits.clone());
        // Device teardown drops the registry's reference.
        drop(ept.acquire());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ept.send(b"x"), Err(Error::Addr));
        assert_eq!(ept.sendto(5, b"x"), Err(Error::DevState));
        ept.destroy();
        ept.destroy();
        assert!(!ept.is_registered());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
