// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPMsg messaging over a virtio transport (endpoints, name service, flow control)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + property tests (host), tests/transport.rs, tests/nocopy.rs
//!
//! PUBLIC API:
//!   - RpmsgDevice: one rpmsg channel bound to a virtio device (driver or device role)
//!   - Endpoint / EndpointConfig: addressable message sinks with rx/unbind/flow callbacks
//!   - TxBuffer / HeldRxBuffer: zero-copy transmit and receive buffer guards
//!   - RpmsgConfig: buffer sizing loaded from TOML
//!   - Error: flat error set with stable negative codes
//!
//! INVARIANTS:
//!   - The device lock is never held while user callbacks run or while a peer is kicked
//!   - An rx buffer returns to its ring exactly once, after its held count drops to zero
//!   - Endpoint release callbacks run once, after the last in-flight reference is gone
//!
//! DEPENDENCIES:
//!   - amp-virtio: virtqueues and the virtio device contract
//!   - amp-hal: shared-memory access
//!   - parking_lot: device state lock
//!   - serde/toml: configuration
//!   - static_assertions: reclaim record layout checks
//!
//! ADR: docs/adr/0032-amp-rpmsg-transport.md

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod addr;
mod budget;
mod buffer;
mod config;
mod device;
mod endpoint;
mod fc;
mod ns;
pub mod wire;

use core::time::Duration;

use thiserror::Error;

pub use budget::{Clock, HostClock};
pub use buffer::{HeldRxBuffer, RxMessage, ShmPool, TxBuffer};
pub use config::{ConfigError, RpmsgConfig, RPMSG_MAX_BUFFER_SIZE, RPMSG_MIN_BUFFER_SIZE};
pub use device::{NotifyWaitCallback, NsBindCallback, RpmsgDevice, RpmsgDeviceBuilder};
pub use endpoint::{
    Endpoint, EndpointConfig, FlowCallback, ReleaseCallback, RxCallback, UnbindCallback,
};

/// Wildcard address: "any" source on create, "unknown" destination on an endpoint.
pub const RPMSG_ADDR_ANY: u32 = 0xFFFF_FFFF;
/// Address of the name-service endpoint on both sides.
pub const RPMSG_NS_EPT_ADDR: u32 = 0x35;
/// Address of the flow-control endpoint on both sides.
pub const RPMSG_FC_EPT_ADDR: u32 = 0x36;
/// Addresses below this value are reserved for well-known services.
pub const RPMSG_RESERVED_ADDRESSES: u32 = 1024;
/// Maximum endpoint name length, in bytes.
pub const RPMSG_NAME_SIZE: usize = 32;
/// Default size of one transport buffer, header included.
pub const RPMSG_BUFFER_SIZE: u32 = 512;

/// Feature bit: the peer runs a name service.
pub const VIRTIO_RPMSG_F_NS: u32 = 0;
/// Feature bit: the peer understands flow-control messages.
pub const VIRTIO_RPMSG_F_FC: u32 = 1;

/// Base of the rpmsg error code range.
pub const RPMSG_ERROR_BASE: i32 = -2000;

/// Transmit wait budget for `Wait::Blocking`.
pub const RPMSG_TX_BUDGET: Duration = Duration::from_secs(15);
/// Poll interval while waiting for a transmit buffer.
pub const RPMSG_TX_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result type returned by rpmsg operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by rpmsg operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocation or address space exhausted.
    #[error("out of memory")]
    NoMem,
    /// No transmit buffer became available in time.
    #[error("no buffer available")]
    NoBuffer,
    /// The device does not expose the expected queues.
    #[error("unexpected number of virtqueues")]
    MaxVq,
    /// Invalid argument.
    #[error("invalid parameter")]
    Param,
    /// The virtio device is not ready.
    #[error("device not ready")]
    DevState,
    /// Payload exceeds the buffer.
    #[error("buffer too small")]
    BufferSize,
    /// Transport initialisation failed.
    #[error("initialisation failed")]
    Init,
    /// Address unknown, reserved or already bound.
    #[error("bad address")]
    Addr,
}

impl Error {
    /// Flat negative error code.
    pub fn code(self) -> i32 {
        RPMSG_ERROR_BASE
            - match self {
                Error::NoMem => 1,
                Error::NoBuffer => 2,
                Error::MaxVq => 3,
                Error::Param => 4,
                Error::DevState => 5,
                Error::BufferSize => 6,
                Error::Init => 7,
                Error::Addr => 8,
            }
    }
}

/// How long a send may wait for a transmit buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Wait up to `RPMSG_TX_BUDGET`.
    Blocking,
    /// Fail with `Error::NoBuffer` immediately.
    NonBlocking,
    /// Wait up to the given duration.
    Timeout(Duration),
}

impl Wait {
    /// Time budget for this wait mode; zero for non-blocking.
    pub const fn budget(self) -> Duration {
        match self {
            Wait::Blocking => RPMSG_TX_BUDGET,
            Wait::NonBlocking => Duration::ZERO,
            Wait::Timeout(d) => d,
        }
    }
}
