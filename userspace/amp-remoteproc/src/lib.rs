// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Remote processor lifecycle, firmware loading and resource tables
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host), tests/lifecycle.rs, tests/loader.rs, tests/virtio.rs
//!
//! PUBLIC API:
//!   - Remoteproc: state machine (OFFLINE/READY/RUNNING/STOPPED/ERROR), memory regions,
//!     firmware load, notify-id allocation and resource-table backed virtio devices
//!   - RemoteprocOps: platform hooks (init, mmap, start, stop, shutdown, notify, vendor rsc)
//!   - ImageStore: firmware source (MemoryStore seekable, StreamStore forward-only)
//!   - ElfLoader: ELF32/ELF64 parsing and segment loading through a `Mapper`
//!   - RprocVirtio: `VirtioDevice` whose status, features and config live in the table
//!
//! INVARIANTS:
//!   - A resource table is structurally validated before any entry handler runs
//!   - A failed load unwinds in order: loader context, store, platform shutdown
//!   - shutdown() always ends OFFLINE with no tracked memory regions
//!   - The instance lock is never held while a virtqueue notification is dispatched
//!
//! DEPENDENCIES:
//!   - amp-hal: target memory access
//!   - amp-virtio: virtio device contract, vring geometry
//!   - goblin/scroll: ELF header, program header and section header decoding
//!   - bitflags: memory attributes, store features
//!   - parking_lot: instance lock
//!
//! ADR: docs/adr/0033-amp-remoteproc.md

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod elf;
mod mem;
mod remoteproc;
pub mod rsc;
mod store;
mod virtio;

use amp_hal::IoError;
use thiserror::Error;

pub use elf::{ElfLoader, ImageLoader, Mapper};
pub use mem::{Mapping, MemAttr, MmapRequest, RemoteprocMem};
pub use remoteproc::{Remoteproc, RemoteprocOps};
pub use store::{ImageStore, LoadMode, MemoryStore, StoreFeatures, StreamStore};
pub use virtio::RprocVirtio;

/// Crate result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Lifecycle state of a remote processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Powered off, no firmware.
    Offline = 0,
    /// Firmware loaded, entry point known.
    Ready = 1,
    /// Executing.
    Running = 2,
    /// Suspended by the platform.
    Suspended = 3,
    /// A start or crash left the processor unusable until shutdown.
    Error = 4,
    /// Halted with resources still held.
    Stopped = 5,
}

/// Remoteproc errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocation or mapping failed.
    #[error("out of memory")]
    NoMem,
    /// Bad argument or malformed image.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// No such device or resource.
    #[error("no such device")]
    NoDevice,
    /// An asynchronous store load is still in flight.
    #[error("operation in progress")]
    Again,
    /// The table is shorter than its header or entries claim.
    #[error("resource table truncated")]
    RscTruncated,
    /// Unsupported table version.
    #[error("unsupported resource table version {0}")]
    RscVersion(u32),
    /// A reserved field is not zero.
    #[error("reserved resource table field is not zero")]
    RscReserved,
    /// A vdev entry declares an unsupported number of vrings.
    #[error("vdev declares {0} vrings")]
    VdevRings(u8),
    /// No resource table (or no matching entry) is present.
    #[error("no resource table")]
    RscMissing,
    /// The platform does not handle this request.
    #[error("not supported")]
    NotSupported,
    /// The request is illegal in the current lifecycle state.
    #[error("operation not allowed in state {0:?}")]
    Busy(State),
    /// Target memory access failed.
    #[error(transparent)]
    Io(#[from] IoError),
}

impl Error {
    /// Flat negative error code.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoMem => -1,
            Error::Invalid(_) | Error::Io(_) => -2,
            Error::NoDevice => -3,
            Error::Again => -4,
            Error::RscTruncated => -5,
            Error::RscVersion(_) => -6,
            Error::RscReserved => -7,
            Error::VdevRings(_) => -9,
            Error::RscMissing => -10,
            Error::NotSupported => -11,
            Error::Busy(_) => -16,
        }
    }
}
