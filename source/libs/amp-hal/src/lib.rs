// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware access seams shared by the AMP transport crates
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host)
//!
//! PUBLIC API:
//! - `Bus`: 32-bit register block access (MMIO control registers)
//! - `IoRegion`: offset-addressed shared memory with physical translation
//! - `Memory`: backing store behind an `IoRegion` (`HeapMemory`, `RawMemory`)
//! - `Notifier`: one-way doorbell ("kick") towards the peer processor
//! - `CacheOps`: flush/invalidate hooks for non-coherent shared memory
//!
//! DEPENDENCIES:
//! - parking_lot: host-backed memory lock
//! - thiserror: `IoError`
//! - log: out-of-range access diagnostics

#![deny(missing_docs)]

mod io;
mod raw;

pub use io::{HeapMemory, IoError, IoRegion, Memory};
pub use raw::RawMemory;

/// Basic bus access trait shared by user drivers.
pub trait Bus {
    /// Reads the 32-bit register at byte offset `addr`.
    fn read(&self, addr: usize) -> u32;
    /// Writes the 32-bit register at byte offset `addr`.
    fn write(&self, addr: usize, value: u32);
}

impl<B: Bus + ?Sized> Bus for std::sync::Arc<B> {
    fn read(&self, addr: usize) -> u32 {
        (**self).read(addr)
    }

    fn write(&self, addr: usize, value: u32) {
        (**self).write(addr, value)
    }
}

/// Doorbell towards the remote side (IPI, mailbox or MMIO notify register).
///
/// A kick carries no data and expects no acknowledgment.
pub trait Notifier: Send + Sync {
    /// Signals the peer that notification id `id` has new work.
    fn notify(&self, id: u32);
}

/// Cache maintenance for shared memory that is not coherent with the peer.
pub trait CacheOps: Send + Sync {
    /// Writes back `len` bytes starting at physical address `pa`.
    fn flush(&self, pa: u64, len: usize);
    /// Discards cached copies of `len` bytes starting at physical address `pa`.
    fn invalidate(&self, pa: u64, len: usize);
}
