// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Split virtqueues and the virtio device contract used by rpmsg/remoteproc
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + property tests (host), tests/ring_pair.rs
//!
//! PUBLIC API:
//! - `Virtqueue`: split ring bookkeeping for either side of a shared ring
//! - `VringLayout` / `vring_size`: ring memory footprint
//! - `VirtioDevice`: status/feature/config/queue contract (one impl per transport)
//! - `DeviceStatus`: status byte with the legal-transition check
//! - `VqCallbacks`: notify-id keyed callback registry for transports
//!
//! INVARIANTS:
//! - The peer only touches ring bytes in shared memory; free-list state is local
//! - `free_count()` is the source of truth for "ring full"
//!
//! DEPENDENCIES:
//! - amp-hal: `IoRegion` ring memory, `Notifier` kicks
//! - bitflags: status bits
//! - thiserror: `VqError`, `VirtioError`
//!
//! ADR: docs/adr/0031-amp-virtio-split-ring.md

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod device;
mod ring;
mod status;
mod virtqueue;

pub use device::{
    negotiate, set_driver_ok, DeviceId, VirtioDevice, VirtioError, VqCallback, VqCallbacks,
    VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_VERSION_1, VIRTIO_ID_BLOCK, VIRTIO_ID_CONSOLE,
    VIRTIO_ID_ENTROPY, VIRTIO_ID_NET, VIRTIO_ID_RPMSG, VIRTIO_RING_F_EVENT_IDX,
    VIRTIO_RING_F_INDIRECT_DESC,
};
pub use ring::{vring_size, VringLayout, VRING_DESC_SIZE};
pub use status::DeviceStatus;
pub use virtqueue::{
    AvailBuffer, Kick, UsedBuffer, VqBuf, VqError, Virtqueue, VirtqueueConfig, VQ_ERROR_BASE,
    VQ_MAX_DESCRIPTORS, VQ_RING_DESC_CHAIN_END, VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_NEXT,
    VRING_DESC_F_WRITE, VRING_USED_F_NO_NOTIFY,
};

/// Which half of the virtio protocol this side implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owns buffer provisioning: publishes into the available ring, reaps the used ring.
    Driver,
    /// Consumes available entries and publishes them into the used ring.
    Device,
}
