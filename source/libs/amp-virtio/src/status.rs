// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

bitflags! {
    /// Virtio device status byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest noticed the device.
        const ACKNOWLEDGE = 0x01;
        /// Guest knows how to drive it.
        const DRIVER = 0x02;
        /// Driver is live; queues may be used.
        const DRIVER_OK = 0x04;
        /// Feature negotiation complete.
        const FEATURES_OK = 0x08;
        /// Device hit an unrecoverable error and wants a reset.
        const NEEDS_RESET = 0x40;
        /// Driver gave up on the device.
        const FAILED = 0x80;
    }
}

impl DeviceStatus {
    /// Status after reset.
    pub const RESET: DeviceStatus = DeviceStatus::empty();

    /// Checks `self -> next` against the RESET, ACKNOWLEDGE, DRIVER, FEATURES_OK,
    /// DRIVER_OK ladder. Reset is always legal; NEEDS_RESET/FAILED may be raised
    /// from anywhere; a failed device only accepts reset.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        if next.is_empty() {
            return true;
        }
        if self.contains(DeviceStatus::FAILED) {
            return next == self;
        }
        if next.intersects(DeviceStatus::FAILED | DeviceStatus::NEEDS_RESET) {
            return true;
        }
        if !next.contains(self) {
            return false;
        }
        if next.contains(DeviceStatus::DRIVER) && !next.contains(DeviceStatus::ACKNOWLEDGE) {
            return false;
        }
        if next.intersects(DeviceStatus::FEATURES_OK | DeviceStatus::DRIVER_OK)
            && !next.contains(DeviceStatus::DRIVER)
        {
            return false;
        }
        true
    }

    /// True once DRIVER_OK is set and no error bit is.
    pub fn is_ready(self) -> bool {
        self.contains(DeviceStatus::DRIVER_OK)
            && !self.intersects(DeviceStatus::FAILED | DeviceStatus::NEEDS_RESET)
    }
}
