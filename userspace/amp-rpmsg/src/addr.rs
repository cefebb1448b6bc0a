// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::RPMSG_RESERVED_ADDRESSES;

/// Number of dynamically allocatable addresses.
pub(crate) const RPMSG_ADDR_BMP_SIZE: u32 = 128;

const WORDS: usize = (RPMSG_ADDR_BMP_SIZE / 64) as usize;

/// Allocation state of the dynamic address range
/// `RPMSG_RESERVED_ADDRESSES..RPMSG_RESERVED_ADDRESSES + RPMSG_ADDR_BMP_SIZE`.
#[derive(Default)]
pub(crate) struct AddressBitmap {
    words: [u64; WORDS],
}

impl AddressBitmap {
    fn bit(addr: u32) -> Option<(usize, u64)> {
        let rel = addr.checked_sub(RPMSG_RESERVED_ADDRESSES)?;
        if rel >= RPMSG_ADDR_BMP_SIZE {
            return None;
        }
        Some(((rel / 64) as usize, 1u64 << (rel % 64)))
    }

    /// Hands out the lowest free dynamic address.
    pub(crate) fn alloc(&mut self) -> Option<u32> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                *word |= 1 << bit;
                return Some(RPMSG_RESERVED_ADDRESSES + w as u32 * 64 + bit);
            }
        }
        None
    }

    /// Marks an explicitly requested address as taken. Returns false if it already was.
    /// Addresses outside the dynamic range are not tracked and always succeed.
    pub(crate) fn reserve(&mut self, addr: u32) -> bool {
        match Self::bit(addr) {
            Some((w, mask)) => {
                if self.words[w] & mask != 0 {
                    return false;
                }
                self.words[w] |= mask;
                true
            }
            None => true,
        }
    }

    pub(crate) fn release(&mut self, addr: u32) {
        if let Some((w, mask)) = Self::bit(addr) {
            self.words[w] &= !mask;
        }
    }

    pub(crate) fn is_taken(&self, addr: u32) -> bool {
        Self::bit(addr).is_some_and(|(w, mask)| self.words[w] & mask != 0)
    }
}
