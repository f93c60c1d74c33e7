// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{Error, Result};

/// Hands out the VMIDs used by realms. Unlike VMIDs of normal VMs, a realm's VMID is fixed in its
/// descriptor for its whole lifetime, so IDs are never recycled while in use and there is no
/// rollover.
pub struct VmidAllocator {
    bitmap: Mutex<Vec<u64>>,
    count: usize,
}

impl VmidAllocator {
    /// Creates an allocator for `vmid_bits` wide VMIDs.
    pub fn new(vmid_bits: u32) -> Self {
        let count = 1usize << vmid_bits.min(16);
        Self {
            bitmap: Mutex::new(vec![0; (count + 63) / 64]),
            count,
        }
    }

    /// Returns the number of VMIDs in the pool.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Reserves the lowest free VMID.
    pub fn reserve(&self) -> Result<u16> {
        let mut bitmap = self.bitmap.lock();
        let (word, bit) = bitmap
            .iter()
            .enumerate()
            .find_map(|(i, w)| (*w != u64::MAX).then(|| (i, w.trailing_ones() as usize)))
            .ok_or(Error::VmidExhausted)?;
        let vmid = word * 64 + bit;
        if vmid >= self.count {
            return Err(Error::VmidExhausted);
        }
        bitmap[word] |= 1 << bit;
        Ok(vmid as u16)
    }

    /// Returns `vmid` to the pool.
    pub fn release(&self, vmid: u16) {
        let vmid = vmid as usize;
        let mut bitmap = self.bitmap.lock();
        debug_assert!(bitmap[vmid / 64] & (1 << (vmid % 64)) != 0);
        bitmap[vmid / 64] &= !(1 << (vmid % 64));
    }
}
