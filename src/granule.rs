// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Delegation of granules to the monitor.
//!
//! A granule handed to the monitor is represented by a `DelegatedGranule`, which the host can't
//! read or write through. Every `DelegatedGranule` ends up in exactly one of three places: back in
//! the host allocator after a successful undelegate, inside a monitor object (an RTT, a data
//! granule, a REC) whose owner tracks it, or intentionally leaked with a warning when the monitor
//! refuses to give it back.

use log::warn;
use rmi::{api, RmiConduit, GRANULE_SIZE};

use crate::host_mem::{AllocMode, HostMemory, HostPage};
use crate::rme::Rme;
use crate::{Error, Result};

/// A granule currently owned by the monitor.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct DelegatedGranule {
    pa: u64,
}

impl DelegatedGranule {
    /// Re-creates the handle for a delegated granule found in a monitor object, e.g. the output
    /// address of an RTT entry.
    ///
    /// # Safety
    ///
    /// `pa` must be a delegated granule allocated from the host allocator, and no other handle to
    /// it may exist.
    pub(crate) unsafe fn from_phys(pa: u64) -> Self {
        Self { pa }
    }

    /// Returns the physical address of the granule.
    pub fn pa(&self) -> u64 {
        self.pa
    }

    /// Drops the handle because the granule now belongs to a monitor object, from which it will
    /// be recovered with `from_phys`.
    pub(crate) fn hand_over(self) {}

    /// Gives up on the granule for good.
    pub(crate) fn leak(self) {
        warn!("Leaking delegated granule {:#x}", self.pa);
    }
}

/// Contiguous granules that are delegated in place, without passing through the host allocator.
/// Used for the RTT root, whose pages belong to the second stage address space.
#[derive(Debug)]
pub(crate) struct DelegatedRange {
    base: u64,
    count: usize,
}

impl DelegatedRange {
    /// Returns the number of granules currently delegated.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Gives up on the granules still delegated, which stay with the monitor.
    pub(crate) fn leak(self) {
        if self.count > 0 {
            warn!(
                "Leaking {} delegated granules from {:#x}",
                self.count, self.base
            );
        }
    }
}

impl<C: RmiConduit, H: HostMemory> Rme<C, H> {
    /// Delegates `page` to the monitor. A page the monitor rejects is freed.
    pub fn delegate(&self, page: HostPage) -> Result<DelegatedGranule> {
        let pa = page.pa();
        // Safety: `page` is uniquely owned and is consumed here, so the host can't access it until
        // it is undelegated and handed back as a new `HostPage`.
        match unsafe { api::granule_delegate(self.conduit(), pa) } {
            Ok(()) => {
                core::mem::forget(page);
                Ok(DelegatedGranule { pa })
            }
            Err(e) => {
                self.mem().free_page(page);
                Err(e.into())
            }
        }
    }

    /// Undelegates `granule` and returns it to the host. If the monitor refuses, the granule is
    /// leaked.
    pub fn undelegate(&self, granule: DelegatedGranule) -> Result<HostPage> {
        if let Err(e) = api::granule_undelegate(self.conduit(), granule.pa) {
            warn!("Failed to undelegate {:#x}: {:?}", granule.pa, e);
            granule.leak();
            return Err(Error::Leaked);
        }
        // Safety: The granule was allocated from the host and is no longer delegated, and the
        // `DelegatedGranule` handle is consumed.
        Ok(unsafe { HostPage::from_phys(granule.pa) })
    }

    /// Allocates a page and delegates it.
    pub fn alloc_delegated(&self, mode: AllocMode) -> Result<DelegatedGranule> {
        let page = self.mem().try_alloc_page(mode)?;
        self.delegate(page)
    }

    /// Undelegates `granule` and frees it. If the monitor refuses, the granule is leaked.
    pub fn free_delegated(&self, granule: DelegatedGranule) -> Result<()> {
        let page = self.undelegate(granule)?;
        self.mem().free_page(page);
        Ok(())
    }

    /// Delegates `count` contiguous granules starting at `base`. On failure, the granules already
    /// delegated are undelegated again.
    ///
    /// # Safety
    ///
    /// The caller must own the granules and must not access them until they are undelegated.
    pub(crate) unsafe fn delegate_range(&self, base: u64, count: usize) -> Result<DelegatedRange> {
        let mut range = DelegatedRange { base, count: 0 };
        for i in 0..count {
            let pa = base + i as u64 * GRANULE_SIZE;
            if let Err(e) = api::granule_delegate(self.conduit(), pa) {
                // Leaves the range partially delegated if an undelegate fails.
                self.undelegate_range(&mut range)?;
                return Err(e.into());
            }
            range.count += 1;
        }
        Ok(range)
    }

    /// Undelegates the granules in `range`, last first. Stops at the first granule the monitor
    /// refuses to give back; it and the granules below it stay delegated.
    pub(crate) fn undelegate_range(&self, range: &mut DelegatedRange) -> Result<()> {
        while range.count > 0 {
            let pa = range.base + (range.count as u64 - 1) * GRANULE_SIZE;
            if let Err(e) = api::granule_undelegate(self.conduit(), pa) {
                warn!(
                    "Failed to undelegate {:#x}, leaking {} granules from {:#x}: {:?}",
                    pa, range.count, range.base, e
                );
                return Err(Error::Leaked);
            }
            range.count -= 1;
        }
        Ok(())
    }
}
