// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Management of the realm translation table (RTT) tree.
//!
//! The tree mirrors the realm's IPA space. Its root is the top level table of the second stage
//! address space, delegated in place; every other table is a granule from `acquire_delegated`
//! that is handed over to the monitor by `RMI_RTT_CREATE` and recovered from the parent entry when
//! the table is destroyed or folded.

use log::{debug, warn};
use rmi::{
    api, level_mapsize, RmiConduit, RttEntry, RttEntryState, GRANULE_SIZE, RTT_BLOCK_LEVEL,
    RTT_MAX_LEVEL,
};

use crate::granule::DelegatedGranule;
use crate::host_mem::{AllocMode, HostMemory};
use crate::realm::Realm;
use crate::stage2::Stage2;
use crate::{Error, Result};

pub(crate) fn align_down(addr: u64, size: u64) -> u64 {
    addr & !(size - 1)
}

pub(crate) fn is_aligned(addr: u64, size: u64) -> bool {
    addr & (size - 1) == 0
}

// Keeps the first error of a walk that carries on past failures.
fn record(first: &mut Option<Error>, e: Error) {
    first.get_or_insert(e);
}

impl<'a, C: RmiConduit, H: HostMemory, S: Stage2> Realm<'a, C, H, S> {
    // Returns the address a table at `level` covering `addr` is anchored at.
    fn table_base(addr: u64, level: u8) -> u64 {
        align_down(addr, level_mapsize(level - 1))
    }

    fn rtt_create(&self, rtt: u64, addr: u64, level: u8) -> rmi::Result<()> {
        let rd = self.rd_pa().map_err(|_| rmi::Error::Input)?;
        api::rtt_create(
            self.rme().conduit(),
            rtt,
            rd,
            Self::table_base(addr, level),
            level,
        )
    }

    fn rtt_destroy(&self, rtt: u64, addr: u64, level: u8) -> rmi::Result<()> {
        let rd = self.rd_pa().map_err(|_| rmi::Error::Input)?;
        api::rtt_destroy(
            self.rme().conduit(),
            rtt,
            rd,
            Self::table_base(addr, level),
            level,
        )
    }

    /// Reads the RTT entry for `addr` at `level`. If the walk ends early, the entry at which it
    /// ended is returned.
    pub fn read_entry(&self, addr: u64, level: u8) -> Result<RttEntry> {
        let entry = api::rtt_read_entry(
            self.rme().conduit(),
            self.rd_pa()?,
            align_down(addr, level_mapsize(level)),
            level,
        )?;
        Ok(entry)
    }

    /// Creates the tables for levels `from_level + 1` through `to_level` covering `addr`.
    ///
    /// Tables that were created before a failure are left in place; the granule for the level that
    /// failed is released.
    pub fn create_levels(
        &self,
        addr: u64,
        from_level: u8,
        to_level: u8,
        mode: AllocMode,
    ) -> Result<()> {
        if from_level >= to_level || to_level > RTT_MAX_LEVEL {
            return Err(Error::InvalidArgument);
        }
        for level in from_level + 1..=to_level {
            let rtt = self.acquire_delegated(mode)?;
            if let Err(e) = self.rtt_create(rtt.pa(), addr, level) {
                debug!("RTT create at {:#x} level {} failed: {:?}", addr, level, e);
                self.release_delegated(rtt)?;
                return Err(e.into());
            }
            rtt.hand_over();
        }
        Ok(())
    }

    // Destroys the table at `level` covering `addr` and releases its granule.
    fn destroy_free_rtt(&self, rtt: u64, addr: u64, level: u8) -> Result<()> {
        self.rtt_destroy(rtt, addr, level)?;
        // Safety: The table granule came from `acquire_delegated` and the monitor no longer
        // references it.
        let rtt = unsafe { DelegatedGranule::from_phys(rtt) };
        self.release_delegated(rtt)
    }

    // Destroys the data granule mapped at `addr`, undelegates it and frees it.
    fn destroy_data_granule(&self, addr: u64, pa: u64) -> Result<()> {
        api::data_destroy(self.rme().conduit(), self.rd_pa()?, addr)?;
        // Safety: The data granule was allocated and delegated by `map_protected` and the monitor
        // no longer references it.
        let data = unsafe { DelegatedGranule::from_phys(pa) };
        self.rme().free_delegated(data)
    }

    /// Tears down everything mapped in `[start, end)` by entries at `level` and below.
    ///
    /// Table entries are recursed into, and tables whose whole span is covered are destroyed.
    /// Protected blocks are first split with the spare granule so each page can be destroyed.
    /// Unprotected mappings are removed. Failures don't stop the walk; the first one is returned
    /// once everything that could be torn down has been.
    pub fn destroy_subtree(&self, level: u8, start: u64, end: u64) -> Result<()> {
        let map_size = level_mapsize(level);
        let mut failure = None;
        let mut addr = start;
        while addr < end {
            let next = align_down(addr, map_size) + map_size;
            let end_addr = next.min(end);
            let entry = match self.read_entry(addr, level) {
                Ok(entry) => entry,
                Err(e) => {
                    record(&mut failure, e);
                    addr = next;
                    continue;
                }
            };
            let covers_entry = is_aligned(addr, map_size) && next <= end;
            let result = match entry.state {
                _ if entry.walk_level != level => {
                    // Nothing is mapped this deep; the walk ended on an empty entry above.
                    Ok(())
                }
                RttEntryState::Unassigned | RttEntryState::Destroyed => Ok(()),
                RttEntryState::Table => self
                    .destroy_subtree(level + 1, addr, end_addr)
                    .and_then(|()| {
                        if covers_entry {
                            self.destroy_free_rtt(entry.phys(), addr, level + 1)
                        } else {
                            Ok(())
                        }
                    }),
                RttEntryState::Assigned if level == RTT_MAX_LEVEL => {
                    self.destroy_data_granule(addr, entry.phys())
                }
                RttEntryState::Assigned if level == RTT_BLOCK_LEVEL => {
                    self.destroy_block(addr, end_addr, covers_entry)
                }
                RttEntryState::Assigned => Err(Error::RttProtocol),
                RttEntryState::ValidNs => api::rtt_unmap_unprotected(
                    self.rme().conduit(),
                    self.rd_pa()?,
                    align_down(addr, map_size),
                    level,
                )
                .map_err(Error::from),
            };
            if let Err(e) = result {
                record(&mut failure, e);
            }
            addr = next;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Splits the protected block covering `addr` using a granule that must not need allocation,
    // then destroys the pages in `[addr, end)`. If the whole block went away, the temporary table
    // is destroyed again and the granule goes back to the spare slot. Otherwise the table keeps
    // the granule and the slot is refilled if a page is at hand.
    fn destroy_block(&self, addr: u64, end: u64, whole_block: bool) -> Result<()> {
        let block = align_down(addr, level_mapsize(RTT_BLOCK_LEVEL));
        let rtt = self.acquire_delegated(AllocMode::NonBlocking)?;
        if let Err(e) = self.rtt_create(rtt.pa(), block, RTT_MAX_LEVEL) {
            self.release_delegated(rtt)?;
            return Err(e.into());
        }
        let rtt_pa = rtt.pa();
        rtt.hand_over();

        let mut failure = None;
        let mut page = addr;
        while page < end {
            let result = self
                .read_entry(page, RTT_MAX_LEVEL)
                .and_then(|entry| self.destroy_data_granule(page, entry.phys()));
            if let Err(e) = result {
                record(&mut failure, e);
            }
            page += GRANULE_SIZE;
        }

        if whole_block && failure.is_none() {
            self.destroy_free_rtt(rtt_pa, block, RTT_MAX_LEVEL)?;
        } else if !self.has_spare() {
            match self.rme().alloc_delegated(AllocMode::NonBlocking) {
                Ok(g) => self.put_spare(g),
                Err(e) => debug!("Spare slot left empty after split: {:?}", e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Folds the fully populated table below the entry for `addr` at `level` into a single
    /// mapping at `level`, releasing the table granule.
    pub fn fold(&self, addr: u64, level: u8) -> Result<()> {
        let entry = self.read_entry(addr, level)?;
        if entry.walk_level != level || entry.state != RttEntryState::Table {
            return Err(Error::InvalidArgument);
        }
        let rtt = entry.phys();
        api::rtt_fold(
            self.rme().conduit(),
            rtt,
            self.rd_pa()?,
            align_down(addr, level_mapsize(level)),
            level + 1,
        )?;
        // Safety: The folded table came from `acquire_delegated` and the monitor no longer
        // references it.
        let rtt = unsafe { DelegatedGranule::from_phys(rtt) };
        self.release_delegated(rtt)
    }

    // Runs `f` with a spare granule guaranteed if one could be allocated with `mode`, and leaves
    // the slot as it found it.
    fn with_spare<F: FnOnce() -> Result<()>>(&self, mode: AllocMode, f: F) -> Result<()> {
        let mut filled = false;
        if !self.has_spare() {
            match self.rme().alloc_delegated(mode) {
                Ok(g) => {
                    self.put_spare(g);
                    filled = true;
                }
                // Carry on; only a block split needs the spare.
                Err(e) => debug!("No spare granule for teardown: {:?}", e),
            }
        }
        let result = f();
        if filled {
            if let Some(g) = self.take_spare() {
                self.rme().free_delegated(g)?;
            }
        }
        result
    }

    /// Unmaps `[start, start + size)`, clamped to the IPA space. May be called from a
    /// non-blocking context, e.g. with the address space lock held.
    pub fn unmap_range(&self, start: u64, size: u64) -> Result<()> {
        let end = start.saturating_add(size).min(1u64 << self.ia_bits());
        self.with_spare(AllocMode::NonBlocking, || {
            self.destroy_subtree(self.start_level(), start, end)
        })
    }

    /// Tears down every mapping and table below the RTT root.
    pub fn destroy_rtts(&self) -> Result<()> {
        let end = 1u64 << self.ia_bits();
        let result = self.with_spare(AllocMode::Blocking, || {
            self.destroy_subtree(self.start_level(), 0, end)
        });
        if let Err(e) = result {
            warn!("RTT teardown left resources behind: {:?}", e);
        }
        result
    }
}
