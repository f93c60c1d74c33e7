// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Populating a realm's address space: protected data granules, unprotected mappings of host pages
//! and the RIPAS of protected ranges.

use log::{debug, warn};
use rmi::{
    api, level_mapsize, unprotected_desc, Ripas, RmiConduit, RttEntryState, GRANULE_SIZE,
    RMI_MEASURE_CONTENT, RTT_BLOCK_LEVEL, RTT_MAX_LEVEL,
};

use crate::granule::DelegatedGranule;
use crate::host_mem::{AllocMode, HostMemory};
use crate::realm::{Realm, RealmState};
use crate::rec::Rec;
use crate::rtt::is_aligned;
use crate::stage2::Stage2;
use crate::{Error, Result};

// How the content of a new protected granule is produced.
#[derive(Clone, Copy)]
enum DataSource<'s> {
    // Copied and measured from host pages.
    Measured(&'s [u8]),
    // Left for the monitor to fill, unmeasured.
    Unknown,
}

// The outcome of creating one protected granule.
enum Created {
    New,
    // The entry was already mapped, e.g. by a racing thread doing the same population.
    AlreadyMapped,
}

/// Returns the RTT level for mappings of `size` bytes, which must be a page or a block.
fn map_level(size: u64) -> Result<u8> {
    if size == GRANULE_SIZE {
        Ok(RTT_MAX_LEVEL)
    } else if size == level_mapsize(RTT_BLOCK_LEVEL) {
        Ok(RTT_BLOCK_LEVEL)
    } else {
        Err(Error::InvalidArgument)
    }
}

impl<'a, C: RmiConduit, H: HostMemory, S: Stage2> Realm<'a, C, H, S> {
    fn check_protected_range(&self, ipa: u64, size: u64) -> Result<()> {
        let last = ipa.checked_add(size - 1).ok_or(Error::InvalidArgument)?;
        if !is_aligned(ipa, size) || !self.is_addr_protected(last) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Copies `src` into newly delegated granules mapped at `ipa`, extending the realm's
    /// measurement. `src` must be page aligned and either a page or a block long, and `ipa` must be
    /// aligned to that size. A block is folded into a single mapping once all of its pages exist.
    ///
    /// Populating the same range again succeeds without delegating anything.
    pub fn populate_protected(&self, ipa: u64, src: &[u8]) -> Result<()> {
        if self.state() != RealmState::New {
            return Err(Error::Busy);
        }
        if !is_aligned(src.as_ptr() as u64, GRANULE_SIZE) {
            return Err(Error::InvalidArgument);
        }
        self.map_protected(ipa, src.len() as u64, DataSource::Measured(src), AllocMode::Blocking)
    }

    /// Maps newly delegated granules of unknown content at `ipa`, e.g. on a realm's first touch of
    /// a protected page. `size` is a page or a block. May be called from a non-blocking context.
    pub fn map_protected_unknown(&self, ipa: u64, size: u64) -> Result<()> {
        match self.state() {
            RealmState::New | RealmState::Active => (),
            _ => return Err(Error::Busy),
        }
        self.map_protected(ipa, size, DataSource::Unknown, AllocMode::NonBlocking)
    }

    fn map_protected(
        &self,
        ipa: u64,
        size: u64,
        source: DataSource,
        mode: AllocMode,
    ) -> Result<()> {
        let level = map_level(size)?;
        self.check_protected_range(ipa, size)?;
        self.precreate_levels(ipa, mode);

        // One bit per page this call created.
        let mut created = [0u64; 8];
        let mut offset = 0;
        while offset < size {
            let index = (offset / GRANULE_SIZE) as usize;
            match self.create_data_granule(ipa + offset, source, offset, mode) {
                Ok(Created::New) => created[index / 64] |= 1 << (index % 64),
                Ok(Created::AlreadyMapped) => (),
                Err(e) => {
                    self.rollback_protected(ipa, &created);
                    return Err(match e {
                        Error::Rmi(_) => Error::RttProtocol,
                        e => e,
                    });
                }
            }
            offset += GRANULE_SIZE;
        }
        debug!(
            "Mapped {} new protected pages at {:#x}",
            created.iter().map(|w| w.count_ones()).sum::<u32>(),
            ipa
        );

        if level == RTT_BLOCK_LEVEL {
            self.fold_block(ipa);
        }
        Ok(())
    }

    // Creates the missing tables down to the page level ahead of the main loop. Failures are
    // picked up again, and reported, when the data granules are created.
    fn precreate_levels(&self, ipa: u64, mode: AllocMode) {
        let entry = match self.read_entry(ipa, RTT_MAX_LEVEL) {
            Ok(entry) => entry,
            Err(_) => return,
        };
        let empty = matches!(
            entry.state,
            RttEntryState::Unassigned | RttEntryState::Destroyed
        );
        if entry.walk_level < RTT_MAX_LEVEL && empty {
            if let Err(e) = self.create_levels(ipa, entry.walk_level, RTT_MAX_LEVEL, mode) {
                debug!("Precreating tables for {:#x} failed: {:?}", ipa, e);
            }
        }
    }

    fn create_data_granule(
        &self,
        ipa: u64,
        source: DataSource,
        offset: u64,
        mode: AllocMode,
    ) -> Result<Created> {
        let rme = self.rme();
        let rd = self.rd_pa()?;
        let data = rme.alloc_delegated(mode)?;
        let mut retried = false;
        loop {
            let result = match source {
                DataSource::Measured(src) => {
                    let src_pa = rme
                        .mem()
                        .virt_to_phys(src[offset as usize..].as_ptr());
                    // Safety: `src_pa` backs the readable host page borrowed from `src`.
                    unsafe {
                        api::data_create(
                            rme.conduit(),
                            data.pa(),
                            rd,
                            ipa,
                            src_pa,
                            RMI_MEASURE_CONTENT,
                        )
                    }
                }
                DataSource::Unknown => {
                    api::data_create_unknown(rme.conduit(), data.pa(), rd, ipa)
                }
            };
            let err = match result {
                Ok(()) => {
                    data.hand_over();
                    return Ok(Created::New);
                }
                Err(e) => e,
            };
            if err.rtt_level().is_none() {
                rme.free_delegated(data)?;
                return Err(err.into());
            }

            let entry = match self.read_entry(ipa, RTT_MAX_LEVEL) {
                Ok(entry) => entry,
                Err(e) => {
                    rme.free_delegated(data)?;
                    return Err(e);
                }
            };
            if entry.state == RttEntryState::Assigned {
                rme.free_delegated(data)?;
                return Ok(Created::AlreadyMapped);
            }
            if retried || entry.walk_level >= RTT_MAX_LEVEL {
                rme.free_delegated(data)?;
                return Err(if retried {
                    Error::RttProtocol
                } else {
                    err.into()
                });
            }
            debug!(
                "Creating tables for {:#x} from level {}",
                ipa, entry.walk_level
            );
            if let Err(e) = self.create_levels(ipa, entry.walk_level, RTT_MAX_LEVEL, mode) {
                rme.free_delegated(data)?;
                return Err(e);
            }
            retried = true;
        }
    }

    // Destroys the pages marked in `created`, counting from `ipa`.
    fn rollback_protected(&self, ipa: u64, created: &[u64; 8]) {
        for index in 0..created.len() * 64 {
            if created[index / 64] & (1 << (index % 64)) == 0 {
                continue;
            }
            let addr = ipa + index as u64 * GRANULE_SIZE;
            let result = self.read_entry(addr, RTT_MAX_LEVEL).and_then(|entry| {
                api::data_destroy(self.rme().conduit(), self.rd_pa()?, addr)?;
                // Safety: The granule was delegated and mapped by this call, and the monitor has
                // released it.
                let data = unsafe { DelegatedGranule::from_phys(entry.phys()) };
                self.rme().free_delegated(data)
            });
            if let Err(e) = result {
                warn!("Failed to roll back protected page {:#x}: {:?}", addr, e);
            }
        }
    }

    // Folds a fully mapped block. The pages stay mapped individually if the monitor refuses.
    fn fold_block(&self, ipa: u64) {
        match self.read_entry(ipa, RTT_BLOCK_LEVEL) {
            Ok(entry) if entry.state == RttEntryState::Table => {
                if let Err(e) = self.fold(ipa, RTT_BLOCK_LEVEL) {
                    warn!("Failed to fold block at {:#x}: {:?}", ipa, e);
                }
            }
            _ => (),
        }
    }

    /// Maps the host memory at `pa` into the unprotected half of the IPA space at `ipa`. `size` is a
    /// page or a block, and both addresses must be aligned to it.
    ///
    /// # Safety
    ///
    /// The realm can read and write the memory at `pa` until it is unmapped, so the caller must
    /// keep it allocated and must not rely on its contents.
    pub unsafe fn populate_shared(
        &self,
        ipa: u64,
        pa: u64,
        size: u64,
        mode: AllocMode,
    ) -> Result<()> {
        match self.state() {
            RealmState::New | RealmState::Active => (),
            _ => return Err(Error::Busy),
        }
        let level = map_level(size)?;
        if !is_aligned(ipa, size) || !is_aligned(pa, size) || self.is_addr_protected(ipa) {
            return Err(Error::InvalidArgument);
        }
        if ipa.checked_add(size).map_or(true, |end| end > 1 << self.ia_bits()) {
            return Err(Error::InvalidArgument);
        }

        let desc = unprotected_desc(pa);
        let rd = self.rd_pa()?;
        let conduit = self.rme().conduit();
        let mut retried = false;
        loop {
            let err = match api::rtt_map_unprotected(conduit, rd, ipa, level, desc) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            match err.rtt_level() {
                Some(walk_level) if walk_level < level => {
                    if retried {
                        return Err(Error::RttProtocol);
                    }
                    self.create_levels(ipa, walk_level, level, mode)?;
                    retried = true;
                }
                _ => return Err(err.into()),
            }
        }
    }

    // Returns the coarsest level at which `[start, end)` can be updated starting at `start`.
    fn find_map_level(&self, start: u64, end: u64) -> u8 {
        let mut level = RTT_MAX_LEVEL;
        while level > self.start_level() + 1 {
            let map_size = level_mapsize(level - 1);
            if !is_aligned(start, map_size) || start + map_size > end {
                break;
            }
            level -= 1;
        }
        level
    }

    fn check_ripas_range(&self, start: u64, end: u64) -> Result<()> {
        if start >= end
            || !is_aligned(start, GRANULE_SIZE)
            || !is_aligned(end, GRANULE_SIZE)
            || !self.is_addr_protected(end - 1)
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    // Applies `op` to `[start, end)` at the coarsest levels possible. A missing table above the
    // chosen level is created and the call retried once; a table at the chosen level means smaller
    // mappings exist there, so the range is split one level further. Tables are allocated with
    // `mode`.
    fn walk_ripas<F>(
        &self,
        start: u64,
        end: u64,
        min_level: u8,
        mode: AllocMode,
        op: &F,
    ) -> Result<()>
    where
        F: Fn(u64, u8) -> rmi::Result<()>,
    {
        let mut addr = start;
        while addr < end {
            let level = self.find_map_level(addr, end).max(min_level);
            let next = (addr + level_mapsize(level)).min(end);
            let mut retried = false;
            loop {
                let err = match op(addr, level) {
                    Ok(()) => break,
                    Err(e) => e,
                };
                match err.rtt_level() {
                    Some(walk_level) if walk_level < level => {
                        if retried {
                            return Err(Error::RttProtocol);
                        }
                        self.create_levels(addr, walk_level, level, mode)?;
                        retried = true;
                    }
                    Some(_) if level < RTT_MAX_LEVEL => {
                        self.walk_ripas(addr, next, level + 1, mode, op)?;
                        break;
                    }
                    _ => return Err(err.into()),
                }
            }
            addr = next;
        }
        Ok(())
    }

    /// Sets the RIPAS of `[start, end)` to RAM before the realm is activated. Nothing may be mapped
    /// in the range yet.
    pub fn init_isolation_state(&self, start: u64, end: u64) -> Result<()> {
        if self.state() != RealmState::New {
            return Err(Error::Busy);
        }
        self.check_ripas_range(start, end)?;
        let rd = self.rd_pa()?;
        self.walk_ripas(start, end, 0, AllocMode::Blocking, &|addr, level| {
            api::rtt_init_ripas(self.rme().conduit(), rd, addr, level)
        })
    }

    /// Sets the RIPAS of `[start, end)` on behalf of `rec`, which requested the change. Any content
    /// mapped in a range that becomes `Empty` is destroyed.
    ///
    /// Runs on the REC exit path, so missing tables are only allocated if memory is at hand.
    pub fn set_isolation_state(
        &self,
        rec: &Rec<'_, 'a, C, H, S>,
        start: u64,
        end: u64,
        ripas: Ripas,
    ) -> Result<()> {
        match self.state() {
            RealmState::New | RealmState::Active => (),
            _ => return Err(Error::Busy),
        }
        self.check_ripas_range(start, end)?;
        let rd = self.rd_pa()?;
        let rec_pa = rec.pa();
        self.walk_ripas(start, end, 0, AllocMode::NonBlocking, &|addr, level| {
            api::rtt_set_ripas(self.rme().conduit(), rd, rec_pa, addr, level, ripas)
        })?;
        if ripas == Ripas::Empty {
            self.unmap_range(start, end - start)?;
        }
        Ok(())
    }
}
