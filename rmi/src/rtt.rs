// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

/// Size of a granule, the unit of delegation and of level 3 mappings.
pub const GRANULE_SIZE: u64 = 4096;
/// Finest RTT level; entries at this level map a single granule.
pub const RTT_MAX_LEVEL: u8 = 3;
/// Level at which block mappings are allowed.
pub const RTT_BLOCK_LEVEL: u8 = 2;

/// Returns the number of IPA bits translated below an entry at `level`.
pub const fn level_shift(level: u8) -> u32 {
    // 9 bits are resolved per level on top of the 12 bit granule offset.
    9 * (4 - level as u32) + 3
}

/// Returns the size of the region mapped by one entry at `level`.
pub const fn level_mapsize(level: u8) -> u64 {
    1 << level_shift(level)
}

// Content measurement flags for `RMI_DATA_CREATE`.
pub const RMI_NO_MEASURE_CONTENT: u64 = 0;
pub const RMI_MEASURE_CONTENT: u64 = 1;

/// State of an RTT entry as reported by `RMI_RTT_READ_ENTRY`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RttEntryState {
    /// Nothing mapped.
    Unassigned = 0,
    /// Previously held protected data that has been destroyed.
    Destroyed = 1,
    /// Protected data granule or block.
    Assigned = 2,
    /// Points to a next level table.
    Table = 3,
    /// Unprotected (non-secure) mapping.
    ValidNs = 4,
}

impl RttEntryState {
    /// Parses an entry state from the low byte of a register.
    pub fn from_reg(reg: u64) -> Option<Self> {
        use RttEntryState::*;
        match reg & 0xff {
            0 => Some(Unassigned),
            1 => Some(Destroyed),
            2 => Some(Assigned),
            3 => Some(Table),
            4 => Some(ValidNs),
            _ => None,
        }
    }
}

/// Realm IPA state.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ripas {
    /// The realm does not consider the memory its own.
    Empty = 0,
    /// Protected RAM.
    Ram = 1,
}

impl Ripas {
    /// Parses a RIPAS value from the lowest bit of a register.
    pub fn from_reg(reg: u64) -> Self {
        if reg & 1 == 0 {
            Ripas::Empty
        } else {
            Ripas::Ram
        }
    }
}

/// An RTT entry as returned by `RMI_RTT_READ_ENTRY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEntry {
    /// Level at which the walk terminated.
    pub walk_level: u8,
    /// State of the entry.
    pub state: RttEntryState,
    /// Raw descriptor.
    pub desc: u64,
    /// RIPAS of the entry.
    pub ripas: Ripas,
}

const RTT_DESC_ADDR_MASK: u64 = ((1 << 48) - 1) & !(GRANULE_SIZE - 1);

impl RttEntry {
    /// Returns the output address held in the descriptor.
    pub fn phys(&self) -> u64 {
        self.desc & RTT_DESC_ADDR_MASK
    }
}

// Lower attribute fields of a stage 2 block or page descriptor.
const S2TTE_ATTR_FWB_NORMAL_WB: u64 = 6 << 2;
const S2TTE_AP_RW: u64 = 3 << 6;
const S2TTE_SH_IS: u64 = 3 << 8;

/// Builds the descriptor for an unprotected mapping of the host granule at `pa`: normal
/// write-back memory, read-write, inner shareable.
pub fn unprotected_desc(pa: u64) -> u64 {
    pa | S2TTE_ATTR_FWB_NORMAL_WB | S2TTE_AP_RW | S2TTE_SH_IS
}
