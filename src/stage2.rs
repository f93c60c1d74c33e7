// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

/// The host's second stage address space for a realm. The pages of its top level table are
/// delegated in place and become the root of the realm's RTT.
pub trait Stage2 {
    /// Returns the width of the IPA space.
    fn ia_bits(&self) -> u32;

    /// Returns the level of the top level table.
    fn start_level(&self) -> u8;

    /// Returns the physical address of the first page of the top level table.
    fn pgd_phys(&self) -> u64;

    /// Returns the number of contiguous pages in the top level table.
    fn pgd_pages(&self) -> usize {
        pgd_pages(self.ia_bits(), self.start_level())
    }

    /// Frees the address space. Called once the top level pages are no longer delegated.
    fn teardown(self);
}

/// Returns the number of concatenated pages needed for a top level table at `start_level`
/// covering `ia_bits` of IPA space.
pub fn pgd_pages(ia_bits: u32, start_level: u8) -> usize {
    // One page at `start_level` resolves the bits below the level above it.
    let shift = 9 * (5 - start_level as u32) + 3;
    let mask = if ia_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << ia_bits) - 1
    };
    let last = if shift >= 64 { 0 } else { mask >> shift };
    last as usize + 1
}
