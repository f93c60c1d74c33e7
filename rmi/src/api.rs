// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Typed wrappers for each RMI command. None of them retries; callers decide how to recover from
//! each error class.

use crate::RmiFunction::*;
use crate::{rmi_call, Error, Result, RmiConduit, RttEntry, RttEntryState, Ripas};

/// Interface version reported by `RMI_VERSION`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RmiVersion {
    pub major: u16,
    pub minor: u16,
}

impl RmiVersion {
    /// Splits a raw version word.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xffff) as u16,
        }
    }

    /// Returns the raw version word.
    pub fn to_raw(self) -> u64 {
        ((self.major as u64) << 16) | self.minor as u64
    }
}

/// The interface version this crate implements.
pub const RMI_ABI_VERSION: RmiVersion = RmiVersion { major: 1, minor: 0 };

/// Returns the interface version implemented by the monitor.
pub fn version<C: RmiConduit + ?Sized>(c: &C) -> Result<RmiVersion> {
    let func = Version;
    // Safety: RMI_VERSION doesn't access any memory.
    let regs = unsafe { c.smc(func.fid(), func.args()) };
    // x0 carries the version rather than a status word.
    if regs.a0 == crate::SMCCC_RET_NOT_SUPPORTED {
        return Err(Error::NotSupported);
    }
    Ok(RmiVersion::from_raw(regs.a0))
}

/// Reads feature register `index`.
pub fn features<C: RmiConduit + ?Sized>(c: &C, index: u64) -> Result<u64> {
    // Safety: RMI_FEATURES doesn't access any host memory.
    let regs = unsafe { rmi_call(c, Features { index }) }?;
    Ok(regs.a1)
}

/// Delegates the granule at `addr` to the monitor.
///
/// # Safety
///
/// The host must not access the granule until it has been successfully undelegated.
pub unsafe fn granule_delegate<C: RmiConduit + ?Sized>(c: &C, addr: u64) -> Result<()> {
    rmi_call(c, GranuleDelegate { addr })?;
    Ok(())
}

/// Undelegates the granule at `addr`, returning it to the host.
pub fn granule_undelegate<C: RmiConduit + ?Sized>(c: &C, addr: u64) -> Result<()> {
    // Safety: The granule becomes accessible to the host again, which is safe since the host
    // gave up all access to it when it was delegated.
    unsafe { rmi_call(c, GranuleUndelegate { addr }) }?;
    Ok(())
}

/// Creates a protected data granule at `ipa` from the host granule `src`.
///
/// # Safety
///
/// `src` must be the address of a readable host granule.
pub unsafe fn data_create<C: RmiConduit + ?Sized>(
    c: &C,
    data: u64,
    rd: u64,
    ipa: u64,
    src: u64,
    flags: u64,
) -> Result<()> {
    rmi_call(
        c,
        DataCreate {
            data,
            rd,
            ipa,
            src,
            flags,
        },
    )?;
    Ok(())
}

/// Creates a protected data granule at `ipa` with unknown content.
pub fn data_create_unknown<C: RmiConduit + ?Sized>(
    c: &C,
    data: u64,
    rd: u64,
    ipa: u64,
) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, DataCreateUnknown { data, rd, ipa }) }?;
    Ok(())
}

/// Destroys the protected data granule at `ipa`.
pub fn data_destroy<C: RmiConduit + ?Sized>(c: &C, rd: u64, ipa: u64) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, DataDestroy { rd, ipa }) }?;
    Ok(())
}

/// Activates the realm.
pub fn realm_activate<C: RmiConduit + ?Sized>(c: &C, rd: u64) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, RealmActivate { rd }) }?;
    Ok(())
}

/// Creates a realm descriptor in `rd`.
///
/// # Safety
///
/// `params` must be the address of an initialized `RealmParams` in host memory.
pub unsafe fn realm_create<C: RmiConduit + ?Sized>(c: &C, rd: u64, params: u64) -> Result<()> {
    rmi_call(c, RealmCreate { rd, params })?;
    Ok(())
}

/// Destroys the realm descriptor in `rd`.
pub fn realm_destroy<C: RmiConduit + ?Sized>(c: &C, rd: u64) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, RealmDestroy { rd }) }?;
    Ok(())
}

/// Returns the number of auxiliary granules each REC of the realm needs.
pub fn rec_aux_count<C: RmiConduit + ?Sized>(c: &C, rd: u64) -> Result<u64> {
    // Safety: Only delegated granules are named.
    let regs = unsafe { rmi_call(c, RecAuxCount { rd }) }?;
    Ok(regs.a1)
}

/// Creates a REC in `rec`.
///
/// # Safety
///
/// `params` must be the address of an initialized `RecParams` in host memory.
pub unsafe fn rec_create<C: RmiConduit + ?Sized>(
    c: &C,
    rec: u64,
    rd: u64,
    params: u64,
) -> Result<()> {
    rmi_call(c, RecCreate { rec, rd, params })?;
    Ok(())
}

/// Destroys the REC in `rec`.
pub fn rec_destroy<C: RmiConduit + ?Sized>(c: &C, rec: u64) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, RecDestroy { rec }) }?;
    Ok(())
}

/// Enters the REC in `rec`.
///
/// # Safety
///
/// `run` must be the address of a `RecRun` in host memory that is uniquely owned by the caller
/// for the duration of the call.
pub unsafe fn rec_enter<C: RmiConduit + ?Sized>(c: &C, rec: u64, run: u64) -> Result<()> {
    rmi_call(c, RecEnter { rec, run })?;
    Ok(())
}

/// Completes a PSCI request.
pub fn psci_complete<C: RmiConduit + ?Sized>(
    c: &C,
    calling_rec: u64,
    target_rec: u64,
) -> Result<()> {
    // Safety: Only delegated granules are named.
    unsafe {
        rmi_call(
            c,
            PsciComplete {
                calling_rec,
                target_rec,
            },
        )
    }?;
    Ok(())
}

/// Creates an RTT at `level` using the delegated granule `rtt`.
pub fn rtt_create<C: RmiConduit + ?Sized>(
    c: &C,
    rtt: u64,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<()> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    unsafe {
        rmi_call(
            c,
            RttCreate {
                rtt,
                rd,
                ipa,
                level,
            },
        )
    }?;
    Ok(())
}

/// Destroys the RTT at `level` held in `rtt`.
pub fn rtt_destroy<C: RmiConduit + ?Sized>(
    c: &C,
    rtt: u64,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<()> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    unsafe {
        rmi_call(
            c,
            RttDestroy {
                rtt,
                rd,
                ipa,
                level,
            },
        )
    }?;
    Ok(())
}

/// Folds the RTT at `level` held in `rtt` into its parent entry.
pub fn rtt_fold<C: RmiConduit + ?Sized>(
    c: &C,
    rtt: u64,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<()> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    unsafe {
        rmi_call(
            c,
            RttFold {
                rtt,
                rd,
                ipa,
                level,
            },
        )
    }?;
    Ok(())
}

/// Maps the host memory described by `desc` as unprotected at `ipa`.
pub fn rtt_map_unprotected<C: RmiConduit + ?Sized>(
    c: &C,
    rd: u64,
    ipa: u64,
    level: u8,
    desc: u64,
) -> Result<()> {
    let level = level as u64;
    // Safety: Unprotected memory remains host owned and the host keeps access to it.
    unsafe {
        rmi_call(
            c,
            RttMapUnprotected {
                rd,
                ipa,
                level,
                desc,
            },
        )
    }?;
    Ok(())
}

/// Removes the unprotected mapping at `ipa`.
pub fn rtt_unmap_unprotected<C: RmiConduit + ?Sized>(
    c: &C,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<()> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, RttUnmapUnprotected { rd, ipa, level }) }?;
    Ok(())
}

/// Reads the RTT entry for `ipa` at `level`.
pub fn rtt_read_entry<C: RmiConduit + ?Sized>(
    c: &C,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<RttEntry> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    let regs = unsafe { rmi_call(c, RttReadEntry { rd, ipa, level }) }?;
    let state = RttEntryState::from_reg(regs.a2).ok_or(Error::Unknown(regs.a2))?;
    Ok(RttEntry {
        walk_level: regs.a1 as u8,
        state,
        desc: regs.a3,
        ripas: Ripas::from_reg(regs.a4),
    })
}

/// Sets the initial RIPAS of the entry for `ipa` at `level` to RAM.
pub fn rtt_init_ripas<C: RmiConduit + ?Sized>(
    c: &C,
    rd: u64,
    ipa: u64,
    level: u8,
) -> Result<()> {
    let level = level as u64;
    // Safety: Only delegated granules are named.
    unsafe { rmi_call(c, RttInitRipas { rd, ipa, level }) }?;
    Ok(())
}

/// Sets the RIPAS of the entry for `ipa` at `level` on behalf of `rec`.
pub fn rtt_set_ripas<C: RmiConduit + ?Sized>(
    c: &C,
    rd: u64,
    rec: u64,
    ipa: u64,
    level: u8,
    ripas: Ripas,
) -> Result<()> {
    let level = level as u64;
    let ripas = ripas as u64;
    // Safety: Only delegated granules are named.
    unsafe {
        rmi_call(
            c,
            RttSetRipas {
                rd,
                rec,
                ipa,
                level,
                ripas,
            },
        )
    }?;
    Ok(())
}
