// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use core::arch::asm;

use crate::error::*;
use crate::function::RmiFunction;

/// Result registers x0..x4 of an SMC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmcRegs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
}

/// A channel to the realm management monitor.
pub trait RmiConduit {
    /// Issues the call `fid` with arguments x1..x6 and returns x0..x4.
    ///
    /// # Safety
    ///
    /// Any host memory named by the arguments must be valid for the monitor to access as the
    /// command specifies: granules passed for delegation must not be accessed by the host again
    /// until undelegated, and buffers the monitor writes must be uniquely owned by the caller.
    unsafe fn smc(&self, fid: u64, args: [u64; 6]) -> SmcRegs;
}

/// Issues `func` over `conduit`, decoding the status word in x0.
///
/// # Safety
///
/// See `RmiConduit::smc`.
pub unsafe fn rmi_call<C: RmiConduit + ?Sized>(conduit: &C, func: RmiFunction) -> Result<SmcRegs> {
    let regs = conduit.smc(func.fid(), func.args());
    Error::check_status(regs.a0)?;
    Ok(regs)
}

/// The SMC conduit to the monitor running at EL3.
#[derive(Clone, Copy, Debug, Default)]
pub struct SmcConduit;

impl RmiConduit for SmcConduit {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe fn smc(&self, fid: u64, args: [u64; 6]) -> SmcRegs {
        let (a0, a1, a2, a3, a4);
        asm!("smc #0",
            inlateout("x0") fid => a0,
            inlateout("x1") args[0] => a1,
            inlateout("x2") args[1] => a2,
            inlateout("x3") args[2] => a3,
            inlateout("x4") args[3] => a4,
            inlateout("x5") args[4] => _,
            inlateout("x6") args[5] => _,
            lateout("x7") _, lateout("x8") _, lateout("x9") _, lateout("x10") _,
            lateout("x11") _, lateout("x12") _, lateout("x13") _, lateout("x14") _,
            lateout("x15") _, lateout("x16") _, lateout("x17") _,
            options(nostack));
        SmcRegs { a0, a1, a2, a3, a4 }
    }

    // There's no monitor beneath hosted builds; report the function as unimplemented.
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    unsafe fn smc(&self, _fid: u64, _args: [u64; 6]) -> SmcRegs {
        SmcRegs {
            a0: SMCCC_RET_NOT_SUPPORTED,
            ..Default::default()
        }
    }
}
