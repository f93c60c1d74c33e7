// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Structures shared with the monitor through host memory. Each lives in its own granule and
//! is laid out exactly as the monitor expects, so every field sits at a fixed offset with
//! explicit padding between the groups.

use flagset::{flags, FlagSet};
use static_assertions::const_assert_eq;

/// Number of GPRs, starting from x0, set by the host when a REC is created.
pub const REC_CREATE_NR_GPRS: usize = 8;
/// Maximum number of auxiliary granules per REC.
pub const REC_PARAMS_AUX_GRANULES: usize = 16;
/// Number of GPRs exchanged through the run buffer on entry and exit.
pub const REC_RUN_GPRS: usize = 31;
/// Number of GIC list registers in the run buffer.
pub const REC_GIC_NUM_LRS: usize = 16;

/// Hash algorithm used for the realm measurement.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256 = 0,
    /// SHA-512
    Sha512 = 1,
}

/// Parameters for `RMI_REALM_CREATE`.
#[repr(C)]
pub struct RealmParams {
    pub features_0: u64,
    _padding_1: [u8; 0xf8],
    pub measurement_algo: u8,
    _padding_2: [u8; 0x2ff],
    pub rpv: [u8; 64],
    _padding_3: [u8; 0x3c0],
    pub vmid: u16,
    _padding_4: [u8; 6],
    pub rtt_base: u64,
    pub rtt_level_start: i64,
    pub rtt_num_start: u32,
    _padding_5: [u8; 0x7e4],
}

const_assert_eq!(core::mem::size_of::<RealmParams>(), 0x1000);

impl Default for RealmParams {
    fn default() -> Self {
        Self {
            features_0: 0,
            _padding_1: [0; 0xf8],
            measurement_algo: HashAlgorithm::Sha256 as u8,
            _padding_2: [0; 0x2ff],
            rpv: [0; 64],
            _padding_3: [0; 0x3c0],
            vmid: 0,
            _padding_4: [0; 6],
            rtt_base: 0,
            rtt_level_start: 0,
            rtt_num_start: 0,
            _padding_5: [0; 0x7e4],
        }
    }
}

flags! {
    /// Flags passed in `RecParams::flags`.
    pub enum RecCreateFlags: u64 {
        /// The REC may be entered as soon as the realm is activated.
        Runnable = 1 << 0,
    }
}

/// Parameters for `RMI_REC_CREATE`.
#[repr(C)]
pub struct RecParams {
    pub flags: u64,
    _padding_1: [u8; 0xf8],
    pub mpidr: u64,
    _padding_2: [u8; 0xf8],
    pub pc: u64,
    _padding_3: [u8; 0xf8],
    pub gprs: [u64; REC_CREATE_NR_GPRS],
    _padding_4: [u8; 0x4c0],
    pub num_rec_aux: u64,
    pub aux: [u64; REC_PARAMS_AUX_GRANULES],
}

const_assert_eq!(core::mem::size_of::<RecParams>(), 0x888);

impl RecParams {
    /// Returns parameters for a REC with the given affinity, entry point and initial registers.
    pub fn new(
        mpidr: u64,
        pc: u64,
        gprs: [u64; REC_CREATE_NR_GPRS],
        flags: FlagSet<RecCreateFlags>,
    ) -> Self {
        Self {
            flags: flags.bits(),
            _padding_1: [0; 0xf8],
            mpidr,
            _padding_2: [0; 0xf8],
            pc,
            _padding_3: [0; 0xf8],
            gprs,
            _padding_4: [0; 0x4c0],
            num_rec_aux: 0,
            aux: [0; REC_PARAMS_AUX_GRANULES],
        }
    }
}

flags! {
    /// Flags the host sets in `RecEntry::flags` before entering a REC.
    pub enum RecEntryFlags: u64 {
        /// The host completed an emulated MMIO read; load x0 into the target register.
        EmulatedMmio = 1 << 0,
        /// Inject a synchronous external abort.
        InjectSea = 1 << 1,
        /// Trap WFI executed by the realm.
        TrapWfi = 1 << 2,
        /// Trap WFE executed by the realm.
        TrapWfe = 1 << 3,
    }
}

/// Host-written half of the run buffer.
#[repr(C)]
pub struct RecEntry {
    pub flags: u64,
    _padding_0: [u8; 0x1f8],
    pub gprs: [u64; REC_RUN_GPRS],
    _padding_1: [u8; 0x8],
    pub gicv3_hcr: u64,
    pub gicv3_lrs: [u64; REC_GIC_NUM_LRS],
    _padding_2: [u8; 0x78],
    _padding_3: [u8; 0x400],
}

const_assert_eq!(core::mem::size_of::<RecEntry>(), 0x800);

impl RecEntry {
    /// Returns the entry flags, dropping any bits this crate does not know about.
    pub fn entry_flags(&self) -> FlagSet<RecEntryFlags> {
        FlagSet::new_truncated(self.flags)
    }

    /// Replaces the entry flags.
    pub fn set_entry_flags(&mut self, flags: FlagSet<RecEntryFlags>) {
        self.flags = flags.bits();
    }
}

/// Monitor-written half of the run buffer.
#[repr(C)]
pub struct RecExit {
    pub exit_reason: u8,
    _padding_0: [u8; 0xff],
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    _padding_1: [u8; 0xe8],
    pub gprs: [u64; REC_RUN_GPRS],
    _padding_2: [u8; 0x8],
    pub gicv3_hcr: u64,
    pub gicv3_lrs: [u64; REC_GIC_NUM_LRS],
    pub gicv3_misr: u64,
    pub gicv3_vmcr: u64,
    _padding_3: [u8; 0x68],
    pub cntp_ctl: u64,
    pub cntp_cval: u64,
    pub cntv_ctl: u64,
    pub cntv_cval: u64,
    _padding_4: [u8; 0xe0],
    pub ripas_base: u64,
    pub ripas_size: u64,
    pub ripas_value: u64,
    _padding_5: [u8; 0xe8],
    pub imm: u16,
    _padding_6: [u8; 0xfe],
    pub pmu_ovf: u64,
    pub pmu_intr_en: u64,
    pub pmu_cntr_en: u64,
    _padding_7: [u8; 0xe8],
}

const_assert_eq!(core::mem::size_of::<RecExit>(), 0x800);

/// The run buffer passed to `RMI_REC_ENTER`. Stays host owned; it is never delegated.
#[repr(C)]
pub struct RecRun {
    pub entry: RecEntry,
    pub exit: RecExit,
}

const_assert_eq!(core::mem::size_of::<RecRun>(), 0x1000);

impl Default for RecRun {
    fn default() -> Self {
        // Safety: RecRun is made up entirely of integers and integer arrays, for which an
        // all-zero bit pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}
