// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::*;

/// Builds an SMCCC fast call function ID for a 64-bit standard secure service.
const fn smc_rxi_call(func: u64) -> u64 {
    (1 << 31) | (1 << 30) | (4 << 24) | func
}

pub const SMC_RMI_VERSION: u64 = smc_rxi_call(0x0150);
pub const SMC_RMI_GRANULE_DELEGATE: u64 = smc_rxi_call(0x0151);
pub const SMC_RMI_GRANULE_UNDELEGATE: u64 = smc_rxi_call(0x0152);
pub const SMC_RMI_DATA_CREATE: u64 = smc_rxi_call(0x0153);
pub const SMC_RMI_DATA_CREATE_UNKNOWN: u64 = smc_rxi_call(0x0154);
pub const SMC_RMI_DATA_DESTROY: u64 = smc_rxi_call(0x0155);
pub const SMC_RMI_REALM_ACTIVATE: u64 = smc_rxi_call(0x0157);
pub const SMC_RMI_REALM_CREATE: u64 = smc_rxi_call(0x0158);
pub const SMC_RMI_REALM_DESTROY: u64 = smc_rxi_call(0x0159);
pub const SMC_RMI_REC_CREATE: u64 = smc_rxi_call(0x015a);
pub const SMC_RMI_REC_DESTROY: u64 = smc_rxi_call(0x015b);
pub const SMC_RMI_REC_ENTER: u64 = smc_rxi_call(0x015c);
pub const SMC_RMI_RTT_CREATE: u64 = smc_rxi_call(0x015d);
pub const SMC_RMI_RTT_DESTROY: u64 = smc_rxi_call(0x015e);
pub const SMC_RMI_RTT_MAP_UNPROTECTED: u64 = smc_rxi_call(0x015f);
pub const SMC_RMI_RTT_READ_ENTRY: u64 = smc_rxi_call(0x0161);
pub const SMC_RMI_RTT_UNMAP_UNPROTECTED: u64 = smc_rxi_call(0x0162);
pub const SMC_RMI_PSCI_COMPLETE: u64 = smc_rxi_call(0x0164);
pub const SMC_RMI_FEATURES: u64 = smc_rxi_call(0x0165);
pub const SMC_RMI_RTT_FOLD: u64 = smc_rxi_call(0x0166);
pub const SMC_RMI_REC_AUX_COUNT: u64 = smc_rxi_call(0x0167);
pub const SMC_RMI_RTT_INIT_RIPAS: u64 = smc_rxi_call(0x0168);
pub const SMC_RMI_RTT_SET_RIPAS: u64 = smc_rxi_call(0x0169);

/// Realm Management Interface commands. Arguments are listed in the order they are passed in
/// x1..x6; the function ID goes in x0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmiFunction {
    /// Returns the interface version implemented by the monitor in x0.
    Version,
    /// Transfers ownership of a granule to the monitor.
    GranuleDelegate {
        /// x1 = physical address of the granule
        addr: u64,
    },
    /// Returns ownership of a delegated granule to the host.
    GranuleUndelegate {
        /// x1 = physical address of the granule
        addr: u64,
    },
    /// Creates a protected data granule at `ipa`, copying its initial content from `src`.
    DataCreate {
        /// x1 = delegated destination granule
        data: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = IPA to map the granule at
        ipa: u64,
        /// x4 = host source granule
        src: u64,
        /// x5 = `RMI_MEASURE_CONTENT` or `RMI_NO_MEASURE_CONTENT`
        flags: u64,
    },
    /// Creates a protected data granule with unknown content.
    DataCreateUnknown {
        /// x1 = delegated destination granule
        data: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = IPA to map the granule at
        ipa: u64,
    },
    /// Destroys the protected data granule mapped at `ipa`.
    DataDestroy {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = IPA of the granule
        ipa: u64,
    },
    /// Moves a realm from NEW to ACTIVE.
    RealmActivate {
        /// x1 = realm descriptor
        rd: u64,
    },
    /// Creates a realm descriptor.
    RealmCreate {
        /// x1 = delegated granule to hold the descriptor
        rd: u64,
        /// x2 = physical address of a `RealmParams`
        params: u64,
    },
    /// Destroys a realm descriptor.
    RealmDestroy {
        /// x1 = realm descriptor
        rd: u64,
    },
    /// Creates a REC.
    RecCreate {
        /// x1 = delegated granule to hold the REC
        rec: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = physical address of a `RecParams`
        params: u64,
    },
    /// Destroys a REC.
    RecDestroy {
        /// x1 = REC
        rec: u64,
    },
    /// Enters a REC.
    RecEnter {
        /// x1 = REC
        rec: u64,
        /// x2 = physical address of the `RecRun` buffer
        run: u64,
    },
    /// Creates an RTT at `level` covering `ipa`.
    RttCreate {
        /// x1 = delegated granule to hold the table
        rtt: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = IPA, aligned to the parent entry's span
        ipa: u64,
        /// x4 = level of the new table
        level: u64,
    },
    /// Destroys the RTT at `level` covering `ipa`.
    RttDestroy {
        /// x1 = the table granule
        rtt: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = IPA, aligned to the parent entry's span
        ipa: u64,
        /// x4 = level of the table
        level: u64,
    },
    /// Maps a host granule as unprotected memory.
    RttMapUnprotected {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = IPA
        ipa: u64,
        /// x3 = level of the mapping
        level: u64,
        /// x4 = stage 2 descriptor
        desc: u64,
    },
    /// Reads the RTT entry at `level` for `ipa`.
    RttReadEntry {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = IPA
        ipa: u64,
        /// x3 = level of the entry
        level: u64,
    },
    /// Removes an unprotected mapping.
    RttUnmapUnprotected {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = IPA
        ipa: u64,
        /// x3 = level of the mapping
        level: u64,
    },
    /// Completes a PSCI request made by `calling_rec` that targets `target_rec`.
    PsciComplete {
        /// x1 = calling REC
        calling_rec: u64,
        /// x2 = target REC
        target_rec: u64,
    },
    /// Returns feature register `index` in x1.
    Features {
        /// x1 = feature register index
        index: u64,
    },
    /// Folds the fully populated RTT at `level` back into its parent entry.
    RttFold {
        /// x1 = the table granule
        rtt: u64,
        /// x2 = realm descriptor
        rd: u64,
        /// x3 = IPA, aligned to the parent entry's span
        ipa: u64,
        /// x4 = level of the table
        level: u64,
    },
    /// Returns the number of auxiliary granules each REC of the realm needs in x1.
    RecAuxCount {
        /// x1 = realm descriptor
        rd: u64,
    },
    /// Sets the RIPAS of an unassigned entry to RAM before activation.
    RttInitRipas {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = IPA
        ipa: u64,
        /// x3 = level of the entry
        level: u64,
    },
    /// Sets the RIPAS of an entry in response to a REC's request.
    RttSetRipas {
        /// x1 = realm descriptor
        rd: u64,
        /// x2 = REC that requested the change
        rec: u64,
        /// x3 = IPA
        ipa: u64,
        /// x4 = level of the entry
        level: u64,
        /// x5 = requested RIPAS value
        ripas: u64,
    },
}

impl RmiFunction {
    /// Returns the SMCCC function ID placed in x0.
    pub fn fid(&self) -> u64 {
        use RmiFunction::*;
        match self {
            Version => SMC_RMI_VERSION,
            GranuleDelegate { .. } => SMC_RMI_GRANULE_DELEGATE,
            GranuleUndelegate { .. } => SMC_RMI_GRANULE_UNDELEGATE,
            DataCreate { .. } => SMC_RMI_DATA_CREATE,
            DataCreateUnknown { .. } => SMC_RMI_DATA_CREATE_UNKNOWN,
            DataDestroy { .. } => SMC_RMI_DATA_DESTROY,
            RealmActivate { .. } => SMC_RMI_REALM_ACTIVATE,
            RealmCreate { .. } => SMC_RMI_REALM_CREATE,
            RealmDestroy { .. } => SMC_RMI_REALM_DESTROY,
            RecCreate { .. } => SMC_RMI_REC_CREATE,
            RecDestroy { .. } => SMC_RMI_REC_DESTROY,
            RecEnter { .. } => SMC_RMI_REC_ENTER,
            RttCreate { .. } => SMC_RMI_RTT_CREATE,
            RttDestroy { .. } => SMC_RMI_RTT_DESTROY,
            RttMapUnprotected { .. } => SMC_RMI_RTT_MAP_UNPROTECTED,
            RttReadEntry { .. } => SMC_RMI_RTT_READ_ENTRY,
            RttUnmapUnprotected { .. } => SMC_RMI_RTT_UNMAP_UNPROTECTED,
            PsciComplete { .. } => SMC_RMI_PSCI_COMPLETE,
            Features { .. } => SMC_RMI_FEATURES,
            RttFold { .. } => SMC_RMI_RTT_FOLD,
            RecAuxCount { .. } => SMC_RMI_REC_AUX_COUNT,
            RttInitRipas { .. } => SMC_RMI_RTT_INIT_RIPAS,
            RttSetRipas { .. } => SMC_RMI_RTT_SET_RIPAS,
        }
    }

    /// Returns the values to be placed in x1..x6.
    pub fn args(&self) -> [u64; 6] {
        use RmiFunction::*;
        match *self {
            Version => [0; 6],
            GranuleDelegate { addr } | GranuleUndelegate { addr } => [addr, 0, 0, 0, 0, 0],
            DataCreate {
                data,
                rd,
                ipa,
                src,
                flags,
            } => [data, rd, ipa, src, flags, 0],
            DataCreateUnknown { data, rd, ipa } => [data, rd, ipa, 0, 0, 0],
            DataDestroy { rd, ipa } => [rd, ipa, 0, 0, 0, 0],
            RealmActivate { rd } | RealmDestroy { rd } | RecAuxCount { rd } => [rd, 0, 0, 0, 0, 0],
            RealmCreate { rd, params } => [rd, params, 0, 0, 0, 0],
            RecCreate { rec, rd, params } => [rec, rd, params, 0, 0, 0],
            RecDestroy { rec } => [rec, 0, 0, 0, 0, 0],
            RecEnter { rec, run } => [rec, run, 0, 0, 0, 0],
            RttCreate {
                rtt,
                rd,
                ipa,
                level,
            }
            | RttDestroy {
                rtt,
                rd,
                ipa,
                level,
            }
            | RttFold {
                rtt,
                rd,
                ipa,
                level,
            } => [rtt, rd, ipa, level, 0, 0],
            RttMapUnprotected {
                rd,
                ipa,
                level,
                desc,
            } => [rd, ipa, level, desc, 0, 0],
            RttReadEntry { rd, ipa, level }
            | RttUnmapUnprotected { rd, ipa, level }
            | RttInitRipas { rd, ipa, level } => [rd, ipa, level, 0, 0, 0],
            PsciComplete {
                calling_rec,
                target_rec,
            } => [calling_rec, target_rec, 0, 0, 0, 0],
            Features { index } => [index, 0, 0, 0, 0, 0],
            RttSetRipas {
                rd,
                rec,
                ipa,
                level,
                ripas,
            } => [rd, rec, ipa, level, ripas, 0],
        }
    }

    /// Attempts to parse `Self` from the function ID in x0 and the arguments in x1..x6.
    pub fn from_regs(fid: u64, args: &[u64; 6]) -> Result<Self> {
        use RmiFunction::*;
        let f = match fid {
            SMC_RMI_VERSION => Version,
            SMC_RMI_GRANULE_DELEGATE => GranuleDelegate { addr: args[0] },
            SMC_RMI_GRANULE_UNDELEGATE => GranuleUndelegate { addr: args[0] },
            SMC_RMI_DATA_CREATE => DataCreate {
                data: args[0],
                rd: args[1],
                ipa: args[2],
                src: args[3],
                flags: args[4],
            },
            SMC_RMI_DATA_CREATE_UNKNOWN => DataCreateUnknown {
                data: args[0],
                rd: args[1],
                ipa: args[2],
            },
            SMC_RMI_DATA_DESTROY => DataDestroy {
                rd: args[0],
                ipa: args[1],
            },
            SMC_RMI_REALM_ACTIVATE => RealmActivate { rd: args[0] },
            SMC_RMI_REALM_CREATE => RealmCreate {
                rd: args[0],
                params: args[1],
            },
            SMC_RMI_REALM_DESTROY => RealmDestroy { rd: args[0] },
            SMC_RMI_REC_CREATE => RecCreate {
                rec: args[0],
                rd: args[1],
                params: args[2],
            },
            SMC_RMI_REC_DESTROY => RecDestroy { rec: args[0] },
            SMC_RMI_REC_ENTER => RecEnter {
                rec: args[0],
                run: args[1],
            },
            SMC_RMI_RTT_CREATE => RttCreate {
                rtt: args[0],
                rd: args[1],
                ipa: args[2],
                level: args[3],
            },
            SMC_RMI_RTT_DESTROY => RttDestroy {
                rtt: args[0],
                rd: args[1],
                ipa: args[2],
                level: args[3],
            },
            SMC_RMI_RTT_MAP_UNPROTECTED => RttMapUnprotected {
                rd: args[0],
                ipa: args[1],
                level: args[2],
                desc: args[3],
            },
            SMC_RMI_RTT_READ_ENTRY => RttReadEntry {
                rd: args[0],
                ipa: args[1],
                level: args[2],
            },
            SMC_RMI_RTT_UNMAP_UNPROTECTED => RttUnmapUnprotected {
                rd: args[0],
                ipa: args[1],
                level: args[2],
            },
            SMC_RMI_PSCI_COMPLETE => PsciComplete {
                calling_rec: args[0],
                target_rec: args[1],
            },
            SMC_RMI_FEATURES => Features { index: args[0] },
            SMC_RMI_RTT_FOLD => RttFold {
                rtt: args[0],
                rd: args[1],
                ipa: args[2],
                level: args[3],
            },
            SMC_RMI_REC_AUX_COUNT => RecAuxCount { rd: args[0] },
            SMC_RMI_RTT_INIT_RIPAS => RttInitRipas {
                rd: args[0],
                ipa: args[1],
                level: args[2],
            },
            SMC_RMI_RTT_SET_RIPAS => RttSetRipas {
                rd: args[0],
                rec: args[1],
                ipa: args[2],
                level: args[3],
                ripas: args[4],
            },
            _ => return Err(Error::NotSupported),
        };
        Ok(f)
    }
}
