// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::params::HashAlgorithm;

// Feature register 0, returned by `RMI_FEATURES` with index 0 and written to
// `RealmParams::features_0`.
register_bitfields![u64,
    pub feature_register_0 [
        // Maximum IPA width in bits.
        s2sz OFFSET(0) NUMBITS(8) [],
        // Whether LPA2 is supported.
        lpa2 OFFSET(8) NUMBITS(1) [],
        // Whether SVE is supported.
        sve_en OFFSET(9) NUMBITS(1) [],
        // Maximum SVE vector length, in quadwords minus one.
        sve_vl OFFSET(10) NUMBITS(4) [],
        // Number of breakpoints available.
        num_bps OFFSET(14) NUMBITS(4) [],
        // Number of watchpoints available.
        num_wps OFFSET(18) NUMBITS(4) [],
        // Whether a PMU is available.
        pmu_en OFFSET(22) NUMBITS(1) [],
        // Number of PMU counters available.
        pmu_num_ctrs OFFSET(23) NUMBITS(5) [],
        hash_sha_256 OFFSET(28) NUMBITS(1) [],
        hash_sha_512 OFFSET(29) NUMBITS(1) [],
    ]
];

/// A snapshot of feature register 0.
pub type FeatureRegister0 = LocalRegisterCopy<u64, feature_register_0::Register>;

/// Convenience queries over feature register 0.
pub trait FeatureRegister0Helpers {
    /// Returns true if the register advertises support for the given hash algorithm.
    fn supports_hash(&self, algo: HashAlgorithm) -> bool;
}

impl FeatureRegister0Helpers for FeatureRegister0 {
    fn supports_hash(&self, algo: HashAlgorithm) -> bool {
        match algo {
            HashAlgorithm::Sha256 => self.is_set(feature_register_0::hash_sha_256),
            HashAlgorithm::Sha512 => self.is_set(feature_register_0::hash_sha_512),
        }
    }
}
