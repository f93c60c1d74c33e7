// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use log::{error, info};
use rmi::{
    api, feature_register_0, FeatureRegister0, FeatureRegister0Helpers, HashAlgorithm, RmiConduit,
    GRANULE_SIZE,
};

use crate::host_mem::HostMemory;
use crate::vmid::VmidAllocator;
use crate::Result;

/// System-wide parameters for realm support.
#[derive(Clone, Copy, Debug)]
pub struct RmeConfig {
    /// Width of the VMIDs supported by the stage 2 MMU.
    pub vmid_bits: u32,
    /// Page size used by the host kernel.
    pub host_page_size: u64,
}

/// Realm support for the system: the monitor conduit, the host allocator, the capabilities the
/// monitor advertised at probe time and the VMID pool shared by all realms.
pub struct Rme<C, H> {
    conduit: C,
    mem: H,
    features: FeatureRegister0,
    vmids: VmidAllocator,
}

impl<C: RmiConduit, H: HostMemory> Rme<C, H> {
    /// Negotiates the interface version with the monitor and snapshots its capabilities. Returns
    /// `Ok(None)` if realms can't be supported on this system, in which case the host carries on
    /// without them.
    pub fn probe(conduit: C, mem: H, config: &RmeConfig) -> Result<Option<Self>> {
        if config.host_page_size != GRANULE_SIZE {
            info!(
                "Realms need a 4kB host page size, not {:#x}",
                config.host_page_size
            );
            return Ok(None);
        }
        let version = match api::version(&conduit) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        if version.major != api::RMI_ABI_VERSION.major {
            error!(
                "Unsupported RMI ABI (version {}.{}) we support {}",
                version.major,
                version.minor,
                api::RMI_ABI_VERSION.major
            );
            return Ok(None);
        }
        info!("RMI ABI version {}.{}", version.major, version.minor);

        let features = FeatureRegister0::new(api::features(&conduit, 0)?);
        Ok(Some(Self {
            conduit,
            mem,
            features,
            vmids: VmidAllocator::new(config.vmid_bits),
        }))
    }

    /// Returns the largest IPA width a realm may use.
    pub fn ipa_limit(&self) -> u32 {
        self.features.read(feature_register_0::s2sz) as u32
    }

    /// Returns true if realms may use SVE.
    pub fn supports_sve(&self) -> bool {
        self.features.is_set(feature_register_0::sve_en)
    }

    /// Returns the largest SVE vector length a realm may use, in quadwords minus one.
    pub fn max_sve_vq(&self) -> u32 {
        self.features.read(feature_register_0::sve_vl) as u32
    }

    /// Returns true if realm measurements may use `algo`.
    pub fn supports(&self, algo: HashAlgorithm) -> bool {
        self.features.supports_hash(algo)
    }

    /// Returns the capabilities snapshot taken at probe time.
    pub fn features(&self) -> FeatureRegister0 {
        self.features
    }

    pub(crate) fn conduit(&self) -> &C {
        &self.conduit
    }

    pub(crate) fn mem(&self) -> &H {
        &self.mem
    }

    pub(crate) fn vmids(&self) -> &VmidAllocator {
        &self.vmids
    }
}
