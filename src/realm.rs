// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU8, Ordering};

use log::warn;
use rmi::{
    api, feature_register_0, level_shift, FeatureRegister0, HashAlgorithm, RealmParams,
    RmiConduit, REC_PARAMS_AUX_GRANULES, RTT_MAX_LEVEL,
};
use spin::Mutex;

use crate::granule::{DelegatedGranule, DelegatedRange};
use crate::host_mem::{AllocMode, HostMemory, HostPageBox};
use crate::rme::Rme;
use crate::stage2::Stage2;
use crate::{Error, Result};

/// Lifecycle state of a realm.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealmState {
    /// No realm descriptor exists yet; the realm can still be configured.
    None = 0,
    /// The descriptor exists. RECs can be created and memory populated.
    New = 1,
    /// The realm can run.
    Active = 2,
    /// The realm is being torn down.
    Dying = 3,
}

impl RealmState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RealmState::None,
            1 => RealmState::New,
            2 => RealmState::Active,
            _ => RealmState::Dying,
        }
    }
}

/// A configuration item, applied before the realm descriptor is created.
#[derive(Clone, Copy, Debug)]
pub enum RealmConfig {
    /// Hash algorithm used for the realm measurement.
    HashAlgorithm(HashAlgorithm),
    /// Enables SVE with the given vector length, in quadwords minus one.
    Sve { vector_quadwords: u32 },
    /// The realm personalization value, reported in attestation evidence.
    Personalization([u8; 64]),
}

/// A realm and the resources it holds with the monitor.
///
/// The descriptor granule, the RTT root and the spare granule belong to the realm. RECs borrow the
/// realm, so a realm can only be destroyed once all of its RECs are gone.
///
/// # Locking
///
/// State transitions are single atomic stores. RTT operations on overlapping ranges aren't
/// serialized here; callers are expected to hold their address space lock around them. The spare
/// granule slot has its own lock only so that it is sound to access through `&self`.
pub struct Realm<'a, C: RmiConduit, H: HostMemory, S: Stage2> {
    rme: &'a Rme<C, H>,
    stage2: S,
    ia_bits: u32,
    start_level: u8,
    state: AtomicU8,
    // Pre-creation configuration, freed once the descriptor exists.
    params: Option<HostPageBox<RealmParams>>,
    rd: Option<DelegatedGranule>,
    rtt_root: Option<DelegatedRange>,
    vmid: Option<u16>,
    num_aux: usize,
    spare: Mutex<Option<DelegatedGranule>>,
}

impl<'a, C: RmiConduit, H: HostMemory, S: Stage2> Realm<'a, C, H, S> {
    /// Creates a realm over the `stage2` address space. Nothing is handed to the monitor until
    /// `create` is called.
    pub fn new(rme: &'a Rme<C, H>, stage2: S) -> Result<Self> {
        let ia_bits = stage2.ia_bits();
        let start_level = stage2.start_level();
        // The root table must resolve at least one address bit.
        if ia_bits > rme.ipa_limit()
            || start_level > RTT_MAX_LEVEL
            || ia_bits <= level_shift(start_level)
        {
            return Err(Error::InvalidArgument);
        }
        let host_features = rme.features();
        let mut features = FeatureRegister0::new(0);
        features.modify(
            feature_register_0::s2sz.val(ia_bits as u64)
                + feature_register_0::num_bps.val(host_features.read(feature_register_0::num_bps))
                + feature_register_0::num_wps.val(host_features.read(feature_register_0::num_wps)),
        );
        let mut params = RealmParams::default();
        params.features_0 = features.get();
        let params = HostPageBox::new_in(params, rme.mem(), AllocMode::Blocking)?;

        Ok(Self {
            rme,
            start_level,
            stage2,
            ia_bits,
            state: AtomicU8::new(RealmState::None as u8),
            params: Some(params),
            rd: None,
            rtt_root: None,
            vmid: None,
            num_aux: 0,
            spare: Mutex::new(None),
        })
    }

    /// Returns the current state of the realm.
    pub fn state(&self) -> RealmState {
        RealmState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RealmState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns the realm's VMID, once it has been created.
    pub fn vmid(&self) -> Option<u16> {
        self.vmid
    }

    /// Returns the width of the realm's IPA space.
    pub fn ia_bits(&self) -> u32 {
        self.ia_bits
    }

    /// Returns the level of the RTT root.
    pub fn start_level(&self) -> u8 {
        self.start_level
    }

    /// Returns the number of auxiliary granules each REC of this realm needs.
    pub fn num_aux(&self) -> usize {
        self.num_aux
    }

    /// Returns true if `addr` is in the protected (lower) half of the IPA space.
    pub fn is_addr_protected(&self, addr: u64) -> bool {
        addr & !((1u64 << (self.ia_bits - 1)) - 1) == 0
    }

    pub(crate) fn rme(&self) -> &'a Rme<C, H> {
        self.rme
    }

    /// Returns the address of the realm descriptor.
    pub(crate) fn rd_pa(&self) -> Result<u64> {
        self.rd.as_ref().map(|rd| rd.pa()).ok_or(Error::Busy)
    }

    /// Applies a configuration item. Only allowed before the descriptor is created.
    pub fn configure(&mut self, cfg: RealmConfig) -> Result<()> {
        if self.state() != RealmState::None {
            return Err(Error::Busy);
        }
        let rme = self.rme;
        let params = self.params.as_mut().ok_or(Error::Busy)?;
        match cfg {
            RealmConfig::HashAlgorithm(algo) => {
                if !rme.supports(algo) {
                    return Err(Error::InvalidArgument);
                }
                params.measurement_algo = algo as u8;
            }
            RealmConfig::Sve { vector_quadwords } => {
                if !rme.supports_sve() || vector_quadwords > rme.max_sve_vq() {
                    return Err(Error::InvalidArgument);
                }
                let mut features = FeatureRegister0::new(params.features_0);
                features.modify(
                    feature_register_0::sve_en::SET
                        + feature_register_0::sve_vl.val(vector_quadwords as u64),
                );
                params.features_0 = features.get();
            }
            RealmConfig::Personalization(rpv) => {
                params.rpv = rpv;
            }
        }
        Ok(())
    }

    /// Creates the realm descriptor, moving the realm from `None` to `New`.
    pub fn create(&mut self) -> Result<()> {
        if self.state() != RealmState::None {
            return Err(Error::Busy);
        }
        let vmid = self.rme.vmids().reserve()?;
        if let Err(e) = self.create_rd(vmid) {
            self.rme.vmids().release(vmid);
            return Err(e);
        }
        self.vmid = Some(vmid);
        self.set_state(RealmState::New);

        // The realm is up, free the parameters.
        if let Some(params) = self.params.take() {
            params.release(self.rme.mem());
        }
        Ok(())
    }

    fn create_rd(&mut self, vmid: u16) -> Result<()> {
        let rme = self.rme;
        let pgd = self.stage2.pgd_phys();
        let pgd_pages = self.stage2.pgd_pages();
        let params = self.params.as_mut().ok_or(Error::Busy)?;

        let rd = rme.alloc_delegated(AllocMode::Blocking)?;
        // Safety: The top level table isn't used for translation until the realm is activated, and
        // the host doesn't touch it again until it's undelegated at destruction.
        let root = match unsafe { rme.delegate_range(pgd, pgd_pages) } {
            Ok(root) => root,
            Err(e) => {
                // The delegate error is returned; a refused undelegate is only logged.
                let _ = rme.free_delegated(rd);
                return Err(e);
            }
        };

        params.rtt_level_start = self.start_level as i64;
        params.rtt_num_start = pgd_pages as u32;
        params.rtt_base = pgd;
        params.vmid = vmid;
        // Safety: `params` is an initialized RealmParams in a host page we own.
        if let Err(e) = unsafe { api::realm_create(rme.conduit(), rd.pa(), params.pa()) } {
            self.abort_create(rd, root);
            return Err(e.into());
        }

        let num_aux = match api::rec_aux_count(rme.conduit(), rd.pa()) {
            Ok(n) if n as usize <= REC_PARAMS_AUX_GRANULES => n as usize,
            result => {
                if let Err(e) = api::realm_destroy(rme.conduit(), rd.pa()) {
                    warn!("Failed to destroy half-created realm: {:?}", e);
                    rd.leak();
                    self.rtt_root = Some(root);
                    return Err(Error::Leaked);
                }
                self.abort_create(rd, root);
                return Err(match result {
                    Err(e) => e.into(),
                    Ok(_) => Error::InvalidArgument,
                });
            }
        };

        self.rd = Some(rd);
        self.rtt_root = Some(root);
        self.num_aux = num_aux;
        Ok(())
    }

    // Returns the descriptor and RTT root granules to the host after a failed creation. Root
    // pages the monitor won't give back are remembered so `destroy` doesn't free them.
    fn abort_create(&mut self, rd: DelegatedGranule, mut root: DelegatedRange) {
        if self.rme.undelegate_range(&mut root).is_err() {
            self.rtt_root = Some(root);
        }
        let _ = self.rme.free_delegated(rd);
    }

    /// Activates the realm, after which its RECs can run. Only allowed from `New`.
    pub fn activate(&self) -> Result<()> {
        if self.state() != RealmState::New {
            return Err(Error::Busy);
        }
        api::realm_activate(self.rme.conduit(), self.rd_pa()?)?;
        self.set_state(RealmState::Active);
        Ok(())
    }

    /// Takes a delegated granule, preferring the spare. May be called from a non-blocking context
    /// if `mode` is `NonBlocking`.
    pub fn acquire_delegated(&self, mode: AllocMode) -> Result<DelegatedGranule> {
        if let Some(g) = self.spare.lock().take() {
            return Ok(g);
        }
        self.rme.alloc_delegated(mode)
    }

    /// Gives back a granule from `acquire_delegated`. It becomes the spare if there is none,
    /// otherwise it is undelegated and freed. May be called from a non-blocking context.
    pub fn release_delegated(&self, granule: DelegatedGranule) -> Result<()> {
        {
            let mut spare = self.spare.lock();
            if spare.is_none() {
                *spare = Some(granule);
                return Ok(());
            }
        }
        self.rme.free_delegated(granule)
    }

    /// Returns true if a spare granule is stashed.
    pub fn has_spare(&self) -> bool {
        self.spare.lock().is_some()
    }

    pub(crate) fn take_spare(&self) -> Option<DelegatedGranule> {
        self.spare.lock().take()
    }

    pub(crate) fn put_spare(&self, granule: DelegatedGranule) {
        let old = self.spare.lock().replace(granule);
        debug_assert!(old.is_none());
    }

    /// Tears down the realm and returns all of its resources to the host.
    ///
    /// If the monitor refuses to release a resource, destruction stops there: that resource and
    /// everything not yet released, including the second stage address space, is leaked and
    /// `Leaked` or the monitor's error is returned.
    pub fn destroy(mut self) -> Result<()> {
        let rme = self.rme;
        if let Some(params) = self.params.take() {
            params.release(rme.mem());
        }

        if self.state() == RealmState::None {
            // Root pages left over from a failed creation.
            if let Some(mut root) = self.rtt_root.take() {
                if let Err(e) = rme.undelegate_range(&mut root) {
                    root.leak();
                    self.abandon();
                    return Err(e);
                }
            }
            self.stage2.teardown();
            return Ok(());
        }

        self.set_state(RealmState::Dying);
        if let Some(vmid) = self.vmid.take() {
            rme.vmids().release(vmid);
        }

        if let Err(e) = self.destroy_rtts() {
            warn!("Failed to tear down realm RTTs: {:?}", e);
        }

        if let Some(spare) = self.spare.get_mut().take() {
            if let Err(e) = rme.free_delegated(spare) {
                self.abandon();
                return Err(e);
            }
        }

        if let Some(rd) = self.rd.take() {
            if let Err(e) = api::realm_destroy(rme.conduit(), rd.pa()) {
                warn!("Failed to destroy realm descriptor: {:?}", e);
                rd.leak();
                self.abandon();
                return Err(e.into());
            }
            if let Err(e) = rme.free_delegated(rd) {
                self.abandon();
                return Err(e);
            }
        }

        if let Some(mut root) = self.rtt_root.take() {
            if let Err(e) = rme.undelegate_range(&mut root) {
                root.leak();
                self.abandon();
                return Err(e);
            }
        }

        self.stage2.teardown();
        Ok(())
    }

    // Leaks what the realm still holds once the monitor has refused to give something back. The
    // second stage address space is never freed since the monitor may still walk it.
    fn abandon(mut self) {
        if let Some(spare) = self.spare.get_mut().take() {
            spare.leak();
        }
        if let Some(rd) = self.rd.take() {
            rd.leak();
        }
        if let Some(root) = self.rtt_root.take() {
            root.leak();
        }
        warn!("Leaking second stage address space of {}-bit realm", self.ia_bits);
        core::mem::forget(self.stage2);
    }
}
