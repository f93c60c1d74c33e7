// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! A software model of the monitor and of the host collaborators, for unit tests.
//!
//! Host memory is identity mapped: a page's physical address is its address in the test's heap,
//! so the model can read realm parameters and write run buffers directly.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::vec;
use std::vec::Vec;

use rmi::{
    feature_register_0, level_mapsize, level_shift, Error as RmiError, Esr, FeatureRegister0,
    RealmParams, RecParams, RecRun, RmiConduit, RmiFunction, Ripas, RttEntryState, SmcRegs,
    GRANULE_SIZE, REC_CREATE_NR_GPRS, RMI_MEASURE_CONTENT, RTT_MAX_LEVEL,
};
use spin::Mutex;
use tock_registers::fields::FieldValue;

use crate::host_mem::{AllocMode, HostMemory, HostPage};
use crate::rec_exit::{ExitAction, TimerState, VcpuHost};
use crate::rme::{Rme, RmeConfig};
use crate::stage2::{pgd_pages, Stage2};
use crate::{Error, Result};

/// Auxiliary granules the model asks for per REC.
pub const FAKE_AUX_COUNT: usize = 2;
/// Breakpoints the model advertises.
pub const FAKE_NUM_BPS: u64 = 6;
const FAKE_NUM_WPS: u64 = 4;
const ENTRIES_PER_TABLE: usize = 512;

pub type TestRme = Rme<FakeRmm, FakeHostMemory>;

type ExitScript = Box<dyn FnOnce(&mut RecRun) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GranuleState {
    Delegated,
    Rd,
    Rec,
    RecAux,
    Data,
    Rtt,
}

#[derive(Clone, Debug)]
struct Entry {
    state: RttEntryState,
    desc: u64,
    ripas: Ripas,
    // The page entries of a folded block, restored when it is split again.
    folded: Option<Vec<Entry>>,
}

impl Entry {
    fn unassigned() -> Self {
        Self {
            state: RttEntryState::Unassigned,
            desc: 0,
            ripas: Ripas::Empty,
            folded: None,
        }
    }
}

struct FakeRealm {
    vmid: u16,
    ia_bits: u32,
    start_level: u8,
    // Base and page count of the root table.
    root: (u64, u64),
    active: bool,
    // Tables keyed by level and the base of the range they cover. The root is at
    // `(start_level, 0)`.
    tables: BTreeMap<(u8, u64), Vec<Entry>>,
}

impl FakeRealm {
    fn index(ipa: u64, base: u64, level: u8) -> usize {
        ((ipa - base) >> level_shift(level)) as usize
    }

    // Walks towards `level` and returns the level and base of the table the walk stopped in.
    fn walk(&self, ipa: u64, level: u8) -> (u8, u64) {
        let mut current = self.start_level;
        let mut base = 0;
        while current < level {
            let entry = &self.tables[&(current, base)][Self::index(ipa, base, current)];
            if entry.state != RttEntryState::Table {
                break;
            }
            base = ipa & !(level_mapsize(current) - 1);
            current += 1;
        }
        (current, base)
    }

    fn entry_mut(&mut self, ipa: u64, level: u8, base: u64) -> &mut Entry {
        let index = Self::index(ipa, base, level);
        &mut self
            .tables
            .get_mut(&(level, base))
            .expect("walk found the table")[index]
    }

    // Returns the entry for `ipa` at exactly `level`, or the level the walk stopped at.
    fn entry_at(&mut self, ipa: u64, level: u8) -> core::result::Result<&mut Entry, u8> {
        let (walk_level, base) = self.walk(ipa, level);
        if walk_level != level {
            return Err(walk_level);
        }
        Ok(self.entry_mut(ipa, level, base))
    }

    fn is_protected(&self, ipa: u64) -> bool {
        ipa < 1 << (self.ia_bits - 1)
    }
}

struct FakeRec {
    rd: u64,
    gprs: [u64; REC_CREATE_NR_GPRS],
    aux: Vec<u64>,
}

/// Parameters the model was last asked to create a realm with.
#[derive(Clone, Debug)]
pub struct RealmParamsRecord {
    pub features_0: u64,
    pub measurement_algo: u8,
    pub rpv: [u8; 64],
    pub vmid: u16,
}

struct Failure {
    fid: u64,
    skip: usize,
    err: RmiError,
}

struct RmmState {
    version: u64,
    features: u64,
    granules: BTreeMap<u64, GranuleState>,
    realms: BTreeMap<u64, FakeRealm>,
    recs: BTreeMap<u64, FakeRec>,
    data: BTreeMap<u64, u8>,
    measured: usize,
    last_params: Option<RealmParamsRecord>,
    psci_completions: Vec<(u64, u64)>,
    failures: Vec<Failure>,
    refuse_delegate: BTreeSet<u64>,
    refuse_undelegate: BTreeSet<u64>,
    exit_scripts: Vec<ExitScript>,
}

/// The monitor model. Clones share state.
#[derive(Clone)]
pub struct FakeRmm {
    state: Arc<Mutex<RmmState>>,
}

impl Default for FakeRmm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRmm {
    pub fn new() -> Self {
        let mut features = FeatureRegister0::new(0);
        features.modify(
            feature_register_0::s2sz.val(48)
                + feature_register_0::sve_en::SET
                + feature_register_0::sve_vl.val(3)
                + feature_register_0::num_bps.val(FAKE_NUM_BPS)
                + feature_register_0::num_wps.val(FAKE_NUM_WPS)
                + feature_register_0::hash_sha_256::SET
                + feature_register_0::hash_sha_512::SET,
        );
        Self {
            state: Arc::new(Mutex::new(RmmState {
                version: rmi::api::RMI_ABI_VERSION.to_raw(),
                features: features.get(),
                granules: BTreeMap::new(),
                realms: BTreeMap::new(),
                recs: BTreeMap::new(),
                data: BTreeMap::new(),
                measured: 0,
                last_params: None,
                psci_completions: Vec::new(),
                failures: Vec::new(),
                refuse_delegate: BTreeSet::new(),
                refuse_undelegate: BTreeSet::new(),
                exit_scripts: Vec::new(),
            })),
        }
    }

    pub fn set_version(&self, major: u16, minor: u16) {
        self.state.lock().version = rmi::api::RmiVersion { major, minor }.to_raw();
    }

    pub fn set_features(&self, fields: FieldValue<u64, feature_register_0::Register>) {
        let mut features = FeatureRegister0::new(0);
        features.modify(fields);
        self.state.lock().features = features.get();
    }

    /// Fails the next call of `fid` with `err`.
    pub fn fail_next(&self, fid: u64, err: RmiError) {
        self.fail_nth(fid, 0, err);
    }

    /// Lets `skip` calls of `fid` through, then fails the next one with `err`.
    pub fn fail_nth(&self, fid: u64, skip: usize, err: RmiError) {
        self.state.lock().failures.push(Failure { fid, skip, err });
    }

    pub fn fail_delegate(&self, pa: u64) {
        self.state.lock().refuse_delegate.insert(pa);
    }

    pub fn fail_undelegate(&self, pa: u64) {
        self.state.lock().refuse_undelegate.insert(pa);
    }

    /// Runs `script` on the run buffer at the next REC entry instead of the default host call
    /// exit.
    pub fn script_exit<F: FnOnce(&mut RecRun) + Send + 'static>(&self, script: F) {
        self.state.lock().exit_scripts.push(Box::new(script));
    }

    pub fn is_delegated(&self, pa: u64) -> bool {
        self.state.lock().granules.contains_key(&pa)
    }

    pub fn delegated_count(&self) -> usize {
        self.state.lock().granules.len()
    }

    pub fn data_granule_count(&self) -> usize {
        self.state
            .lock()
            .granules
            .values()
            .filter(|s| **s == GranuleState::Data)
            .count()
    }

    /// Returns the first byte of the content the data granule at `pa` was created with.
    pub fn data_contents(&self, pa: u64) -> Option<u8> {
        self.state.lock().data.get(&pa).copied()
    }

    pub fn measured_pages(&self) -> usize {
        self.state.lock().measured
    }

    pub fn realm_count(&self) -> usize {
        self.state.lock().realms.len()
    }

    pub fn realm_exists_with_vmid(&self, vmid: u16) -> bool {
        self.state.lock().realms.values().any(|r| r.vmid == vmid)
    }

    pub fn last_realm_params(&self) -> Option<RealmParamsRecord> {
        self.state.lock().last_params.clone()
    }

    pub fn rec_exists(&self, pa: u64) -> bool {
        self.state.lock().recs.contains_key(&pa)
    }

    pub fn rec_aux(&self, pa: u64) -> Vec<u64> {
        self.state
            .lock()
            .recs
            .get(&pa)
            .map(|r| r.aux.clone())
            .unwrap_or_default()
    }

    pub fn psci_completions(&self) -> Vec<(u64, u64)> {
        self.state.lock().psci_completions.clone()
    }

    fn injected_failure(&self, fid: u64) -> Option<RmiError> {
        let mut state = self.state.lock();
        let pos = state.failures.iter().position(|f| f.fid == fid)?;
        if state.failures[pos].skip > 0 {
            state.failures[pos].skip -= 1;
            return None;
        }
        Some(state.failures.remove(pos).err)
    }

    fn handle(&self, func: RmiFunction) -> core::result::Result<SmcRegs, RmiError> {
        use RmiFunction::*;
        if let RecEnter { rec, run } = func {
            return self.rec_enter(rec, run);
        }
        let mut state = self.state.lock();
        let mut regs = SmcRegs::default();
        match func {
            Version => regs.a0 = state.version,
            Features { index } => regs.a1 = if index == 0 { state.features } else { 0 },
            GranuleDelegate { addr } => {
                if addr % GRANULE_SIZE != 0
                    || state.refuse_delegate.contains(&addr)
                    || state.granules.contains_key(&addr)
                {
                    return Err(RmiError::Input);
                }
                state.granules.insert(addr, GranuleState::Delegated);
            }
            GranuleUndelegate { addr } => {
                if state.refuse_undelegate.contains(&addr)
                    || state.granules.get(&addr) != Some(&GranuleState::Delegated)
                {
                    return Err(RmiError::Input);
                }
                state.granules.remove(&addr);
            }
            RealmCreate { rd, params } => state.realm_create(rd, params)?,
            RealmActivate { rd } => state.realm_mut(rd)?.active = true,
            RealmDestroy { rd } => state.realm_destroy(rd)?,
            RecAuxCount { rd } => {
                state.realm_mut(rd)?;
                regs.a1 = FAKE_AUX_COUNT as u64;
            }
            RecCreate { rec, rd, params } => state.rec_create(rec, rd, params)?,
            RecDestroy { rec } => {
                let r = state.recs.remove(&rec).ok_or(RmiError::Input)?;
                state.granules.insert(rec, GranuleState::Delegated);
                for aux in r.aux {
                    state.granules.insert(aux, GranuleState::Delegated);
                }
            }
            PsciComplete {
                calling_rec,
                target_rec,
            } => {
                if !state.recs.contains_key(&calling_rec) || !state.recs.contains_key(&target_rec)
                {
                    return Err(RmiError::Input);
                }
                state.psci_completions.push((calling_rec, target_rec));
            }
            DataCreate {
                data,
                rd,
                ipa,
                src,
                flags,
            } => {
                state.data_create(data, rd, ipa, Ripas::Ram)?;
                // Safety: Host memory is identity mapped and `src` is a live page of the test.
                let first = unsafe { *(src as *const u8) };
                state.data.insert(data, first);
                if flags == RMI_MEASURE_CONTENT {
                    state.measured += 1;
                }
            }
            DataCreateUnknown { data, rd, ipa } => {
                let ripas = {
                    let realm = state.realm_mut(rd)?;
                    realm
                        .entry_at(ipa, RTT_MAX_LEVEL)
                        .map(|e| e.ripas)
                        .unwrap_or(Ripas::Empty)
                };
                state.data_create(data, rd, ipa, ripas)?;
            }
            DataDestroy { rd, ipa } => {
                let realm = state.realm_mut(rd)?;
                let entry = realm.entry_at(ipa, RTT_MAX_LEVEL).map_err(RmiError::Rtt)?;
                if entry.state != RttEntryState::Assigned {
                    return Err(RmiError::Rtt(RTT_MAX_LEVEL));
                }
                let data = entry.desc;
                entry.state = RttEntryState::Destroyed;
                entry.desc = 0;
                state.granules.insert(data, GranuleState::Delegated);
                state.data.remove(&data);
            }
            RttCreate {
                rtt,
                rd,
                ipa,
                level,
            } => state.rtt_create(rtt, rd, ipa, level as u8)?,
            RttDestroy {
                rtt,
                rd,
                ipa,
                level,
            } => state.rtt_destroy(rtt, rd, ipa, level as u8)?,
            RttFold {
                rtt,
                rd,
                ipa,
                level,
            } => state.rtt_fold(rtt, rd, ipa, level as u8)?,
            RttMapUnprotected {
                rd,
                ipa,
                level,
                desc,
            } => {
                let realm = state.realm_mut(rd)?;
                let level = level as u8;
                if realm.is_protected(ipa) || level < 2 || ipa % level_mapsize(level) != 0 {
                    return Err(RmiError::Input);
                }
                let entry = realm.entry_at(ipa, level).map_err(RmiError::Rtt)?;
                if entry.state != RttEntryState::Unassigned {
                    return Err(RmiError::Rtt(level));
                }
                entry.state = RttEntryState::ValidNs;
                entry.desc = desc;
            }
            RttUnmapUnprotected { rd, ipa, level } => {
                let realm = state.realm_mut(rd)?;
                let level = level as u8;
                let entry = realm.entry_at(ipa, level).map_err(RmiError::Rtt)?;
                if entry.state != RttEntryState::ValidNs {
                    return Err(RmiError::Rtt(level));
                }
                entry.state = RttEntryState::Unassigned;
                entry.desc = 0;
            }
            RttReadEntry { rd, ipa, level } => {
                let realm = state.realm_mut(rd)?;
                let level = level as u8;
                if level < realm.start_level || level > RTT_MAX_LEVEL || ipa >> realm.ia_bits != 0
                {
                    return Err(RmiError::Input);
                }
                let (walk_level, base) = realm.walk(ipa, level);
                let entry = realm.entry_mut(ipa, walk_level, base);
                regs.a1 = walk_level as u64;
                regs.a2 = entry.state as u64;
                regs.a3 = entry.desc;
                regs.a4 = entry.ripas as u64;
            }
            RttInitRipas { rd, ipa, level } => {
                let realm = state.realm_mut(rd)?;
                if realm.active {
                    return Err(RmiError::Realm(0));
                }
                let level = level as u8;
                if ipa % level_mapsize(level) != 0 || !realm.is_protected(ipa) {
                    return Err(RmiError::Input);
                }
                let entry = realm.entry_at(ipa, level).map_err(RmiError::Rtt)?;
                if entry.state != RttEntryState::Unassigned {
                    return Err(RmiError::Rtt(level));
                }
                entry.ripas = Ripas::Ram;
            }
            RttSetRipas {
                rd,
                rec,
                ipa,
                level,
                ripas,
            } => {
                if state.recs.get(&rec).map(|r| r.rd) != Some(rd) {
                    return Err(RmiError::Rec(0));
                }
                let realm = state.realm_mut(rd)?;
                let level = level as u8;
                if ipa % level_mapsize(level) != 0 || !realm.is_protected(ipa) {
                    return Err(RmiError::Input);
                }
                let entry = realm.entry_at(ipa, level).map_err(RmiError::Rtt)?;
                match entry.state {
                    RttEntryState::Table | RttEntryState::ValidNs => {
                        return Err(RmiError::Rtt(level))
                    }
                    _ => entry.ripas = Ripas::from_reg(ripas),
                }
            }
            RecEnter { .. } => unreachable!(),
        }
        Ok(regs)
    }

    fn rec_enter(&self, rec: u64, run: u64) -> core::result::Result<SmcRegs, RmiError> {
        let (gprs, script) = {
            let mut state = self.state.lock();
            let r = state.recs.get(&rec).ok_or(RmiError::Input)?;
            let (rd, gprs) = (r.rd, r.gprs);
            if !state.realms.get(&rd).map_or(false, |r| r.active) {
                return Err(RmiError::Realm(1));
            }
            let script = if state.exit_scripts.is_empty() {
                None
            } else {
                Some(state.exit_scripts.remove(0))
            };
            (gprs, script)
        };
        // Safety: Host memory is identity mapped and the caller passes its run buffer.
        let run = unsafe { &mut *(run as *mut RecRun) };
        run.exit = RecRun::default().exit;
        match script {
            Some(script) => script(run),
            None => {
                run.exit.exit_reason = rmi::ExitReason::HostCall as u8;
                run.exit.gprs[..REC_CREATE_NR_GPRS].copy_from_slice(&gprs);
            }
        }
        Ok(SmcRegs::default())
    }
}

impl RmmState {
    fn realm_mut(&mut self, rd: u64) -> core::result::Result<&mut FakeRealm, RmiError> {
        self.realms.get_mut(&rd).ok_or(RmiError::Input)
    }

    fn take_delegated(&mut self, pa: u64, state: GranuleState) -> core::result::Result<(), RmiError> {
        match self.granules.get_mut(&pa) {
            Some(s) if *s == GranuleState::Delegated => {
                *s = state;
                Ok(())
            }
            _ => Err(RmiError::Input),
        }
    }

    fn realm_create(&mut self, rd: u64, params: u64) -> core::result::Result<(), RmiError> {
        // Safety: Host memory is identity mapped and the caller passes initialized parameters.
        let params = unsafe { &*(params as *const RealmParams) };
        if self.granules.get(&rd) != Some(&GranuleState::Delegated)
            || self.realms.values().any(|r| r.vmid == params.vmid)
        {
            return Err(RmiError::Input);
        }
        let root_pages = params.rtt_num_start as u64;
        for i in 0..root_pages {
            if self.granules.get(&(params.rtt_base + i * GRANULE_SIZE))
                != Some(&GranuleState::Delegated)
            {
                return Err(RmiError::Input);
            }
        }
        let ia_bits =
            FeatureRegister0::new(params.features_0).read(feature_register_0::s2sz) as u32;
        let start_level = params.rtt_level_start as u8;
        if pgd_pages(ia_bits, start_level) as u64 != root_pages {
            return Err(RmiError::Input);
        }

        for i in 0..root_pages {
            self.granules
                .insert(params.rtt_base + i * GRANULE_SIZE, GranuleState::Rtt);
        }
        self.granules.insert(rd, GranuleState::Rd);
        let mut tables = BTreeMap::new();
        tables.insert(
            (start_level, 0),
            vec![Entry::unassigned(); ENTRIES_PER_TABLE * root_pages as usize],
        );
        self.realms.insert(
            rd,
            FakeRealm {
                vmid: params.vmid,
                ia_bits,
                start_level,
                root: (params.rtt_base, root_pages),
                active: false,
                tables,
            },
        );
        self.last_params = Some(RealmParamsRecord {
            features_0: params.features_0,
            measurement_algo: params.measurement_algo,
            rpv: params.rpv,
            vmid: params.vmid,
        });
        Ok(())
    }

    fn realm_destroy(&mut self, rd: u64) -> core::result::Result<(), RmiError> {
        let realm = self.realm_mut(rd)?;
        let live_objects = realm.tables.len() > 1
            || realm.tables[&(realm.start_level, 0)].iter().any(|e| {
                !matches!(
                    e.state,
                    RttEntryState::Unassigned | RttEntryState::Destroyed
                )
            });
        let (base, count) = realm.root;
        if live_objects || self.recs.values().any(|r| r.rd == rd) {
            return Err(RmiError::InUse(0));
        }
        self.realms.remove(&rd);
        for i in 0..count {
            self.granules
                .insert(base + i * GRANULE_SIZE, GranuleState::Delegated);
        }
        self.granules.insert(rd, GranuleState::Delegated);
        Ok(())
    }

    fn rec_create(&mut self, rec: u64, rd: u64, params: u64) -> core::result::Result<(), RmiError> {
        // Safety: Host memory is identity mapped and the caller passes initialized parameters.
        let params = unsafe { &*(params as *const RecParams) };
        if self.realm_mut(rd)?.active {
            return Err(RmiError::Realm(0));
        }
        let aux: Vec<u64> = params.aux[..params.num_rec_aux as usize].to_vec();
        if aux.len() != FAKE_AUX_COUNT
            || self.granules.get(&rec) != Some(&GranuleState::Delegated)
            || aux
                .iter()
                .any(|a| self.granules.get(a) != Some(&GranuleState::Delegated))
        {
            return Err(RmiError::Input);
        }
        self.take_delegated(rec, GranuleState::Rec)?;
        for a in aux.iter() {
            self.take_delegated(*a, GranuleState::RecAux)?;
        }
        self.recs.insert(
            rec,
            FakeRec {
                rd,
                gprs: params.gprs,
                aux,
            },
        );
        Ok(())
    }

    fn data_create(
        &mut self,
        data: u64,
        rd: u64,
        ipa: u64,
        ripas: Ripas,
    ) -> core::result::Result<(), RmiError> {
        if self.granules.get(&data) != Some(&GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        let realm = self.realm_mut(rd)?;
        if !realm.is_protected(ipa) || ipa % GRANULE_SIZE != 0 {
            return Err(RmiError::Input);
        }
        let entry = realm.entry_at(ipa, RTT_MAX_LEVEL).map_err(RmiError::Rtt)?;
        if entry.state != RttEntryState::Unassigned {
            return Err(RmiError::Rtt(RTT_MAX_LEVEL));
        }
        entry.state = RttEntryState::Assigned;
        entry.desc = data;
        entry.ripas = ripas;
        self.take_delegated(data, GranuleState::Data)
    }

    // Checks the arguments naming the table at `level` covering `ipa` and returns the parent
    // entry's level.
    fn check_table_args(
        &mut self,
        rd: u64,
        ipa: u64,
        level: u8,
    ) -> core::result::Result<u8, RmiError> {
        let realm = self.realm_mut(rd)?;
        if level <= realm.start_level
            || level > RTT_MAX_LEVEL
            || ipa % level_mapsize(level - 1) != 0
            || ipa >> realm.ia_bits != 0
        {
            return Err(RmiError::Input);
        }
        Ok(level - 1)
    }

    fn rtt_create(
        &mut self,
        rtt: u64,
        rd: u64,
        ipa: u64,
        level: u8,
    ) -> core::result::Result<(), RmiError> {
        let parent_level = self.check_table_args(rd, ipa, level)?;
        if self.granules.get(&rtt) != Some(&GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        let realm = self.realm_mut(rd)?;
        let parent = realm.entry_at(ipa, parent_level).map_err(RmiError::Rtt)?;
        let entries = match parent.state {
            RttEntryState::Table => return Err(RmiError::Rtt(parent_level)),
            RttEntryState::Unassigned | RttEntryState::Destroyed => {
                let child = Entry {
                    state: parent.state,
                    desc: 0,
                    ripas: parent.ripas,
                    folded: None,
                };
                vec![child; ENTRIES_PER_TABLE]
            }
            RttEntryState::Assigned | RttEntryState::ValidNs => match parent.folded.take() {
                Some(children) => children,
                None => (0..ENTRIES_PER_TABLE as u64)
                    .map(|i| Entry {
                        state: parent.state,
                        desc: parent.desc + i * GRANULE_SIZE,
                        ripas: parent.ripas,
                        folded: None,
                    })
                    .collect(),
            },
        };
        parent.state = RttEntryState::Table;
        parent.desc = rtt;
        realm.tables.insert((level, ipa), entries);
        self.take_delegated(rtt, GranuleState::Rtt)
    }

    fn rtt_destroy(
        &mut self,
        rtt: u64,
        rd: u64,
        ipa: u64,
        level: u8,
    ) -> core::result::Result<(), RmiError> {
        let parent_level = self.check_table_args(rd, ipa, level)?;
        let realm = self.realm_mut(rd)?;
        let protected = realm.is_protected(ipa);
        let parent = realm.entry_at(ipa, parent_level).map_err(RmiError::Rtt)?;
        if parent.state != RttEntryState::Table || parent.desc != rtt {
            return Err(RmiError::Rtt(parent_level));
        }
        let live = realm.tables[&(level, ipa)].iter().any(|e| {
            !matches!(
                e.state,
                RttEntryState::Unassigned | RttEntryState::Destroyed
            )
        });
        if live {
            return Err(RmiError::Rtt(level));
        }
        realm.tables.remove(&(level, ipa));
        let parent = realm.entry_at(ipa, parent_level).map_err(RmiError::Rtt)?;
        parent.state = if protected {
            RttEntryState::Destroyed
        } else {
            RttEntryState::Unassigned
        };
        parent.desc = 0;
        self.granules.insert(rtt, GranuleState::Delegated);
        Ok(())
    }

    fn rtt_fold(
        &mut self,
        rtt: u64,
        rd: u64,
        ipa: u64,
        level: u8,
    ) -> core::result::Result<(), RmiError> {
        let parent_level = self.check_table_args(rd, ipa, level)?;
        let realm = self.realm_mut(rd)?;
        let parent = realm.entry_at(ipa, parent_level).map_err(RmiError::Rtt)?;
        if parent.state != RttEntryState::Table || parent.desc != rtt {
            return Err(RmiError::Rtt(parent_level));
        }
        let children = &realm.tables[&(level, ipa)];
        let first = children[0].clone();
        let uniform = children
            .iter()
            .all(|e| e.state == first.state && e.ripas == first.ripas && e.folded.is_none());
        let foldable = matches!(
            first.state,
            RttEntryState::Assigned | RttEntryState::ValidNs | RttEntryState::Unassigned
        );
        if !uniform || !foldable {
            return Err(RmiError::Rtt(level));
        }
        let children = realm.tables.remove(&(level, ipa)).unwrap_or_default();
        let parent = realm.entry_at(ipa, parent_level).map_err(RmiError::Rtt)?;
        parent.state = first.state;
        parent.ripas = first.ripas;
        parent.desc = first.desc;
        parent.folded = if first.state == RttEntryState::Unassigned {
            None
        } else {
            Some(children)
        };
        self.granules.insert(rtt, GranuleState::Delegated);
        Ok(())
    }
}

impl RmiConduit for FakeRmm {
    unsafe fn smc(&self, fid: u64, args: [u64; 6]) -> SmcRegs {
        let func = match RmiFunction::from_regs(fid, &args) {
            Ok(func) => func,
            Err(e) => {
                return SmcRegs {
                    a0: e.to_status(),
                    ..Default::default()
                }
            }
        };
        if let Some(err) = self.injected_failure(fid) {
            return SmcRegs {
                a0: err.to_status(),
                ..Default::default()
            };
        }
        match self.handle(func) {
            Ok(regs) => regs,
            Err(err) => SmcRegs {
                a0: err.to_status(),
                ..Default::default()
            },
        }
    }
}

struct MemState {
    outstanding: usize,
    allocs_left: usize,
    blocking_requests: usize,
}

/// Identity mapped host memory carved from the test's heap.
#[derive(Clone)]
pub struct FakeHostMemory {
    rmm: FakeRmm,
    state: Arc<Mutex<MemState>>,
}

fn page_layout(pages: usize) -> Layout {
    Layout::from_size_align(pages * GRANULE_SIZE as usize, GRANULE_SIZE as usize)
        .expect("valid page layout")
}

impl FakeHostMemory {
    pub fn new(rmm: FakeRmm) -> Self {
        Self {
            rmm,
            state: Arc::new(Mutex::new(MemState {
                outstanding: 0,
                allocs_left: usize::MAX,
                blocking_requests: 0,
            })),
        }
    }

    /// Returns the number of pages allocated with `alloc_page` and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Returns the number of `alloc_page` calls made with `AllocMode::Blocking`.
    pub fn blocking_requests(&self) -> usize {
        self.state.lock().blocking_requests
    }

    /// Lets `n` more page allocations succeed; `usize::MAX` removes the limit.
    pub fn fail_allocs_after(&self, n: usize) {
        self.state.lock().allocs_left = n;
    }

    /// Returns `n` contiguous pages that live for the rest of the test, outside of the
    /// allocator's accounting.
    pub fn alloc_contiguous(&self, n: usize) -> u64 {
        // Safety: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(page_layout(n)) };
        assert!(!ptr.is_null());
        ptr as u64
    }
}

impl HostMemory for FakeHostMemory {
    fn alloc_page(&self, mode: AllocMode) -> Option<HostPage> {
        let mut state = self.state.lock();
        if mode == AllocMode::Blocking {
            state.blocking_requests += 1;
        }
        if state.allocs_left == 0 {
            return None;
        }
        if state.allocs_left != usize::MAX {
            state.allocs_left -= 1;
        }
        // Safety: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(page_layout(1)) };
        assert!(!ptr.is_null());
        state.outstanding += 1;
        // Safety: The page was just allocated.
        Some(unsafe { HostPage::from_phys(ptr as u64) })
    }

    fn free_page(&self, page: HostPage) {
        assert!(
            !self.rmm.is_delegated(page.pa()),
            "freeing delegated page {:#x}",
            page.pa()
        );
        self.state.lock().outstanding -= 1;
        // Safety: The page came from `alloc_page`.
        unsafe { dealloc(page.pa() as *mut u8, page_layout(1)) };
    }

    fn phys_to_virt(&self, pa: u64) -> *mut u8 {
        pa as *mut u8
    }

    fn virt_to_phys(&self, va: *const u8) -> u64 {
        va as u64
    }
}

/// Page aligned host memory filled with one byte, used as the source of protected content.
pub struct FakeBlock {
    ptr: *mut u8,
    pages: usize,
}

impl FakeBlock {
    pub fn filled(pages: usize, byte: u8) -> Self {
        // Safety: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(page_layout(pages)) };
        assert!(!ptr.is_null());
        // Safety: `ptr` points to `pages` freshly allocated pages.
        unsafe { ptr.write_bytes(byte, pages * GRANULE_SIZE as usize) };
        Self { ptr, pages }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // Safety: `ptr` points to `pages` initialized pages owned by self.
        unsafe { core::slice::from_raw_parts(self.ptr, self.pages * GRANULE_SIZE as usize) }
    }
}

impl Drop for FakeBlock {
    fn drop(&mut self) {
        // Safety: `ptr` was allocated with this layout in `filled`.
        unsafe { dealloc(self.ptr, page_layout(self.pages)) };
    }
}

/// A second stage address space with just a top level table.
pub struct FakeStage2 {
    mem: FakeHostMemory,
    ia_bits: u32,
    start_level: u8,
    pgd: u64,
    torn_down: Arc<AtomicBool>,
}

impl FakeStage2 {
    pub fn new(mem: &FakeHostMemory, ia_bits: u32, start_level: u8) -> Self {
        let pgd = mem.alloc_contiguous(pgd_pages(ia_bits, start_level));
        Self {
            mem: mem.clone(),
            ia_bits,
            start_level,
            pgd,
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn torn_down_flag(&self) -> Arc<AtomicBool> {
        self.torn_down.clone()
    }
}

impl Stage2 for FakeStage2 {
    fn ia_bits(&self) -> u32 {
        self.ia_bits
    }

    fn start_level(&self) -> u8 {
        self.start_level
    }

    fn pgd_phys(&self) -> u64 {
        self.pgd
    }

    fn teardown(self) {
        for i in 0..self.pgd_pages() as u64 {
            assert!(!self.mem.rmm.is_delegated(self.pgd + i * GRANULE_SIZE));
        }
        // Safety: The table pages came from `alloc_contiguous` with this layout.
        unsafe { dealloc(self.pgd as *mut u8, page_layout(self.pgd_pages())) };
        self.torn_down.store(true, Ordering::Relaxed);
    }
}

/// A vCPU model that records what the exit handlers were asked to do.
#[derive(Default)]
pub struct FakeVcpu {
    pub regs: [u64; 31],
    pub fault: (u64, u64, u64),
    pub timers: TimerState,
    pub timer_updates: usize,
    pub aborts: usize,
    pub sys_reg_value: u64,
    pub psci_calls: usize,
    pub psci_result: u64,
    pub hypercalls: usize,
    pub fail_hypercalls: bool,
}

impl VcpuHost for FakeVcpu {
    fn reg(&self, index: usize) -> u64 {
        self.regs[index]
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        self.regs[index] = value;
    }

    fn set_fault_info(&mut self, esr: u64, far: u64, hpfar: u64) {
        self.fault = (esr, far, hpfar);
    }

    fn set_timers(&mut self, timers: TimerState) {
        self.timers = timers;
    }

    fn update_timers(&mut self) {
        self.timer_updates += 1;
    }

    fn handle_guest_abort(&mut self, _esr: Esr) -> Result<ExitAction> {
        self.aborts += 1;
        Ok(ExitAction::Resume)
    }

    fn handle_sys_reg(&mut self, esr: Esr) -> Result<ExitAction> {
        // rt 31 is XZR.
        let rt = esr.read(rmi::esr::sys64_rt) as usize;
        if esr.is_set(rmi::esr::sys64_direction) {
            if let Some(reg) = self.regs.get_mut(rt) {
                *reg = self.sys_reg_value;
            }
        } else {
            self.sys_reg_value = self.regs.get(rt).copied().unwrap_or(0);
        }
        Ok(ExitAction::Resume)
    }

    fn handle_psci(&mut self) -> Result<ExitAction> {
        self.psci_calls += 1;
        self.regs[0] = self.psci_result;
        Ok(ExitAction::Resume)
    }

    fn handle_hypercall(&mut self) -> Result<ExitAction> {
        self.hypercalls += 1;
        if self.fail_hypercalls {
            return Err(Error::InvalidArgument);
        }
        Ok(ExitAction::Resume)
    }
}

/// Probes a realm-capable system on top of `rmm`.
pub fn stub_rme_with(rmm: FakeRmm) -> (TestRme, FakeRmm, FakeHostMemory) {
    let mem = FakeHostMemory::new(rmm.clone());
    let config = RmeConfig {
        vmid_bits: 8,
        host_page_size: GRANULE_SIZE,
    };
    let rme = Rme::probe(rmm.clone(), mem.clone(), &config)
        .unwrap()
        .unwrap();
    (rme, rmm, mem)
}

pub fn stub_rme() -> (TestRme, FakeRmm, FakeHostMemory) {
    stub_rme_with(FakeRmm::new())
}
