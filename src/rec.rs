// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use flagset::FlagSet;
use log::warn;
use rmi::{
    api, RecCreateFlags, RecParams, RecRun, RmiConduit, GRANULE_SIZE, REC_CREATE_NR_GPRS,
    REC_PARAMS_AUX_GRANULES,
};
use static_assertions::const_assert;

use crate::granule::DelegatedGranule;
use crate::host_mem::{AllocMode, HostMemory, HostPageBox};
use crate::realm::{Realm, RealmState};
use crate::rme::Rme;
use crate::stage2::Stage2;
use crate::{Error, Result};

type AuxGranules = ArrayVec<DelegatedGranule, REC_PARAMS_AUX_GRANULES>;

// The parameters and the run buffer each live in a host page of their own.
const_assert!(core::mem::size_of::<RecParams>() <= GRANULE_SIZE as usize);
const_assert!(core::mem::size_of::<RecRun>() <= GRANULE_SIZE as usize);

// Gives back granules gathered for a REC that was never created. Refused undelegates are leaked
// by `free_delegated`.
fn free_granules<C: RmiConduit, H: HostMemory>(
    rme: &Rme<C, H>,
    rec: DelegatedGranule,
    aux: AuxGranules,
) {
    let _ = rme.free_delegated(rec);
    for g in aux {
        let _ = rme.free_delegated(g);
    }
}

/// A realm execution context, the monitor's side of a vCPU.
///
/// A `Rec` must be torn down with `destroy`; dropping it leaks its granules and leaves the realm
/// impossible to destroy.
pub struct Rec<'r, 'a, C: RmiConduit, H: HostMemory, S: Stage2> {
    realm: &'r Realm<'a, C, H, S>,
    rec: DelegatedGranule,
    aux: AuxGranules,
    run: HostPageBox<RecRun>,
    mpidr: u64,
}

impl<'r, 'a, C: RmiConduit, H: HostMemory, S: Stage2> Rec<'r, 'a, C, H, S> {
    /// Creates a REC with affinity `mpidr` that starts at `pc` with `gprs` in x0-x7. Only allowed
    /// while the realm is `New`. A REC that isn't `runnable` waits for a PSCI CPU_ON from another
    /// REC.
    pub fn create(
        realm: &'r Realm<'a, C, H, S>,
        mpidr: u64,
        gprs: [u64; REC_CREATE_NR_GPRS],
        pc: u64,
        runnable: bool,
    ) -> Result<Self> {
        if realm.state() != RealmState::New {
            return Err(Error::NotFound);
        }
        let rme = realm.rme();
        let rd = realm.rd_pa()?;

        let rec = rme.alloc_delegated(AllocMode::Blocking)?;
        let mut aux = AuxGranules::new();
        for _ in 0..realm.num_aux() {
            match rme.alloc_delegated(AllocMode::Blocking) {
                Ok(g) => aux.push(g),
                Err(e) => {
                    free_granules(rme, rec, aux);
                    return Err(e);
                }
            }
        }

        let flags = if runnable {
            RecCreateFlags::Runnable.into()
        } else {
            FlagSet::default()
        };
        let mut params = RecParams::new(mpidr, pc, gprs, flags);
        params.num_rec_aux = aux.len() as u64;
        for (slot, g) in params.aux.iter_mut().zip(aux.iter()) {
            *slot = g.pa();
        }
        let params = match HostPageBox::new_in(params, rme.mem(), AllocMode::Blocking) {
            Ok(params) => params,
            Err(e) => {
                free_granules(rme, rec, aux);
                return Err(e);
            }
        };
        let run = match HostPageBox::new_in(RecRun::default(), rme.mem(), AllocMode::Blocking) {
            Ok(run) => run,
            Err(e) => {
                params.release(rme.mem());
                free_granules(rme, rec, aux);
                return Err(e);
            }
        };

        // Safety: `params` is an initialized RecParams in a host page we own.
        let result = unsafe { api::rec_create(rme.conduit(), rec.pa(), rd, params.pa()) };
        params.release(rme.mem());
        if let Err(e) = result {
            run.release(rme.mem());
            free_granules(rme, rec, aux);
            return Err(e.into());
        }

        Ok(Self {
            realm,
            rec,
            aux,
            run,
            mpidr,
        })
    }

    /// Returns the address of the REC granule.
    pub fn pa(&self) -> u64 {
        self.rec.pa()
    }

    /// Returns the REC's affinity.
    pub fn mpidr(&self) -> u64 {
        self.mpidr
    }

    /// Returns the realm this REC belongs to.
    pub fn realm(&self) -> &'r Realm<'a, C, H, S> {
        self.realm
    }

    /// Returns the run buffer.
    pub fn run(&self) -> &RecRun {
        &self.run
    }

    /// Returns the run buffer, whose entry half is passed to the monitor on the next `enter`.
    pub fn run_mut(&mut self) -> &mut RecRun {
        &mut self.run
    }

    /// Runs the REC until it exits to the host. The exit half of the run buffer describes why.
    /// Only allowed while the realm is `Active`.
    pub fn enter(&mut self) -> Result<()> {
        if self.realm.state() != RealmState::Active {
            return Err(Error::Busy);
        }
        let conduit = self.realm.rme().conduit();
        // Safety: The run buffer is a host page owned by this REC, and `&mut self` keeps anything
        // else from touching it during the call.
        unsafe { api::rec_enter(conduit, self.rec.pa(), self.run.pa()) }?;
        Ok(())
    }

    /// Completes the PSCI request this REC made that targets `target`, e.g. CPU_ON.
    pub fn psci_complete(&self, target: &Rec<'_, 'a, C, H, S>) -> Result<()> {
        if !core::ptr::eq(self.realm, target.realm) {
            return Err(Error::InvalidArgument);
        }
        api::psci_complete(self.realm.rme().conduit(), self.pa(), target.pa())?;
        Ok(())
    }

    /// Destroys the REC and returns its granules to the host.
    ///
    /// If the monitor won't destroy the REC, all of its granules are leaked. Granules the monitor
    /// refuses to undelegate are leaked individually and the rest are still freed.
    pub fn destroy(self) -> Result<()> {
        let rme = self.realm.rme();
        if let Err(e) = api::rec_destroy(rme.conduit(), self.rec.pa()) {
            warn!("Failed to destroy REC {:#x}: {:?}", self.mpidr, e);
            self.rec.leak();
            for g in self.aux {
                g.leak();
            }
            self.run.release(rme.mem());
            return Err(e.into());
        }

        let mut result = rme.free_delegated(self.rec);
        for g in self.aux {
            if let Err(e) = rme.free_delegated(g) {
                result = result.and(Err(e));
            }
        }
        self.run.release(rme.mem());
        result
    }
}
