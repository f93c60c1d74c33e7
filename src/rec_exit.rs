// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Handling of REC exits.
//!
//! After every entry the monitor reports why the REC stopped. Most exits are forwarded to the
//! host's generic vCPU handlers through `VcpuHost` with the realm's registers loaded into the
//! host's vCPU model; RIPAS changes are handled here since they only concern the RTT.

use log::{error, warn};
use rmi::{esr, Esr, ExitReason, RecRun, Ripas, RmiConduit, REC_RUN_GPRS};

use crate::host_mem::HostMemory;
use crate::rec::Rec;
use crate::stage2::Stage2;
use crate::{Error, Result};

/// Why control has to go to the management layer in user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserExit {
    /// Nothing in particular; the caller should check the vCPU and re-enter.
    Unknown,
    /// The exit couldn't be handled.
    InternalError,
    /// An MMIO access needs emulating.
    Mmio,
    /// The realm asked for a power state change of the whole system.
    SystemEvent,
    /// A host call needs handling in user space.
    Hypercall,
}

/// What to do after an exit was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Enter the REC again.
    Resume,
    /// Return to the management layer.
    ToUser(UserExit),
}

/// Generic timer state reported on exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerState {
    pub cntv_ctl: u64,
    pub cntv_cval: u64,
    pub cntp_ctl: u64,
    pub cntp_cval: u64,
}

/// The host's model of a vCPU and its generic exit handlers.
pub trait VcpuHost {
    /// Returns general purpose register `index`, which is at most 30.
    fn reg(&self, index: usize) -> u64;

    /// Sets general purpose register `index`, which is at most 30.
    fn set_reg(&mut self, index: usize, value: u64);

    /// Records the syndrome and fault addresses of the last exit.
    fn set_fault_info(&mut self, esr: u64, far: u64, hpfar: u64);

    /// Loads the realm's timer state.
    fn set_timers(&mut self, timers: TimerState);

    /// Lets the timer emulation act on the state from `set_timers`.
    fn update_timers(&mut self);

    /// Handles a stage 2 fault.
    fn handle_guest_abort(&mut self, esr: Esr) -> Result<ExitAction>;

    /// Emulates a trapped system register access. A read leaves the result in the transfer
    /// register.
    fn handle_sys_reg(&mut self, esr: Esr) -> Result<ExitAction>;

    /// Handles a PSCI call with its arguments in x0-x3.
    fn handle_psci(&mut self) -> Result<ExitAction>;

    /// Handles a host call. Results are left in the registers.
    fn handle_hypercall(&mut self) -> Result<ExitAction>;
}

// Number of registers a PSCI call returns.
const PSCI_RESULT_REGS: usize = 4;

// A transfer register field of 31 names XZR: reads are zero and writes are discarded.
const ZERO_REG: usize = 31;

fn load_gprs<V: VcpuHost>(vcpu: &mut V, run: &RecRun) {
    for (i, value) in run.exit.gprs.iter().enumerate() {
        vcpu.set_reg(i, *value);
    }
}

fn read_transfer_reg<V: VcpuHost>(vcpu: &V, index: usize) -> u64 {
    if index == ZERO_REG {
        0
    } else {
        vcpu.reg(index)
    }
}

fn write_transfer_reg<V: VcpuHost>(vcpu: &mut V, index: usize, value: u64) {
    if index != ZERO_REG {
        vcpu.set_reg(index, value);
    }
}

impl<'r, 'a, C: RmiConduit, H: HostMemory, S: Stage2> Rec<'r, 'a, C, H, S> {
    /// Enters the REC and handles the resulting exit.
    pub fn run_once<V: VcpuHost>(&mut self, vcpu: &mut V) -> Result<ExitAction> {
        let status = self.enter();
        self.handle_exit(vcpu, status)
    }

    /// Handles the exit that ended an entry whose outcome was `status`.
    pub fn handle_exit<V: VcpuHost>(
        &mut self,
        vcpu: &mut V,
        status: Result<()>,
    ) -> Result<ExitAction> {
        match status {
            Ok(()) => (),
            // A power off raced with the entry.
            Err(Error::Rmi(rmi::Error::Realm(1))) => {
                return Ok(ExitAction::ToUser(UserExit::Unknown));
            }
            Err(e) => return Err(e),
        }

        let run = self.run_mut();
        vcpu.set_fault_info(run.exit.esr, run.exit.far, run.exit.hpfar);
        vcpu.set_timers(TimerState {
            cntv_ctl: run.exit.cntv_ctl,
            cntv_cval: run.exit.cntv_cval,
            cntp_ctl: run.exit.cntp_ctl,
            cntp_cval: run.exit.cntp_cval,
        });
        vcpu.update_timers();
        run.entry.flags = 0;

        let reason = run.exit.exit_reason;
        match ExitReason::from_raw(reason) {
            Some(ExitReason::Sync) => self.handle_sync(vcpu),
            Some(ExitReason::Irq) | Some(ExitReason::Fiq) => Ok(ExitAction::Resume),
            Some(ExitReason::Psci) => self.handle_psci(vcpu),
            Some(ExitReason::RipasChange) => Ok(self.handle_ripas_change()),
            Some(ExitReason::HostCall) => self.handle_host_call(vcpu),
            Some(ExitReason::SError) | None => {
                error!("Unhandled REC exit reason {}", reason);
                Ok(ExitAction::ToUser(UserExit::InternalError))
            }
        }
    }

    fn handle_sync<V: VcpuHost>(&mut self, vcpu: &mut V) -> Result<ExitAction> {
        let run = self.run_mut();
        let syndrome = Esr::new(run.exit.esr);
        match syndrome.read_as_enum(esr::ec) {
            Some(esr::ec::Value::DabtLow) => {
                if syndrome.is_set(esr::dabt_wnr) && syndrome.is_set(esr::dabt_isv) {
                    let srt = syndrome.read(esr::dabt_srt) as usize;
                    write_transfer_reg(vcpu, srt, run.exit.gprs[0]);
                }
                vcpu.handle_guest_abort(syndrome)
            }
            Some(esr::ec::Value::Sys64) => {
                let rt = syndrome.read(esr::sys64_rt) as usize;
                match syndrome.read_as_enum(esr::sys64_direction) {
                    Some(esr::sys64_direction::Value::Read) => {
                        let action = vcpu.handle_sys_reg(syndrome)?;
                        run.entry.gprs[0] = read_transfer_reg(vcpu, rt);
                        Ok(action)
                    }
                    _ => {
                        write_transfer_reg(vcpu, rt, run.exit.gprs[0]);
                        vcpu.handle_sys_reg(syndrome)
                    }
                }
            }
            _ => {
                error!(
                    "Unhandled exception class {:#x} in REC exit, ESR {:#x}",
                    syndrome.read(esr::ec),
                    syndrome.get()
                );
                Err(Error::UnhandledExit(syndrome.get()))
            }
        }
    }

    fn handle_psci<V: VcpuHost>(&mut self, vcpu: &mut V) -> Result<ExitAction> {
        let run = self.run_mut();
        load_gprs(vcpu, run);
        let action = vcpu.handle_psci()?;
        for i in 0..PSCI_RESULT_REGS {
            run.entry.gprs[i] = vcpu.reg(i);
        }
        Ok(action)
    }

    fn handle_ripas_change(&self) -> ExitAction {
        let exit = &self.run().exit;
        let (base, size) = (exit.ripas_base, exit.ripas_size);
        let ripas = Ripas::from_reg(exit.ripas_value);
        let realm = self.realm();
        let end = base.wrapping_add(size);
        if size == 0
            || end < base
            || !realm.is_addr_protected(base)
            || !realm.is_addr_protected(end - 1)
        {
            warn!(
                "Ignoring RIPAS change of {:#x}+{:#x} outside the protected space",
                base, size
            );
            return ExitAction::Resume;
        }
        if let Err(e) = realm.set_isolation_state(self, base, end, ripas) {
            warn!(
                "Failed to set RIPAS of {:#x}-{:#x} to {:?}: {:?}",
                base, end, ripas, e
            );
        }
        ExitAction::Resume
    }

    fn handle_host_call<V: VcpuHost>(&mut self, vcpu: &mut V) -> Result<ExitAction> {
        let run = self.run_mut();
        load_gprs(vcpu, run);
        let action = match vcpu.handle_hypercall() {
            Ok(action) => action,
            Err(_) => {
                vcpu.set_reg(0, !0);
                ExitAction::Resume
            }
        };
        for i in 0..REC_RUN_GPRS {
            run.entry.gprs[i] = vcpu.reg(i);
        }
        Ok(action)
    }
}
