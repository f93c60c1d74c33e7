// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Host-side management of Arm CCA realms.
//!
//! The host hypervisor never touches realm memory or realm translation tables directly; it asks
//! the realm management monitor to do so over the RMI, handing over ("delegating") the granules
//! each object needs and taking them back when the object is destroyed.
//!
//! ## Key types
//!
//! - `Rme` is the per-system state: the monitor conduit, the host page allocator, the capabilities
//!   advertised at probe time and the VMID pool.
//! - `Realm` owns a realm descriptor, its RTT root (the top level table of the host's second stage
//!   address space, delegated in place) and a single spare delegated granule used by teardown
//!   paths that must not allocate.
//! - `Rec` is a realm execution context. `Rec::run_once` enters it and dispatches the exit to a
//!   `VcpuHost`.
//! - `DelegatedGranule` is a host page currently owned by the monitor.
//!
//! ## Safety
//!
//! Granules are tracked by ownership: a `DelegatedGranule` must be handed over to the monitor or
//! undelegated before its page may go back to the host allocator. If the monitor refuses to give a
//! granule back it is leaked rather than freed, since the host can no longer safely use it.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

mod error;
mod granule;
mod host_mem;
mod realm;
/// Populating protected and shared memory, and managing RIPAS.
mod realm_pages;
mod rec;
/// Entering RECs and dispatching their exits.
mod rec_exit;
mod rme;
mod rtt;
mod stage2;
/// Provides stubs for test harnesses.
#[cfg(test)]
mod test_stubs;
mod vmid;

pub use error::{Error, Result};
pub use granule::DelegatedGranule;
pub use host_mem::{AllocMode, HostMemory, HostPage, HostPageBox};
pub use realm::{Realm, RealmConfig, RealmState};
pub use rec::Rec;
pub use rec_exit::{ExitAction, TimerState, UserExit, VcpuHost};
pub use rme::{Rme, RmeConfig};
pub use stage2::{pgd_pages, Stage2};
pub use vmid::VmidAllocator;
