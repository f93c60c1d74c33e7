// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Realm Management Interface client
//!
//! Encodes the commands a host issues to the realm management monitor and decodes their results.
//!
//! - `RmiFunction` names every command along with its register arguments.
//! - `RmiConduit` is the transport; `SmcConduit` issues the SMC on real hardware.
//! - `api` wraps each command in a typed function returning `Result`.
//! - `RealmParams`, `RecParams` and `RecRun` are the structures exchanged through host memory.
#![no_std]

pub mod api;
mod conduit;
mod error;
mod exit;
mod features;
mod function;
mod params;
mod rtt;

pub use conduit::{rmi_call, RmiConduit, SmcConduit, SmcRegs};
pub use error::{Error, Result, SMCCC_RET_NOT_SUPPORTED};
pub use exit::{esr, Esr, ExitReason};
pub use features::{feature_register_0, FeatureRegister0, FeatureRegister0Helpers};
pub use function::*;
pub use params::*;
pub use rtt::*;
