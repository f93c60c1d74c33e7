// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use tock_registers::{register_bitfields, LocalRegisterCopy};

/// Reason a REC returned to the host, from `RecExit::exit_reason`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Synchronous exception; details in `esr`.
    Sync = 0,
    /// Physical IRQ taken while the realm was running.
    Irq = 1,
    /// Physical FIQ taken while the realm was running.
    Fiq = 2,
    /// The realm made a PSCI call the host must handle.
    Psci = 3,
    /// The realm asked to change the RIPAS of a range.
    RipasChange = 4,
    /// The realm made a host call.
    HostCall = 5,
    /// SError taken while the realm was running.
    SError = 6,
}

impl ExitReason {
    /// Parses `Self` from the raw exit reason byte.
    pub fn from_raw(raw: u8) -> Option<Self> {
        use ExitReason::*;
        match raw {
            0 => Some(Sync),
            1 => Some(Irq),
            2 => Some(Fiq),
            3 => Some(Psci),
            4 => Some(RipasChange),
            5 => Some(HostCall),
            6 => Some(SError),
            _ => None,
        }
    }
}

// Exception syndrome, as reported in `RecExit::esr`. Fields after `il` are only meaningful
// for the exception classes noted.
register_bitfields![u64,
    pub esr [
        ec OFFSET(26) NUMBITS(6) [
            Unknown = 0x00,
            Sys64 = 0x18,
            IabtLow = 0x20,
            DabtLow = 0x24,
        ],
        il OFFSET(25) NUMBITS(1) [],
        iss OFFSET(0) NUMBITS(25) [],
        // Data abort: the syndrome below is valid.
        dabt_isv OFFSET(24) NUMBITS(1) [],
        // Data abort: register transferred by the access.
        dabt_srt OFFSET(16) NUMBITS(5) [],
        // Data abort: write, not read.
        dabt_wnr OFFSET(6) NUMBITS(1) [],
        // System register access: register transferred.
        sys64_rt OFFSET(5) NUMBITS(5) [],
        sys64_direction OFFSET(0) NUMBITS(1) [
            Write = 0,
            Read = 1,
        ],
    ]
];

/// A copy of an exception syndrome register value.
pub type Esr = LocalRegisterCopy<u64, esr::Register>;
