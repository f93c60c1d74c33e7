// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use tock_registers::{register_bitfields, LocalRegisterCopy};

// Layout of the status word returned in x0 by every command except `RMI_VERSION`.
register_bitfields![u64,
    pub return_status [
        class OFFSET(0) NUMBITS(8) [
            Success = 0,
            ErrorInput = 1,
            ErrorRealm = 2,
            ErrorRec = 3,
            ErrorRtt = 4,
            ErrorInUse = 5,
        ],
        index OFFSET(8) NUMBITS(8) [],
    ]
];

/// Value returned by the SMCCC dispatcher for an unimplemented function ID.
pub const SMCCC_RET_NOT_SUPPORTED: u64 = u64::MAX;

/// Errors reported by the realm management monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A command argument was malformed.
    Input,
    /// The realm descriptor was in the wrong state. Carries the auxiliary index.
    Realm(u8),
    /// The REC was in the wrong state. Carries the auxiliary index.
    Rec(u8),
    /// The RTT walk stopped early. Carries the level at which it stopped.
    Rtt(u8),
    /// The object is still referenced. Carries the auxiliary index.
    InUse(u8),
    /// A status word with an unrecognized return class.
    Unknown(u64),
    /// No monitor answered the call.
    NotSupported,
}

impl Error {
    /// Decodes the status word returned by a command, `Ok` if it reports success.
    pub fn check_status(status: u64) -> Result<()> {
        use return_status::class::Value;
        if status == SMCCC_RET_NOT_SUPPORTED {
            return Err(Error::NotSupported);
        }
        let reg = LocalRegisterCopy::<u64, return_status::Register>::new(status);
        let index = reg.read(return_status::index) as u8;
        match reg.read_as_enum(return_status::class) {
            Some(Value::Success) => Ok(()),
            Some(Value::ErrorInput) => Err(Error::Input),
            Some(Value::ErrorRealm) => Err(Error::Realm(index)),
            Some(Value::ErrorRec) => Err(Error::Rec(index)),
            Some(Value::ErrorRtt) => Err(Error::Rtt(index)),
            Some(Value::ErrorInUse) => Err(Error::InUse(index)),
            None => Err(Error::Unknown(status)),
        }
    }

    /// Returns the status word that reports this error.
    pub fn to_status(self) -> u64 {
        use return_status::{class, index};
        let (c, i) = match self {
            Error::Input => (class::ErrorInput, 0),
            Error::Realm(i) => (class::ErrorRealm, i),
            Error::Rec(i) => (class::ErrorRec, i),
            Error::Rtt(i) => (class::ErrorRtt, i),
            Error::InUse(i) => (class::ErrorInUse, i),
            Error::Unknown(raw) => return raw,
            Error::NotSupported => return SMCCC_RET_NOT_SUPPORTED,
        };
        (c + index.val(i as u64)).value
    }

    /// Returns the RTT level reported with a missing-table error, if this is one.
    pub fn rtt_level(&self) -> Option<u8> {
        match *self {
            Error::Rtt(level) => Some(level),
            _ => None,
        }
    }
}

/// Holds the result of an RMI command.
pub type Result<T> = core::result::Result<T, Error>;
