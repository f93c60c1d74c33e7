// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

// errno values returned to the control surface.
const ENXIO: i32 = 6;
const ENOMEM: i32 = 12;
const EIO: i32 = 5;
const EBUSY: i32 = 16;
const ENOENT: i32 = 2;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EOPNOTSUPP: i32 = 95;

/// Realm management errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The monitor rejected a command.
    Rmi(rmi::Error),
    /// A host page allocation failed.
    OutOfMemory,
    /// The realm is not in a state that allows the operation.
    Busy,
    /// The realm has no descriptor in a state the REC operation needs.
    NotFound,
    InvalidArgument,
    /// The monitor refused to give a granule back. The granule has been leaked.
    Leaked,
    VmidExhausted,
    /// Realm support is disabled.
    Unsupported,
    /// A missing RTT level was reported again after the levels were created.
    RttProtocol,
    /// The REC exited with an exception the host can't handle. Carries the syndrome.
    UnhandledExit(u64),
}

impl Error {
    /// Returns the negative errno reported for this error.
    pub fn to_errno(self) -> i32 {
        use Error::*;
        -match self {
            Rmi(_) | RttProtocol | UnhandledExit(_) => ENXIO,
            OutOfMemory => ENOMEM,
            Busy => EBUSY,
            NotFound => ENOENT,
            InvalidArgument => EINVAL,
            Leaked => EIO,
            VmidExhausted => ENOSPC,
            Unsupported => EOPNOTSUPP,
        }
    }
}

impl From<rmi::Error> for Error {
    fn from(e: rmi::Error) -> Self {
        Error::Rmi(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
