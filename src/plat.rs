// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Platform result codes.
//!
//! Storage, variable and streaming operations all report failure through the
//! small [`Error`] enum in this module. Success is `Ok(_)`; there is no
//! separate "success" code.

use core::fmt;

use crate::crypto::hash;
use crate::hardware::flash;
use crate::mem::OutOfMemory;

/// A platform-level error.
///
/// None of these are retried internally; retry policy belongs to the caller.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Error {
    /// A required argument was missing or malformed.
    Inval,
    /// A length did not fit the destination, or a value was too large.
    Size,
    /// An index or address was outside the configured range.
    OutOfBounds,
    /// The requested item does not exist, or its storage is erased.
    NotFound,
    /// The backing device did not report itself ready.
    HwNotReady,
    /// A device operation failed.
    Io,
    /// A fixed-capacity pool has no free entries.
    NoResources,
    /// The operation is not valid in the current state.
    IncorrectState,
    /// An internal invariant was violated.
    Crash,
    /// A stream made no progress within its timeout.
    Timeout,
    /// A digest-protected area failed verification.
    Authentication,
    /// The operation is not supported by this implementation.
    Unsupported,
    /// A bounded queue is full; the caller may try again later.
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Inval => "invalid argument",
            Self::Size => "size out of range",
            Self::OutOfBounds => "out of bounds",
            Self::NotFound => "not found",
            Self::HwNotReady => "hardware not ready",
            Self::Io => "i/o failure",
            Self::NoResources => "no resources",
            Self::IncorrectState => "incorrect state",
            Self::Crash => "internal failure",
            Self::Timeout => "timed out",
            Self::Authentication => "authentication failure",
            Self::Unsupported => "unsupported",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

impl From<flash::Error> for Error {
    fn from(e: flash::Error) -> Self {
        match e {
            flash::Error::OutOfRange => Self::OutOfBounds,
            flash::Error::Locked => Self::Io,
            flash::Error::NotReady => Self::HwNotReady,
            flash::Error::Misaligned => Self::Inval,
            flash::Error::Internal => Self::Crash,
            flash::Error::Unspecified => Self::Io,
        }
    }
}

impl From<hash::Error> for Error {
    fn from(e: hash::Error) -> Self {
        match e {
            hash::Error::WrongSize => Self::Inval,
            hash::Error::Idle => Self::IncorrectState,
            hash::Error::Mismatch | hash::Error::Unspecified => Self::Crash,
        }
    }
}

impl From<OutOfMemory> for Error {
    fn from(_: OutOfMemory) -> Self {
        Self::NoResources
    }
}

debug_from!(Error => flash::Error, hash::Error, OutOfMemory);
