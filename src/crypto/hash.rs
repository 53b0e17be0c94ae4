// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic hashing.
//!
//! In general, users of this module should be pulling in [`EngineExt`],
//! which adds functions to [`Engine`] for more ergonomic usage, but which
//! would otherwise make it object-unsafe.

#[cfg(feature = "arbitrary-derive")]
use libfuzzer_sys::arbitrary::{self, Arbitrary};

/// The largest digest, in bytes, produced by any [`Algo`].
pub const MAX_DIGEST_LEN: usize = Algo::Sha512.bytes();

/// A cryptographic hashing algorithm.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "arbitrary-derive", derive(Arbitrary))]
pub enum Algo {
    /// 256-bit SHA-2.
    Sha256,
    /// 384-bit SHA-2.
    Sha384,
    /// 512-bit SHA-2.
    Sha512,
}

impl Algo {
    /// The number of bits in a digest of this strength.
    #[inline]
    pub const fn bits(self) -> usize {
        match self {
            Self::Sha256 => 256,
            Self::Sha384 => 384,
            Self::Sha512 => 512,
        }
    }

    /// The number of bytes in a digest of this strength.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.bits() / 8
    }

    /// The COSE algorithm identifier for this algorithm, as used in SUIT
    /// digest structures.
    #[inline]
    pub const fn cose_id(self) -> i32 {
        match self {
            Self::Sha256 => -16,
            Self::Sha384 => -43,
            Self::Sha512 => -44,
        }
    }

    /// Looks up an algorithm by its COSE algorithm identifier.
    pub fn from_cose_id(id: i32) -> Option<Self> {
        match id {
            -16 => Some(Self::Sha256),
            -43 => Some(Self::Sha384),
            -44 => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// An error returned by a hashing function.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The wrong size of digest was provided to [`Engine::finish_raw()`] or
    /// [`Engine::compare_raw()`].
    WrongSize,

    /// The engine was idle, but a write or finish operation was requested.
    Idle,

    /// [`Engine::compare_raw()`] computed a digest other than the expected
    /// one.
    Mismatch,

    /// An unspecified, internal error.
    Unspecified,
}

/// A hashing engine, which maintains the state for one digest.
///
/// Callers should not use the `raw` API directly; [`Hasher`] is a type-safe
/// wrapper that manages a session with an `Engine`.
///
/// After `finish_raw()`, `compare_raw()` or `abort_raw()`, the engine is idle
/// regardless of the outcome, and further writes fail with [`Error::Idle`].
pub trait Engine {
    /// Returns whether this engine supports the given algorithm.
    fn supports(&mut self, algo: Algo) -> bool;

    /// Begins a new hashing operation, discarding any previous state.
    fn start_raw(&mut self, algo: Algo) -> Result<(), Error>;

    /// Adds `data` to the hashing state.
    fn write_raw(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Completes the hashing operation.
    fn finish_raw(&mut self, out: &mut [u8]) -> Result<(), Error>;

    /// Completes the hashing operation, and then compares it to `expected`.
    ///
    /// Returns `Ok(())` if the digests matched, and [`Error::Mismatch`] if
    /// they did not.
    fn compare_raw(&mut self, expected: &[u8]) -> Result<(), Error>;

    /// Discards any in-progress hashing operation.
    fn abort_raw(&mut self);
}

/// Helpers for creating a [`Hasher`] from an [`Engine`].
#[extend::ext(name = EngineExt)]
pub impl<E: Engine + ?Sized> E {
    /// Begins a new hashing operation.
    ///
    /// Implementers do not need to implement this function themselves.
    #[inline]
    fn new_hash(&mut self, algo: Algo) -> Result<Hasher<&mut Self>, Error> {
        self.start_raw(algo)?;
        Ok(Hasher { engine: self })
    }

    /// Convenience helper for hashing a contiguous memory region.
    ///
    /// Implementers do not need to implement this function themselves.
    #[inline]
    fn contiguous_hash(
        &mut self,
        algo: Algo,
        buf: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error> {
        let mut h = self.new_hash(algo)?;
        h.write(buf)?;
        h.finish(out)
    }
}

// Ensure Engine is object-safe.
impl dyn Engine {}

/// A helper for managing a hashing operation with an [`Engine`].
///
/// Users should prefer to use this instead of calling [`Engine`]'s raw API
/// directly.
pub struct Hasher<E> {
    engine: E,
}

impl<E: Engine + ?Sized> Hasher<&mut E> {
    /// Adds `data` to the hashing state.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.engine.write_raw(data)
    }

    /// Completes the hashing operation, writing the result to `out`.
    pub fn finish(self, out: &mut [u8]) -> Result<(), Error> {
        self.engine.finish_raw(out)
    }

    /// Completes the hashing operation, comparing the result to `expected`.
    pub fn expect(self, expected: &[u8]) -> Result<(), Error> {
        self.engine.compare_raw(expected)
    }
}
