// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Digest-verifying sinks.
//!
//! A [`DigestPool`] owns a fixed number of hash engines. Each
//! [`DigestSink`] checks one out for as long as it lives, hashing everything
//! written to it; the comparison against the expected digest is deferred
//! until [`DigestSink::digest_match()`], since payloads are never buffered.
//!
//! A slot is returned to the pool when its sink is released or dropped, so a
//! released sink cannot be used again.

use core::cell::RefCell;
use core::cell::RefMut;

use arrayvec::ArrayVec;

use crate::crypto::hash;
use crate::plat;
use crate::stream::Sink;

/// The outcome of [`DigestSink::digest_match()`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Match {
    /// The streamed bytes hash to the expected digest.
    Match,
    /// They do not.
    Mismatch,
}

/// A fixed-capacity pool of `N` hash engines.
pub struct DigestPool<E, const N: usize> {
    slots: [RefCell<E>; N],
}

impl<E: hash::Engine, const N: usize> DigestPool<E, N> {
    /// Creates a pool out of `engines`.
    pub fn new(engines: [E; N]) -> Self {
        Self {
            slots: engines.map(RefCell::new),
        }
    }

    /// Checks out an engine and starts hashing with `algo`, to be compared
    /// against `expected` at the end of the stream.
    ///
    /// Fails with [`plat::Error::NoResources`] when every engine is checked
    /// out; this is expected under load, and callers should retry once a
    /// sink has been released.
    pub fn get(
        &self,
        algo: hash::Algo,
        expected: &[u8],
    ) -> crate::Result<DigestSink<'_, E>, plat::Error> {
        check!(expected.len() == algo.bytes(), plat::Error::Inval);

        let mut engine = self
            .slots
            .iter()
            .find_map(|slot| slot.try_borrow_mut().ok())
            .ok_or_else(|| fail!(plat::Error::NoResources))?;
        check!(engine.supports(algo), plat::Error::Inval);
        engine.start_raw(algo).map_err(|e| {
            fail!(plat::Error::Crash, "could not start {:?}: {:?}", algo, e)
        })?;

        let mut digest = ArrayVec::new();
        // Length checked above; every algorithm fits.
        let _ = digest.try_extend_from_slice(expected);
        Ok(DigestSink {
            engine,
            expected: digest,
            finished: false,
        })
    }

    /// Returns the number of engines not currently checked out.
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.try_borrow_mut().is_ok())
            .count()
    }
}

/// A [`Sink`] that hashes everything written to it.
pub struct DigestSink<'pool, E: hash::Engine> {
    engine: RefMut<'pool, E>,
    expected: ArrayVec<u8, { hash::MAX_DIGEST_LEN }>,
    finished: bool,
}

impl<E: hash::Engine> DigestSink<'_, E> {
    /// Finishes hashing and compares the result to the expected digest.
    ///
    /// This can only be called once; the sink refuses further writes
    /// afterwards.
    pub fn digest_match(&mut self) -> crate::Result<Match, plat::Error> {
        check!(!self.finished, plat::Error::IncorrectState);
        self.finished = true;

        match self.engine.compare_raw(&self.expected) {
            Ok(()) => Ok(Match::Match),
            Err(hash::Error::Mismatch) => {
                // Engines may hold error state after a failed comparison;
                // the slot must come back clean.
                self.engine.abort_raw();
                Ok(Match::Mismatch)
            }
            Err(e) => {
                self.engine.abort_raw();
                Err(fail!(plat::Error::Crash, "digest comparison failed: {:?}", e))
            }
        }
    }

    /// Returns the slot to the pool.
    pub fn release(self) {}
}

impl<E: hash::Engine> Sink for DigestSink<'_, E> {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        if self.finished {
            return Err(plat::Error::IncorrectState);
        }
        self.engine.write_raw(data).map_err(plat::Error::from)
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        Ok(0)
    }
}

impl<E: hash::Engine> Drop for DigestSink<'_, E> {
    fn drop(&mut self) {
        self.engine.abort_raw();
        for b in &mut self.expected {
            *b = 0;
        }
    }
}
