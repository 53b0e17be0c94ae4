// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Implementations of [`crypto::hash`] based on `ring`.

use core::mem;

use ring::digest;

use crate::crypto::hash;

#[cfg(doc)]
use crate::crypto;

/// A `ring`-based [`hash::Engine`].
pub struct Engine {
    inner: Option<digest::Context>,
}

impl Engine {
    /// Creates a new, idle `Engine`.
    pub fn new() -> Self {
        Self { inner: None }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn algorithm(algo: hash::Algo) -> &'static digest::Algorithm {
    match algo {
        hash::Algo::Sha256 => &digest::SHA256,
        hash::Algo::Sha384 => &digest::SHA384,
        hash::Algo::Sha512 => &digest::SHA512,
    }
}

impl hash::Engine for Engine {
    fn supports(&mut self, _: hash::Algo) -> bool {
        true
    }

    fn start_raw(&mut self, algo: hash::Algo) -> Result<(), hash::Error> {
        self.inner = Some(digest::Context::new(algorithm(algo)));
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), hash::Error> {
        match &mut self.inner {
            Some(c) => c.update(data),
            None => return Err(hash::Error::Idle),
        }
        Ok(())
    }

    fn finish_raw(&mut self, out: &mut [u8]) -> Result<(), hash::Error> {
        let c = mem::take(&mut self.inner).ok_or(hash::Error::Idle)?;
        if out.len() != c.algorithm().output_len {
            return Err(hash::Error::WrongSize);
        }
        out.copy_from_slice(c.finish().as_ref());
        Ok(())
    }

    fn compare_raw(&mut self, expected: &[u8]) -> Result<(), hash::Error> {
        let c = mem::take(&mut self.inner).ok_or(hash::Error::Idle)?;
        if expected.len() != c.algorithm().output_len {
            return Err(hash::Error::WrongSize);
        }
        let digest = c.finish();
        ring::constant_time::verify_slices_are_equal(digest.as_ref(), expected)
            .map_err(|_| hash::Error::Mismatch)
    }

    fn abort_raw(&mut self) {
        self.inner = None;
    }
}
