// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Implementations of crypto traits, using the [`ring`] crate.
//!
//! These are software implementations suitable for host builds, tests and
//! tooling; integrations with a hardware crypto accelerator provide their
//! own [`crypto`] implementations instead.
//!
//! The [`ring` warranty disclaimer] applies to this module as well.
//!
//! [`ring` warranty disclaimer]: https://github.com/briansmith/ring/blob/main/README.md

pub mod hash;

#[cfg(doc)]
use crate::crypto;
