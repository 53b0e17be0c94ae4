// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable cryptography traits.
//!
//! The update engine needs message digests for payload verification, for
//! the manifest digest and for its own digest-protected storage areas. This
//! module provides an object-safe trait that abstracts over the digest
//! engine, so integrations can plug in hardware accelerators.
//!
//! Signature verification is deliberately absent: it is a policy decision
//! delegated to the [`Platform`](crate::processor::Platform).
//!
//! A software implementation is provided under the [`ring` module], based on
//! the [`ring`] crate. Its presence is controlled by the `ring` feature flag.
//!
//! [`ring` module]: ring/index.html

pub mod hash;

#[cfg(feature = "ring")]
pub mod ring;
