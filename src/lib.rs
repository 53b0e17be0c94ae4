// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! `suit-core` is the storage, streaming and command-processing core of a
//! [SUIT] firmware update engine for constrained devices.
//!
//! The crate is organized bottom-up:
//! - [`hardware`] abstracts flash devices and clocks.
//! - [`storage`] manages the persistent regions: installed envelopes,
//!   boot flags, failure reports and non-volatile manifest variables.
//! - [`variables`] is the manifest-visible variable store.
//! - [`stream`] moves payload bytes from sources (integrated payloads, a
//!   local cache or a peer core) into sinks, including the digest-verifying
//!   sink.
//! - [`manifest`] decodes envelopes and command sequences.
//! - [`processor`] runs the SUIT command sequences against a
//!   [`processor::Platform`], which owns every policy decision.
//!
//! Nothing in this crate is a global: all state lives in handles (such as
//! [`storage::Storage`]) that the integration creates and passes around.
//!
//! [SUIT]: https://datatracker.ietf.org/doc/draft-ietf-suit-manifest/

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

#[macro_use]
mod debug;
pub use debug::Error;

/// `suit-core`'s result type.
///
/// Every fallible library operation returns this type; the error side is a
/// [`struct@Error`] wrapping a module-specific error enum.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

#[macro_use]
pub mod wire;

pub mod crypto;
pub mod hardware;
#[macro_use]
pub mod manifest;
pub mod mem;
pub mod plat;
pub mod processor;
pub mod storage;
pub mod stream;
pub mod variables;
