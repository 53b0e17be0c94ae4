// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The policy boundary between the processor and the integration.
//!
//! The processor never touches a component directly and never decides on
//! its own whether something is allowed: every security-relevant step goes
//! through a [`Platform`] method first. Predicates come in two flavors:
//! - authorizations (`authorize_*`, [`Platform::check_operation()`]) return
//!   `Err` to deny, which always ends the run;
//! - conditions (`check_*_id`, [`Platform::check_slot()`],
//!   [`Platform::check_content()`]) return `Ok(false)` when they do not
//!   hold, which a `try-each` may recover from.

use core::fmt;

use crate::manifest::cbor;
use crate::manifest::ComponentId;
use crate::manifest::Sign1;
use crate::manifest::Uuid;
use crate::plat;
use crate::storage::ManifestPolicy;
use crate::storage::SignatureCheck;
use crate::stream::Sink;

/// Why a manifest is being processed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Trigger {
    /// A new envelope is being installed.
    Update,
    /// An installed envelope is being booted.
    Boot,
}

/// A side-effecting operation on a component.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operation {
    /// Reading the component's contents.
    Read,
    /// Writing literal contents into the component.
    Write,
    /// Streaming a payload into the component.
    Fetch,
    /// Copying another component into this one.
    Copy,
    /// Exchanging this component's contents with another's.
    Swap,
    /// Starting the component.
    Invoke,
}

/// Integration-provided policy and component access.
///
/// Methods returning `Result<(), plat::Error>` are authorizations: any error
/// is a denial. Methods returning `Result<bool, plat::Error>` are
/// conditions: `Ok(false)` means the condition does not hold, while an error
/// means it could not be evaluated.
pub trait Platform {
    /// A handle to an acquired component.
    type Handle: Copy + fmt::Debug;

    /// Verifies `signature` over the detached `payload`, the encoded manifest
    /// digest, for a manifest of class `class_id`.
    ///
    /// [`write_sig_structure()`] produces the bytes the signature covers.
    fn authenticate(
        &mut self,
        class_id: &Uuid,
        signature: &Sign1,
        payload: &[u8],
    ) -> Result<(), plat::Error>;

    /// Decides whether an unsigned manifest of class `class_id` may be
    /// processed.
    ///
    /// By default, this follows the class's provisioned signature policy.
    fn authorize_unsigned_manifest(
        &mut self,
        class_id: &Uuid,
        policy: &ManifestPolicy,
        trigger: Trigger,
    ) -> Result<(), plat::Error> {
        let _ = class_id;
        let allowed = match policy.signature_check {
            SignatureCheck::Disabled => true,
            SignatureCheck::OnUpdate => trigger == Trigger::Boot,
            SignatureCheck::OnUpdateAndBoot => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(plat::Error::Authentication)
        }
    }

    /// Decides whether a manifest with sequence number `candidate` may
    /// replace the installed one, whose sequence number is `installed`.
    ///
    /// By default, classes with downgrade prevention only accept strictly
    /// increasing sequence numbers.
    fn authorize_sequence_number(
        &mut self,
        class_id: &Uuid,
        policy: &ManifestPolicy,
        candidate: u32,
        installed: Option<u32>,
    ) -> Result<(), plat::Error> {
        let _ = class_id;
        match installed {
            Some(installed) if policy.downgrade_prevention && candidate <= installed => {
                Err(plat::Error::Authentication)
            }
            _ => Ok(()),
        }
    }

    /// Decides whether a manifest of class `class_id` may operate on the
    /// component `id` at all.
    fn authorize_component(
        &mut self,
        class_id: &Uuid,
        id: &ComponentId,
    ) -> Result<(), plat::Error>;

    /// Checks the vendor id of a component.
    fn check_vendor_id(
        &mut self,
        handle: Self::Handle,
        vendor_id: &Uuid,
    ) -> Result<bool, plat::Error>;

    /// Checks the class id of a component.
    fn check_class_id(
        &mut self,
        handle: Self::Handle,
        class_id: &Uuid,
    ) -> Result<bool, plat::Error>;

    /// Checks the id of this device.
    fn check_device_id(&mut self, device_id: &Uuid) -> Result<bool, plat::Error> {
        let _ = device_id;
        Err(plat::Error::Unsupported)
    }

    /// Checks which slot of a component is active.
    fn check_slot(
        &mut self,
        handle: Self::Handle,
        slot: u32,
    ) -> Result<bool, plat::Error> {
        let _ = (handle, slot);
        Err(plat::Error::Unsupported)
    }

    /// Checks whether a component starts with `content`.
    ///
    /// By default, this compares against [`Platform::read()`].
    fn check_content(
        &mut self,
        handle: Self::Handle,
        content: &[u8],
    ) -> Result<bool, plat::Error> {
        let mut buf = [0; 32];
        let mut offset = 0;
        while offset < content.len() {
            let want = (content.len() - offset).min(buf.len());
            let n = self.read(handle, offset as u32, &mut buf[..want])?;
            if n == 0 || n > want || buf[..n] != content[offset..offset + n] {
                return Ok(false);
            }
            offset += n;
        }
        Ok(true)
    }

    /// Decides whether `op` may be performed on a component.
    ///
    /// This is consulted in both processing passes, before anything happens
    /// to the component.
    fn check_operation(
        &mut self,
        handle: Self::Handle,
        op: Operation,
    ) -> Result<(), plat::Error>;

    /// Acquires the component `id`.
    fn acquire(&mut self, id: &ComponentId) -> Result<Self::Handle, plat::Error>;

    /// Releases a handle returned by [`Platform::acquire()`].
    ///
    /// Every acquired handle is released at the end of a run, whether it
    /// succeeded or not.
    fn release(&mut self, handle: Self::Handle);

    /// Returns a sink that writes into a component.
    fn sink(&mut self, handle: Self::Handle) -> Result<&mut dyn Sink, plat::Error>;

    /// Reads a component's contents at `offset` into `out`, returning the
    /// number of bytes read; zero means the end of the component.
    fn read(
        &mut self,
        handle: Self::Handle,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, plat::Error>;

    /// Exchanges the contents of two components.
    fn swap(
        &mut self,
        target: Self::Handle,
        source: Self::Handle,
    ) -> Result<(), plat::Error> {
        let _ = (target, source);
        Err(plat::Error::Unsupported)
    }

    /// Starts a component.
    fn invoke(&mut self, handle: Self::Handle) -> Result<(), plat::Error>;
}

/// Writes the COSE `Sig_structure` that `signature` covers, given the
/// detached `payload`, into `out`.
///
/// This is the CBOR array `["Signature1", protected, h'', payload]`.
pub fn write_sig_structure(
    signature: &Sign1,
    payload: &[u8],
    out: &mut dyn Sink,
) -> Result<(), plat::Error> {
    const CONTEXT: &str = "Signature1";

    out.write(&cbor::encode_head(4, 4))?;
    out.write(&cbor::encode_head(3, CONTEXT.len() as u32))?;
    out.write(CONTEXT.as_bytes())?;
    out.write(&cbor::encode_head(2, signature.protected.len() as u32))?;
    out.write(signature.protected)?;
    out.write(&cbor::encode_head(2, 0))?;
    out.write(&cbor::encode_head(2, payload.len() as u32))?;
    out.write(payload)
}
