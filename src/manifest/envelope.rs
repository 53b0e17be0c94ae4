// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! SUIT envelopes.

use arrayvec::ArrayVec;

use crate::manifest::cbor;
use crate::manifest::cbor::Item;
use crate::manifest::cbor::Scalar;
use crate::manifest::label;
use crate::manifest::Digest;
use crate::manifest::Error;
use crate::manifest::Manifest;
use crate::manifest::WRONG_SHAPE;

/// The largest number of signatures in an authentication wrapper.
pub const MAX_SIGNATURES: usize = 4;

/// The largest number of integrated payloads in an envelope.
pub const MAX_PAYLOADS: usize = 8;

/// A `COSE_Sign1` structure from an authentication wrapper.
///
/// The payload is always detached: it is the encoded manifest digest.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Sign1<'a> {
    /// The encoded protected header map, as covered by the signature.
    pub protected: &'a [u8],
    /// The COSE signature algorithm from the protected header.
    pub alg: Option<i32>,
    /// The key id from the unprotected header.
    pub kid: Option<&'a [u8]>,
    /// The signature.
    pub signature: &'a [u8],
}

impl<'a> Sign1<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        let mut protected = None;
        let mut kid = None;
        let mut signature = None;
        let mut index = 0;
        untrusted::Input::from(bytes).read_all(cbor::Error::BadEncoding, |r| {
            Item::parse(r)?.into_array()?.with(|item| {
                match index {
                    0 => protected = Some(item.into_bytes()?),
                    1 => {
                        kid = item.into_map()?.walk(|m| {
                            m.get(label::COSE_KID)?.map(Item::into_bytes).transpose()
                        })?
                    }
                    // The payload must be detached.
                    2 => match item {
                        Item::Scalar(Scalar::Null) => {}
                        _ => return Err(cbor::Error::UnexpectedType),
                    },
                    3 => signature = Some(item.into_bytes()?),
                    _ => return Err(cbor::Error::UnexpectedType),
                }
                index += 1;
                Ok(())
            })
        })?;

        let (protected, signature) =
            protected.zip(signature).ok_or(WRONG_SHAPE)?;
        let alg = if protected.is_empty() {
            None
        } else {
            untrusted::Input::from(protected).read_all(
                Error::Malformed(cbor::Error::BadEncoding),
                |r| {
                    let alg = Item::parse(r)?.into_map()?.walk(|m| {
                        m.get(label::COSE_ALG)?.map(Item::into_int).transpose()
                    })?;
                    Ok(alg.map(|a| a.to_i32()).transpose()?)
                },
            )?
        };

        Ok(Self {
            protected,
            alg,
            kid,
            signature,
        })
    }
}

/// A decoded SUIT envelope.
///
/// Decoding an envelope only checks that it is well-formed; nothing here is
/// authenticated until the processor checks [`Envelope::digest`] and the
/// signatures over it.
#[derive(Clone, Debug)]
pub struct Envelope<'a> {
    /// The manifest digest claimed by the authentication wrapper.
    pub digest: Digest<'a>,
    /// The encoded `SUIT_Digest`, which is the signed payload.
    pub digest_bytes: &'a [u8],
    /// The signatures over [`Envelope::digest_bytes`].
    pub signatures: ArrayVec<Sign1<'a>, MAX_SIGNATURES>,
    /// The encoded manifest, without its byte string header.
    pub manifest_bytes: &'a [u8],
    /// The decoded manifest.
    pub manifest: Manifest<'a>,
    payloads: ArrayVec<(&'a str, &'a [u8]), MAX_PAYLOADS>,
}

impl<'a> Envelope<'a> {
    /// Decodes the envelope in `bytes`.
    pub fn parse(bytes: &'a [u8]) -> crate::Result<Self, Error> {
        Self::parse_inner(bytes).map_err(|e| fail!(e))
    }

    fn parse_inner(bytes: &'a [u8]) -> Result<Self, Error> {
        let mut auth = None;
        let mut manifest_bytes = None;
        let mut payloads = ArrayVec::new();
        let mut err = None;

        untrusted::Input::from(bytes).read_all(cbor::Error::BadEncoding, |r| {
            Item::parse(r)?.into_map()?.walk(|m| {
                auth = Some(m.must_get(label::AUTHENTICATION_WRAPPER)?.into_bytes()?);
                manifest_bytes = Some(m.must_get(label::MANIFEST)?.into_bytes()?);
                m.with(|(key, value)| {
                    match key {
                        Scalar::Utf8(name) => {
                            let payload = value.into_bytes()?;
                            if payloads.try_push((name, payload)).is_err() {
                                err = Some(Error::CapacityExceeded);
                                return Err(cbor::Error::UnexpectedType);
                            }
                        }
                        // Severed or unsupported elements.
                        _ => value.ignore()?,
                    }
                    Ok(())
                })
            })
        })
        .map_err(|e| err.unwrap_or(Error::Malformed(e)))?;
        let (auth, manifest_bytes) = auth.zip(manifest_bytes).ok_or(WRONG_SHAPE)?;

        let mut digest_bytes = None;
        let mut signatures = ArrayVec::new();
        untrusted::Input::from(auth).read_all(cbor::Error::BadEncoding, |r| {
            Item::parse(r)?.into_array()?.with(|item| {
                let bytes = item.into_bytes()?;
                if digest_bytes.is_none() {
                    digest_bytes = Some(bytes);
                    return Ok(());
                }
                match Sign1::parse(bytes) {
                    Ok(sig) => {
                        if signatures.try_push(sig).is_err() {
                            err = Some(Error::CapacityExceeded);
                            return Err(cbor::Error::UnexpectedType);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        err = Some(e);
                        Err(cbor::Error::UnexpectedType)
                    }
                }
            })
        })
        .map_err(|e| err.unwrap_or(Error::Malformed(e)))?;

        let digest_bytes = digest_bytes.ok_or(WRONG_SHAPE)?;
        let digest = untrusted::Input::from(digest_bytes)
            .read_all(Error::Malformed(cbor::Error::BadEncoding), |r| {
                Digest::parse(Item::parse(r)?)
            })?;

        let manifest = untrusted::Input::from(manifest_bytes).read_all(
            Error::Malformed(cbor::Error::BadEncoding),
            Manifest::parse,
        )?;

        Ok(Self {
            digest,
            digest_bytes,
            signatures,
            manifest_bytes,
            manifest,
            payloads,
        })
    }

    /// Returns the byte string header that wraps
    /// [`Envelope::manifest_bytes`] in the envelope.
    ///
    /// The manifest digest covers the header and the manifest together.
    pub fn manifest_header(&self) -> ArrayVec<u8, 5> {
        cbor::encode_head(2, self.manifest_bytes.len() as u32)
    }

    /// Looks up the integrated payload named `uri`.
    pub fn payload(&self, uri: &str) -> Option<&'a [u8]> {
        self.payloads
            .iter()
            .find(|(name, _)| *name == uri)
            .map(|(_, payload)| *payload)
    }

    /// Returns every integrated payload, with its name.
    pub fn payloads(&self) -> &[(&'a str, &'a [u8])] {
        &self.payloads
    }
}
