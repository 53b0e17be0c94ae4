// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! SUIT manifest decoding.
//!
//! This module decodes just enough of the SUIT envelope format for the
//! [`processor`](crate::processor) to run: the authentication wrapper, the
//! manifest's common block and command sequences, and integrated payloads.
//! Everything is parsed in place; decoded structures borrow from the
//! envelope buffer.
//!
//! Command sequences are checked for well-formedness when the manifest is
//! parsed, but are only decoded into [`command::Command`]s as they are
//! executed.

use core::fmt;

use arrayvec::ArrayVec;

use crate::crypto::hash;
use crate::manifest::cbor::Int;
use crate::manifest::cbor::Item;
use crate::wire::WireEnum as _;

#[macro_use]
pub mod cbor;

pub mod command;
mod envelope;

pub use envelope::Envelope;
pub use envelope::Sign1;

#[cfg(test)]
pub(crate) mod testdata;

/// The largest number of components a manifest may declare.
pub const MAX_COMPONENTS: usize = 8;

/// The largest number of parts in a component id, besides its type.
pub const MAX_COMPONENT_ID_PARTS: usize = 4;

/// The only manifest format version this crate understands.
pub const SUPPORTED_VERSION: u32 = 1;

// Map keys.
pub(crate) mod label {
    use crate::manifest::cbor::Int;

    pub const AUTHENTICATION_WRAPPER: Int = Int::from_u32(2);
    pub const MANIFEST: Int = Int::from_u32(3);

    pub const MANIFEST_VERSION: Int = Int::from_u32(1);
    pub const MANIFEST_SEQUENCE_NUMBER: Int = Int::from_u32(2);
    pub const COMMON: Int = Int::from_u32(3);
    pub const MANIFEST_COMPONENT_ID: Int = Int::from_u32(5);

    pub const COMPONENTS: Int = Int::from_u32(2);
    pub const SHARED_SEQUENCE: Int = Int::from_u32(4);

    pub const COSE_ALG: Int = Int::from_i32(1);
    pub const COSE_KID: Int = Int::from_i32(4);
}

/// An error returned while decoding a manifest.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The CBOR structure is malformed or of the wrong shape.
    Malformed(cbor::Error),
    /// The manifest declares a version other than [`SUPPORTED_VERSION`].
    UnsupportedVersion,
    /// More items than there is room for, e.g. more than [`MAX_COMPONENTS`]
    /// components.
    CapacityExceeded,
    /// A digest uses an unsupported algorithm.
    UnknownAlgorithm,
    /// A component id names an unknown component type.
    UnknownComponentType,
    /// A command sequence contains an unknown command.
    UnknownCommand,
}

impl From<cbor::Error> for Error {
    fn from(e: cbor::Error) -> Self {
        Self::Malformed(e)
    }
}

pub(crate) const WRONG_SHAPE: Error = Error::Malformed(cbor::Error::UnexpectedType);

/// An RFC 4122 UUID, used for vendor, class and device identifiers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    /// Parses a UUID from a byte string, which must be exactly 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut uuid = [0; 16];
        if bytes.len() != uuid.len() {
            return None;
        }
        uuid.copy_from_slice(bytes);
        Some(Self(uuid))
    }

    pub(crate) fn parse(item: Item) -> Result<Self, Error> {
        Self::from_bytes(item.into_bytes()?).ok_or(WRONG_SHAPE)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if let 4 | 6 | 8 | 10 = i {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

/// A digest carried in a manifest.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Digest<'a> {
    /// The hash function.
    pub algo: hash::Algo,
    /// The expected digest value.
    pub bytes: &'a [u8],
}

impl<'a> Digest<'a> {
    /// Parses a `SUIT_Digest`: an array of algorithm id and value.
    pub(crate) fn parse(item: Item<'a, '_>) -> Result<Self, Error> {
        let mut algo = None;
        let mut bytes = None;
        let mut index = 0;
        item.into_array()?.with(|item| {
            match index {
                0 => algo = Some(item.into_int()?),
                1 => bytes = Some(item.into_bytes()?),
                _ => return Err(cbor::Error::UnexpectedType),
            }
            index += 1;
            Ok(())
        })?;

        let (algo, bytes) = algo.zip(bytes).ok_or(WRONG_SHAPE)?;
        let algo = algo
            .to_i32()
            .ok()
            .and_then(hash::Algo::from_cose_id)
            .ok_or(Error::UnknownAlgorithm)?;
        if bytes.len() != algo.bytes() {
            return Err(WRONG_SHAPE);
        }
        Ok(Self { algo, bytes })
    }

    /// Parses a `SUIT_Digest` wrapped in a byte string.
    pub(crate) fn parse_wrapped(item: Item<'a, '_>) -> Result<Self, Error> {
        item.read_all(|r| Ok(Self::parse(Item::parse(r)?)))?
    }
}

/// The kind of component a component id names.
///
/// The first part of every component id is a byte string wrapping one of
/// these names as a CBOR text string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ComponentType {
    /// A range of directly addressable memory.
    Mem,
    /// A staging area for a candidate image.
    CandImg,
    /// A staging area for a candidate manifest.
    CandMfst,
    /// The installed envelope of a manifest class.
    InstldMfst,
    /// A SoC-specific resource, interpreted only by the platform.
    SocSpec,
    /// A partition of the DFU cache.
    CachePool,
    /// A manifest variable.
    MfstVar,
}

impl ComponentType {
    /// Returns the name used for this type in component ids.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mem => "MEM",
            Self::CandImg => "CAND_IMG",
            Self::CandMfst => "CAND_MFST",
            Self::InstldMfst => "INSTLD_MFST",
            Self::SocSpec => "SOC_SPEC",
            Self::CachePool => "CACHE_POOL",
            Self::MfstVar => "MFST_VAR",
        }
    }

    /// Looks up a type by its name in component ids.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "MEM" => Self::Mem,
            "CAND_IMG" => Self::CandImg,
            "CAND_MFST" => Self::CandMfst,
            "INSTLD_MFST" => Self::InstldMfst,
            "SOC_SPEC" => Self::SocSpec,
            "CACHE_POOL" => Self::CachePool,
            "MFST_VAR" => Self::MfstVar,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A component id: a component type followed by type-specific parts.
///
/// Beyond the type, the meaning of each part is up to the
/// [`Platform`](crate::processor::Platform); the accessors here only help
/// with the common encodings.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ComponentId<'a> {
    /// The component type.
    pub ty: ComponentType,
    /// The remaining parts of the id, each a byte string.
    pub parts: ArrayVec<&'a [u8], MAX_COMPONENT_ID_PARTS>,
}

impl<'a> ComponentId<'a> {
    /// Parses a component id, an array of byte strings.
    pub(crate) fn parse(item: Item<'a, '_>) -> Result<Self, Error> {
        let mut ty = None;
        let mut parts = ArrayVec::new();
        let mut err = None;
        item.into_array()?
            .with(|item| {
                let bytes = item.into_bytes()?;
                if ty.is_none() {
                    let name = untrusted::Input::from(bytes)
                        .read_all(cbor::Error::BadEncoding, |r| {
                            Item::parse(r)?.into_utf8()
                        })?;
                    ty = ComponentType::from_name(name);
                    if ty.is_none() {
                        err = Some(Error::UnknownComponentType);
                        return Err(cbor::Error::UnexpectedType);
                    }
                } else if parts.try_push(bytes).is_err() {
                    err = Some(Error::CapacityExceeded);
                    return Err(cbor::Error::UnexpectedType);
                }
                Ok(())
            })
            .map_err(|e| err.unwrap_or(Error::Malformed(e)))?;

        Ok(Self {
            ty: ty.ok_or(WRONG_SHAPE)?,
            parts,
        })
    }

    /// Decodes part `index` as a byte string wrapping a CBOR unsigned
    /// integer, as used for addresses, sizes and indices.
    pub fn part_u32(&self, index: usize) -> Option<u32> {
        let bytes = *self.parts.get(index)?;
        untrusted::Input::from(bytes)
            .read_all(cbor::Error::BadEncoding, |r| Item::parse(r)?.into_u32())
            .ok()
    }

    /// Decodes part `index` as a UUID.
    pub fn part_uuid(&self, index: usize) -> Option<Uuid> {
        Uuid::from_bytes(self.parts.get(index)?)
    }
}

wire_enum! {
    /// A command sequence, identified by its manifest map key.
    pub enum SequenceKind: u32 {
        /// Checks that installed components are the ones the manifest
        /// describes.
        Validate = 7,
        /// Prepares components for invocation.
        Load = 8,
        /// Starts the installed components.
        Invoke = 9,
        /// Resolves dependency manifests.
        DependencyResolution = 15,
        /// Fetches payloads into staging components.
        PayloadFetch = 16,
        /// Installs staged payloads.
        Install = 17,
    }
}

impl SequenceKind {
    /// Every sequence, in manifest key order.
    pub const ALL: [Self; 6] = [
        Self::Validate,
        Self::Load,
        Self::Invoke,
        Self::DependencyResolution,
        Self::PayloadFetch,
        Self::Install,
    ];
}

/// A decoded SUIT manifest.
#[derive(Clone, Debug)]
pub struct Manifest<'a> {
    /// The sequence number, used for rollback protection.
    pub sequence_number: u32,
    /// The components this manifest operates on, indexed by the command
    /// sequences.
    pub components: ArrayVec<ComponentId<'a>, MAX_COMPONENTS>,
    /// The shared sequence, run before every other sequence.
    pub shared: Option<&'a [u8]>,
    /// The id of the manifest itself, naming its class.
    pub component_id: Option<ComponentId<'a>>,
    sequences: [Option<&'a [u8]>; SequenceKind::ALL.len()],
}

impl<'a> Manifest<'a> {
    /// Parses a manifest map, checking that every command sequence is
    /// well-formed.
    pub(crate) fn parse(r: &mut untrusted::Reader<'a>) -> Result<Self, Error> {
        let mut err = None;
        let parsed = Item::parse(r)?.into_map()?.walk(|map| {
            let version = map.must_get(label::MANIFEST_VERSION)?.into_u32()?;
            if version != SUPPORTED_VERSION {
                err = Some(Error::UnsupportedVersion);
                return Err(cbor::Error::UnexpectedType);
            }

            let sequence_number =
                map.must_get(label::MANIFEST_SEQUENCE_NUMBER)?.into_u32()?;

            let mut components = ArrayVec::new();
            let mut shared = None;
            if let Some(common) = map.get(label::COMMON)? {
                common.read_all(|r| {
                    Item::parse(r)?.into_map()?.walk(|common| {
                        if let Some(ids) = common.get(label::COMPONENTS)? {
                            ids.into_array()?.with(|id| {
                                let id = ComponentId::parse(id).map_err(|e| {
                                    err = Some(e);
                                    cbor::Error::UnexpectedType
                                })?;
                                components.try_push(id).map_err(|_| {
                                    err = Some(Error::CapacityExceeded);
                                    cbor::Error::UnexpectedType
                                })
                            })?;
                        }
                        shared = common
                            .get(label::SHARED_SEQUENCE)?
                            .map(Item::into_bytes)
                            .transpose()?;
                        Ok(())
                    })
                })?;
            }

            let component_id = match map.get(label::MANIFEST_COMPONENT_ID)? {
                Some(id) => Some(ComponentId::parse(id).map_err(|e| {
                    err = Some(e);
                    cbor::Error::UnexpectedType
                })?),
                None => None,
            };

            let mut sequences = [None; SequenceKind::ALL.len()];
            for (slot, kind) in sequences.iter_mut().zip(SequenceKind::ALL) {
                *slot = map
                    .get(Int::from_u32(kind.to_wire_value()))?
                    .map(Item::into_bytes)
                    .transpose()?;
            }

            Ok(Manifest {
                sequence_number,
                components,
                shared,
                component_id,
                sequences,
            })
        });
        let manifest = parsed.map_err(|e| err.unwrap_or(Error::Malformed(e)))?;

        let all = manifest
            .shared
            .iter()
            .chain(manifest.sequences.iter().flatten());
        for seq in all {
            command::Sequence::check(seq)?;
        }
        Ok(manifest)
    }

    /// Returns the encoded command sequence `kind`, if the manifest has one.
    pub fn sequence(&self, kind: SequenceKind) -> Option<&'a [u8]> {
        let index = SequenceKind::ALL.iter().position(|k| *k == kind)?;
        self.sequences[index]
    }

    /// Returns the manifest class id, carried by the manifest component id.
    pub fn class_id(&self) -> Option<Uuid> {
        self.component_id.as_ref()?.part_uuid(0)
    }
}
