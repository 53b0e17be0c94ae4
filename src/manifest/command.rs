// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! SUIT command sequences.
//!
//! A command sequence is a flat CBOR array of alternating command ids and
//! arguments, wrapped in a byte string. [`Sequence`] walks one, decoding each
//! pair into a [`Command`].

use arrayvec::ArrayVec;

use crate::manifest::cbor;
use crate::manifest::cbor::Item;
use crate::manifest::cbor::Scalar;
use crate::manifest::Digest;
use crate::manifest::Error;
use crate::manifest::Uuid;
use crate::manifest::MAX_COMPONENTS;
use crate::manifest::WRONG_SHAPE;
use crate::wire::WireEnum as _;

/// How deeply sequences may nest through `try-each` and `run-sequence`.
pub const MAX_NESTING: usize = 4;

/// The largest number of alternatives in a `try-each`.
pub const MAX_TRY_EACH: usize = 8;

wire_enum! {
    /// A condition: a check that either passes or fails the sequence.
    pub enum Condition: u32 {
        /// The component's vendor id matches the `vendor-id` parameter.
        VendorIdentifier = 1,
        /// The component's class id matches the `class-id` parameter.
        ClassIdentifier = 2,
        /// The component's contents match the `image-digest` parameter.
        ImageMatch = 3,
        /// The component's active slot matches the `component-slot`
        /// parameter.
        ComponentSlot = 5,
        /// The component's contents equal the `content` parameter.
        CheckContent = 6,
        /// Always fails.
        Abort = 14,
        /// The device id matches the `device-id` parameter.
        DeviceIdentifier = 24,
    }
}

wire_enum! {
    /// A directive: an action with side effects.
    enum Directive: u32 {
        SetComponentIndex = 12,
        TryEach = 15,
        Write = 18,
        OverrideParameters = 20,
        Fetch = 21,
        Copy = 22,
        Invoke = 23,
        Swap = 31,
        RunSequence = 32,
    }
}

// Parameter keys.
mod param {
    use crate::manifest::cbor::Int;

    pub const VENDOR_ID: Int = Int::from_u32(1);
    pub const CLASS_ID: Int = Int::from_u32(2);
    pub const IMAGE_DIGEST: Int = Int::from_u32(3);
    pub const COMPONENT_SLOT: Int = Int::from_u32(5);
    pub const IMAGE_SIZE: Int = Int::from_u32(14);
    pub const CONTENT: Int = Int::from_u32(18);
    pub const URI: Int = Int::from_u32(21);
    pub const SOURCE_COMPONENT: Int = Int::from_u32(22);
    pub const DEVICE_ID: Int = Int::from_u32(24);
}

/// The components a `set-component-index` selects.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Index {
    /// Every component in the manifest.
    All,
    /// The listed components.
    List(ArrayVec<u32, MAX_COMPONENTS>),
}

impl Index {
    fn parse(item: Item) -> Result<Self, Error> {
        let mut list = ArrayVec::new();
        match item {
            Item::Scalar(Scalar::Bool(true)) => return Ok(Self::All),
            Item::Scalar(Scalar::Int(i)) => list.push(i.to_u32()?),
            Item::Array(a) => {
                let mut full = false;
                a.with(|i| {
                    let i = i.into_u32()?;
                    full |= list.try_push(i).is_err();
                    Ok(())
                })?;
                if full {
                    return Err(Error::CapacityExceeded);
                }
            }
            other => {
                other.ignore()?;
                return Err(WRONG_SHAPE);
            }
        }
        Ok(Self::List(list))
    }
}

/// Component parameters, as set by `override-parameters`.
///
/// Each field is `None` until some sequence sets it.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Parameters<'a> {
    /// The expected vendor id.
    pub vendor_id: Option<Uuid>,
    /// The expected class id.
    pub class_id: Option<Uuid>,
    /// The expected digest of the component's contents.
    pub image_digest: Option<Digest<'a>>,
    /// The expected active slot.
    pub component_slot: Option<u32>,
    /// The size of the component's contents.
    pub image_size: Option<u32>,
    /// Literal contents, for `write` and `check-content`.
    pub content: Option<&'a [u8]>,
    /// Where `fetch` gets the payload from.
    pub uri: Option<&'a str>,
    /// Index of the component `copy` and `swap` read from.
    pub source_component: Option<u32>,
    /// The expected device id.
    pub device_id: Option<Uuid>,
}

impl<'a> Parameters<'a> {
    fn parse(item: Item<'a, '_>) -> Result<Self, Error> {
        let mut vendor_id = None;
        let mut class_id = None;
        let mut image_digest = None;
        let mut device_id = None;
        let mut params = Self::default();
        item.into_map()?.walk(|m| {
            vendor_id = m.get(param::VENDOR_ID)?.map(Item::into_bytes).transpose()?;
            class_id = m.get(param::CLASS_ID)?.map(Item::into_bytes).transpose()?;
            image_digest = m
                .get(param::IMAGE_DIGEST)?
                .map(Item::into_bytes)
                .transpose()?;
            params.component_slot = m
                .get(param::COMPONENT_SLOT)?
                .map(Item::into_u32)
                .transpose()?;
            params.image_size =
                m.get(param::IMAGE_SIZE)?.map(Item::into_u32).transpose()?;
            params.content =
                m.get(param::CONTENT)?.map(Item::into_bytes).transpose()?;
            params.uri = m.get(param::URI)?.map(Item::into_utf8).transpose()?;
            params.source_component = m
                .get(param::SOURCE_COMPONENT)?
                .map(Item::into_u32)
                .transpose()?;
            device_id = m.get(param::DEVICE_ID)?.map(Item::into_bytes).transpose()?;
            Ok(())
        })?;

        let uuid = |b: &[u8]| Uuid::from_bytes(b).ok_or(WRONG_SHAPE);
        params.vendor_id = vendor_id.map(uuid).transpose()?;
        params.class_id = class_id.map(uuid).transpose()?;
        params.device_id = device_id.map(uuid).transpose()?;
        params.image_digest = image_digest
            .map(|b| {
                untrusted::Input::from(b)
                    .read_all(Error::Malformed(cbor::Error::BadEncoding), |r| {
                        Digest::parse(Item::parse(r)?)
                    })
            })
            .transpose()?;
        Ok(params)
    }

    /// Overwrites every parameter that `other` sets.
    pub fn apply(&mut self, other: &Self) {
        fn set<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                *dst = src.clone();
            }
        }
        set(&mut self.vendor_id, &other.vendor_id);
        set(&mut self.class_id, &other.class_id);
        set(&mut self.image_digest, &other.image_digest);
        set(&mut self.component_slot, &other.component_slot);
        set(&mut self.image_size, &other.image_size);
        set(&mut self.content, &other.content);
        set(&mut self.uri, &other.uri);
        set(&mut self.source_component, &other.source_component);
        set(&mut self.device_id, &other.device_id);
    }
}

/// A decoded command.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command<'a> {
    /// Checks a condition against the selected components.
    Condition(Condition),
    /// Selects the components that following commands apply to.
    SetComponentIndex(Index),
    /// Runs each alternative until one succeeds. A `None` alternative
    /// succeeds without doing anything.
    TryEach(ArrayVec<Option<&'a [u8]>, MAX_TRY_EACH>),
    /// Sets parameters on the selected components.
    OverrideParameters(Parameters<'a>),
    /// Writes the `content` parameter into the selected components.
    Write,
    /// Streams the payload named by `uri` into the selected components.
    Fetch,
    /// Copies the `source-component` into the selected components.
    Copy,
    /// Starts the selected components.
    Invoke,
    /// Exchanges the contents of the selected components with the
    /// `source-component`.
    Swap,
    /// Runs a nested sequence against the selected components.
    RunSequence(&'a [u8]),
}

impl<'a> Command<'a> {
    fn parse(r: &mut untrusted::Reader<'a>) -> Result<Self, Error> {
        let id = Item::parse(r)?.into_int()?.to_u32().ok();
        let arg = Item::parse(r)?;

        if let Some(cond) = id.and_then(Condition::from_wire_value) {
            // The argument is a reporting policy, which is not used.
            arg.into_u32()?;
            return Ok(Self::Condition(cond));
        }

        let directive = match id.and_then(Directive::from_wire_value) {
            Some(d) => d,
            None => {
                arg.ignore()?;
                return Err(Error::UnknownCommand);
            }
        };
        let cmd = match directive {
            Directive::SetComponentIndex => {
                Self::SetComponentIndex(Index::parse(arg)?)
            }
            Directive::TryEach => {
                let mut options = ArrayVec::new();
                let mut full = false;
                arg.into_array()?.with(|opt| {
                    let opt = match opt {
                        Item::Scalar(Scalar::Null) => None,
                        other => Some(other.into_bytes()?),
                    };
                    full |= options.try_push(opt).is_err();
                    Ok(())
                })?;
                if full {
                    return Err(Error::CapacityExceeded);
                }
                Self::TryEach(options)
            }
            Directive::OverrideParameters => {
                Self::OverrideParameters(Parameters::parse(arg)?)
            }
            Directive::RunSequence => Self::RunSequence(arg.into_bytes()?),
            policy_only => {
                arg.into_u32()?;
                match policy_only {
                    Directive::Write => Self::Write,
                    Directive::Fetch => Self::Fetch,
                    Directive::Copy => Self::Copy,
                    Directive::Invoke => Self::Invoke,
                    _ => Self::Swap,
                }
            }
        };
        Ok(cmd)
    }
}

/// An iterator over the commands of an encoded sequence.
///
/// Decoding stops at the first error, which is yielded once.
pub struct Sequence<'a> {
    reader: untrusted::Reader<'a>,
    left: u32,
    done: bool,
}

impl<'a> Sequence<'a> {
    /// Starts decoding `bytes`, the contents of a sequence byte string.
    pub fn new(bytes: &'a [u8]) -> Result<Self, Error> {
        let mut reader = untrusted::Reader::new(untrusted::Input::from(bytes));
        let len = Item::parse(&mut reader)?.into_array()?.len();
        if len % 2 != 0 {
            return Err(WRONG_SHAPE);
        }
        Ok(Self {
            reader,
            left: len / 2,
            done: false,
        })
    }

    /// Decodes all of `bytes`, including nested sequences.
    pub fn check(bytes: &[u8]) -> Result<(), Error> {
        Self::check_nested(bytes, 0)
    }

    fn check_nested(bytes: &[u8], depth: usize) -> Result<(), Error> {
        if depth >= MAX_NESTING {
            return Err(Error::CapacityExceeded);
        }
        for cmd in Sequence::new(bytes)? {
            match cmd? {
                Command::TryEach(options) => {
                    for seq in options.iter().flatten() {
                        Self::check_nested(seq, depth + 1)?;
                    }
                }
                Command::RunSequence(seq) => Self::check_nested(seq, depth + 1)?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl<'a> Iterator for Sequence<'a> {
    type Item = Result<Command<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.left == 0 {
            self.done = true;
            if !self.reader.at_end() {
                return Some(Err(Error::Malformed(cbor::Error::BadEncoding)));
            }
            return None;
        }

        self.left -= 1;
        let cmd = Command::parse(&mut self.reader);
        if cmd.is_err() {
            self.done = true;
        }
        Some(cmd)
    }
}
