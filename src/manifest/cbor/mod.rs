// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! CBOR parsing.
//!
//! This is not a complete CBOR parser, since we do not parse any CBOR not
//! needed for SUIT envelopes. We also reject all CBOR that is not encoded
//! according to S4.2.1 "Core Deterministic Encoding Requirements". Concisely:
//! - No floats, undefined, or indefinite lengths.
//! - All map keys are strings or ints.
//! - All map keys are ordered lexicographically.
//!
//! Tags are accepted and skipped, since SUIT envelopes and COSE structures
//! may be tagged, but the tag never changes how we interpret the content.
//!
//! Currently, this parser rejects 64-bit integers, since there is no reason
//! to encounter them in our regime, and helps cut down on code size.
//!
//! See: https://datatracker.ietf.org/doc/html/rfc8949

use core::cmp::Ord;
use core::cmp::Ordering;
use core::cmp::PartialOrd;
use core::convert::TryFrom;

use arrayvec::ArrayVec;

#[cfg(test)]
#[macro_use]
mod macros;

/// A CBOR parsing error.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The input ended in the middle of an item.
    Truncated,
    /// The input is not well-formed, deterministically encoded CBOR.
    BadEncoding,
    /// The input is well-formed, but an item has the wrong type, or a
    /// required map key is missing.
    UnexpectedType,
    /// An integer is outside the range expected for it.
    OutOfRange,
}

impl From<untrusted::EndOfInput> for Error {
    fn from(_: untrusted::EndOfInput) -> Self {
        Self::Truncated
    }
}

/// The most tags we are willing to skip in front of a single item.
const MAX_TAGS: usize = 4;

/// A CBOR 33-bit integer.
///
/// CBOR integers are a weird sign-and-magnitude thing where they map onto
/// N+1-bit integers.
// When the bool part is `false`, the value is just the `u32` part; when it's
// `true`, the value is `-n-1`, where n is the `u32` part.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Int(bool, u32);

impl Int {
    /// Creates a non-negative `Int`.
    pub const fn from_u32(n: u32) -> Self {
        Int(false, n)
    }

    /// Creates an `Int` from a signed value.
    pub const fn from_i32(n: i32) -> Self {
        if n >= 0 {
            Int(false, n as u32)
        } else {
            Int(true, -(n + 1) as u32)
        }
    }

    /// Returns the value as an `i64`, which can represent every `Int`.
    pub const fn to_i64(self) -> i64 {
        match self {
            Int(false, n) => n as i64,
            Int(true, n) => -(n as i64) - 1,
        }
    }

    /// Returns the value as a `u32`, if it is not negative.
    pub fn to_u32(self) -> Result<u32, Error> {
        match self {
            Int(false, n) => Ok(n),
            _ => Err(Error::OutOfRange),
        }
    }

    /// Returns the value as an `i32`, if it fits.
    pub fn to_i32(self) -> Result<i32, Error> {
        i32::try_from(self.to_i64()).map_err(|_| Error::OutOfRange)
    }
}

impl From<u32> for Int {
    fn from(n: u32) -> Self {
        Int::from_u32(n)
    }
}

impl From<i32> for Int {
    fn from(n: i32) -> Self {
        Int::from_i32(n)
    }
}

/// A scalar value, e.g., once which does not require recursing into the
/// parser.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scalar<'input> {
    /// An integer.
    Int(Int),
    /// A text string.
    Utf8(&'input str),
    /// A byte string.
    Bytes(&'input [u8]),
    /// `false` or `true`.
    Bool(bool),
    /// `null`.
    Null,
}

impl PartialOrd for Scalar<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// NOTE: This needs to be implemented manually, since Rust defines slice
// equality such that "aa" > "z", even though "z" < "aa" in deterministic
// CBOR.
impl Ord for Scalar<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        use Scalar::*;
        match (self, other) {
            (Int(a), Int(b)) => Ord::cmp(a, b),
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,

            (Utf8(a), Utf8(b)) => {
                Ord::cmp(&a.len(), &b.len()).then_with(|| Ord::cmp(a, b))
            }
            (Utf8(_), _) => Ordering::Less,
            (_, Utf8(_)) => Ordering::Greater,

            (Bytes(a), Bytes(b)) => {
                Ord::cmp(&a.len(), &b.len()).then_with(|| Ord::cmp(a, b))
            }
            (Bytes(_), _) => Ordering::Less,
            (_, Bytes(_)) => Ordering::Greater,

            (Bool(a), Bool(b)) => Ord::cmp(a, b),
            (Bool(_), Null) => Ordering::Less,
            (Null, Bool(_)) => Ordering::Greater,
            (Null, Null) => Ordering::Equal,
        }
    }
}

impl From<Int> for Scalar<'_> {
    fn from(i: Int) -> Self {
        Self::Int(i)
    }
}

impl<'i> From<&'i str> for Scalar<'i> {
    fn from(s: &'i str) -> Self {
        Self::Utf8(s)
    }
}

/// A CBOR item, which can be a [`Scalar`], an [`Array`], or a [`Map`].
#[must_use = "parsing will not be driven to completion without consuming \
this value"]
pub enum Item<'input, 'reader> {
    /// A scalar.
    Scalar(Scalar<'input>),
    /// An array, whose elements have not been parsed yet.
    Array(Array<'input, 'reader>),
    /// A map, whose entries have not been parsed yet.
    Map(Map<'input, 'reader>),
}

/// Reads the "argument" of an item, which is at most four following bytes.
/// For determinism, we *require* that the minimal encoding is used.
fn read_argument(
    buf: &mut untrusted::Reader,
    additional: u8,
) -> Result<u32, Error> {
    let arg = match additional {
        b @ 0..=23 => b as u32,

        24 => {
            let n = buf.read_byte()?;
            if n < 24 {
                return Err(Error::BadEncoding);
            }
            n as u32
        }

        25 => {
            let hi = buf.read_byte()?;
            let lo = buf.read_byte()?;
            let n = u16::from_be_bytes([hi, lo]);
            if n <= u8::MAX as u16 {
                return Err(Error::BadEncoding);
            }
            n as u32
        }

        26 => {
            let mut bytes = [0; 4];
            for b in &mut bytes {
                *b = buf.read_byte()?;
            }
            let n = u32::from_be_bytes(bytes);
            if n <= u16::MAX as u32 {
                return Err(Error::BadEncoding);
            }
            n
        }

        // 27 is 64-bit integers, which we don't handle currently;
        // 28-30 are reserved;
        // 31 is indefinite-length encoding, which is banned.
        _ => return Err(Error::BadEncoding),
    };
    Ok(arg)
}

impl<'i, 'r> Item<'i, 'r> {
    /// Parses a single CBOR item.
    pub fn parse(buf: &'r mut untrusted::Reader<'i>) -> Result<Self, Error> {
        let mut tags = 0;
        let (major, argument) = loop {
            let initial = buf.read_byte()?;
            let major = initial >> 5;
            let additional = initial & 0b00011111;

            if major == 7 {
                // Simple values never carry a following argument that we
                // accept, so they are decoded straight from `additional`.
                let scalar = match additional {
                    20 => Scalar::Bool(false),
                    21 => Scalar::Bool(true),
                    22 => Scalar::Null,
                    _ => return Err(Error::BadEncoding),
                };
                return Ok(Item::Scalar(scalar));
            }

            let argument = read_argument(buf, additional)?;
            if major == 6 {
                tags += 1;
                if tags > MAX_TAGS {
                    return Err(Error::BadEncoding);
                }
                continue;
            }
            break (major, argument);
        };

        match major {
            sign @ 0..=1 => {
                Ok(Item::Scalar(Scalar::Int(Int(sign == 1, argument))))
            }
            2 => Ok(Item::Scalar(Scalar::Bytes(
                buf.read_bytes(argument as usize)?.as_slice_less_safe(),
            ))),
            3 => {
                let bytes =
                    buf.read_bytes(argument as usize)?.as_slice_less_safe();
                Ok(Item::Scalar(Scalar::Utf8(
                    core::str::from_utf8(bytes)
                        .map_err(|_| Error::BadEncoding)?,
                )))
            }
            4 => Ok(Item::Array(Array { buf, len: argument })),
            _ => Ok(Item::Map(Map {
                buf,
                len: argument,
                prev_key: None,
                current_key: None,
            })),
        }
    }

    /// Folds this item into an [`Int`].
    pub fn into_int(self) -> Result<Int, Error> {
        match self {
            Item::Scalar(Scalar::Int(i)) => Ok(i),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Folds this item into a non-negative 32-bit integer.
    pub fn into_u32(self) -> Result<u32, Error> {
        self.into_int()?.to_u32()
    }

    /// Folds this item into a boolean.
    pub fn into_bool(self) -> Result<bool, Error> {
        match self {
            Item::Scalar(Scalar::Bool(b)) => Ok(b),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Folds this item into a UTF-8 string.
    pub fn into_utf8(self) -> Result<&'i str, Error> {
        match self {
            Item::Scalar(Scalar::Utf8(b)) => Ok(b),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Folds this item into a byte string.
    pub fn into_bytes(self) -> Result<&'i [u8], Error> {
        match self {
            Item::Scalar(Scalar::Bytes(b)) => Ok(b),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Folds this item into a byte string and recurses into it for reading
    /// more CBOR.
    pub fn read_all<R>(
        self,
        f: impl FnOnce(&mut untrusted::Reader<'i>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        untrusted::Input::from(self.into_bytes()?)
            .read_all(Error::BadEncoding, f)
    }

    /// Folds this item into an [`Array`].
    pub fn into_array(self) -> Result<Array<'i, 'r>, Error> {
        match self {
            Item::Array(a) => Ok(a),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Folds this item into a [`Map`].
    pub fn into_map(self) -> Result<Map<'i, 'r>, Error> {
        match self {
            Item::Map(m) => Ok(m),
            _ => Err(Error::UnexpectedType),
        }
    }

    /// Ignores this element, driving its internal state to completion.
    pub fn ignore(self) -> Result<(), Error> {
        match self {
            Item::Array(a) => a.with(|e| e.ignore()),
            Item::Map(m) => m.walk(|_| Ok(())),
            _ => Ok(()),
        }
    }
}

/// Reads one complete item, returning its encoding.
pub fn read_raw<'i>(buf: &mut untrusted::Reader<'i>) -> Result<&'i [u8], Error> {
    let (raw, ()) = buf.read_partial(|buf| Item::parse(buf)?.ignore())?;
    Ok(raw.as_slice_less_safe())
}

/// Returns the length of the single CBOR item at the start of `bytes`.
///
/// Trailing bytes are allowed and not inspected.
pub fn item_len(bytes: &[u8]) -> Result<usize, Error> {
    let mut reader = untrusted::Reader::new(untrusted::Input::from(bytes));
    Ok(read_raw(&mut reader)?.len())
}

/// Encodes the head of an item of major type `major` whose argument is
/// `arg`, minimally.
///
/// This is mostly useful for recomputing the byte string header around
/// bstr-wrapped content, which the parser strips.
pub fn encode_head(major: u8, arg: u32) -> ArrayVec<u8, 5> {
    let mut head = ArrayVec::new();
    let major = major << 5;
    match arg {
        0..=23 => head.push(major | arg as u8),
        24..=0xff => {
            head.push(major | 24);
            head.push(arg as u8);
        }
        0x100..=0xffff => {
            head.push(major | 25);
            let _ = head.try_extend_from_slice(&(arg as u16).to_be_bytes());
        }
        _ => {
            head.push(major | 26);
            let _ = head.try_extend_from_slice(&arg.to_be_bytes());
        }
    }
    head
}

// NOTE: Array and Map cannot be iterators, because the result value needs to
// capture the &mut self lifetime.

/// A CBOR array.
///
/// The `with()` function should be used to drive parsing forward.
#[must_use = "parsing will not be driven to completion without calling `with()`"]
pub struct Array<'input, 'reader> {
    buf: &'reader mut untrusted::Reader<'input>,
    len: u32,
}

impl<'i, 'r> Array<'i, 'r> {
    /// Returns the number of elements in the array.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Runs `body` on each item in the array until completion or parse failure.
    pub fn with(
        self,
        mut body: impl FnMut(Item<'i, '_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for _ in 0..self.len {
            body(Item::parse(&mut *self.buf)?)?
        }
        Ok(())
    }

    /// Like `with()`, but hands `body` the reader positioned at each element,
    /// so that elements can be read with [`read_raw()`] or several items can
    /// be consumed in one call.
    ///
    /// `body` is called once per *call*, not once per element: it returns
    /// how many elements it consumed, which must be at least one.
    pub fn with_reader(
        self,
        mut body: impl FnMut(&mut untrusted::Reader<'i>) -> Result<u32, Error>,
    ) -> Result<(), Error> {
        let mut left = self.len;
        while left > 0 {
            let n = body(&mut *self.buf)?;
            if n == 0 || n > left {
                return Err(Error::BadEncoding);
            }
            left -= n;
        }
        Ok(())
    }
}

/// A CBOR map.
///
/// Because maps are not random-access, they need to be *walked* using the
/// `walk()` function, which returns a sort of iterator that can be used to
/// retrieve mappings.
///
/// Because CBOR maps' keys are ordered, it is possible to request keys
/// one-by-one in lexicographic order, making parsing much closer to something
/// like DER.
#[must_use = "parsing will not be driven to completion without calling `walk()`"]
pub struct Map<'input, 'reader> {
    buf: &'reader mut untrusted::Reader<'input>,
    len: u32,
    prev_key: Option<Scalar<'input>>,
    current_key: Option<Scalar<'input>>,
}

impl<'i, 'r> Map<'i, 'r> {
    fn peek(&mut self) -> Result<Option<Scalar<'i>>, Error> {
        if let Some(key) = self.current_key {
            return Ok(Some(key));
        }

        if self.len == 0 {
            return Ok(None);
        }
        self.len -= 1;

        let k = match Item::parse(&mut *self.buf) {
            Ok(Item::Scalar(i @ Scalar::Int { .. })) => i,
            Ok(Item::Scalar(s @ Scalar::Utf8(..))) => s,
            Ok(_) => return Err(Error::BadEncoding),
            Err(e) => return Err(e),
        };

        // Map key encodings must be in lexicographic order, and duplicate keys
        // are not permitted.
        if let Some(prev) = self.prev_key {
            if prev >= k {
                return Err(Error::BadEncoding);
            }
        }

        self.current_key = Some(k);
        Ok(Some(k))
    }

    /// Drive forward the parse by peeling off the next pair in the map.
    fn next(&mut self) -> Result<Option<(Scalar<'i>, Item<'i, '_>)>, Error> {
        self.peek()?;
        let k = match self.current_key.take() {
            Some(k) => k,
            None => return Ok(None),
        };

        self.prev_key = Some(k);
        Item::parse(&mut *self.buf).map(move |v| Some((k, v)))
    }

    /// Starts a walk through `self`.
    pub fn walk<R>(
        self,
        mut body: impl FnMut(&mut MapWalker<'i, '_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut walker = MapWalker {
            map: self,
            last_get: None,
        };
        let val = body(&mut walker)?;
        walker.with(|(_, v)| v.ignore())?;
        Ok(val)
    }
}

/// A walker for a [`Map`].
pub struct MapWalker<'input, 'reader> {
    map: Map<'input, 'reader>,
    last_get: Option<Scalar<'input>>,
}

impl<'i, 'r> MapWalker<'i, 'r> {
    /// Steps through the [`Map`] until `key` is reached.
    ///
    /// Keys must be requested in increasing order; requesting a key less than
    /// or equal to the previous one is an encoding error.
    pub fn get(
        &mut self,
        key: impl Into<Scalar<'i>>,
    ) -> Result<Option<Item<'i, '_>>, Error> {
        self.get_inner(key.into())
    }

    fn get_inner(
        &mut self,
        key: Scalar<'i>,
    ) -> Result<Option<Item<'i, '_>>, Error> {
        if let Some(last) = self.last_get {
            if last >= key {
                return Err(Error::BadEncoding);
            }
        }
        self.last_get = Some(key);

        while let Some(next) = self.map.peek()? {
            match Ord::cmp(&next, &key) {
                // We're still in front of `key`, keep searching.
                Ordering::Less => {
                    self.map.next()?.map(|(_, v)| v.ignore()).transpose()?;
                }
                // We found it!
                Ordering::Equal => return Ok(self.map.next()?.map(|(_, v)| v)),
                // We missed it, so we give up.
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Like `get()`, but a missing key is an error.
    pub fn must_get(
        &mut self,
        key: impl Into<Scalar<'i>>,
    ) -> Result<Item<'i, '_>, Error> {
        self.get(key)?.ok_or(Error::UnexpectedType)
    }

    /// Runs `body` on remaining key-value pair in the map until completion or parse
    /// failure.
    pub fn with(
        &mut self,
        mut body: impl FnMut((Scalar<'i>, Item<'i, '_>)) -> Result<(), Error>,
    ) -> Result<(), Error> {
        while let Some(pair) = self.map.next()? {
            body(pair)?
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_with<'i, R>(
        bytes: &'i [u8],
        f: impl FnOnce(Item<'i, '_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        untrusted::Input::from(bytes)
            .read_all(Error::BadEncoding, |buf| f(Item::parse(buf)?))
    }

    // NOTE: the orderings of fields in `Int` and `Scalar` are significant,
    // because they ensure that the generated derive(Ord) implementation is
    // consistent with bytewise lexicographic ordering.
    #[test]
    fn scalar_ordering() {
        let ordering = [
            Scalar::Int(0.into()),
            Scalar::Int(23.into()),
            Scalar::Int(200.into()),
            Scalar::Int(1000.into()),
            Scalar::Int(100_000.into()),
            Scalar::Int((-1).into()),
            Scalar::Int((-23).into()),
            Scalar::Int((-200).into()),
            Scalar::Int((-1000).into()),
            Scalar::Int((-100_000).into()),
            Scalar::Utf8("z"),
            Scalar::Utf8("aa"),
            Scalar::Bytes(b"z"),
            Scalar::Bytes(b"aa"),
        ];
        for w in ordering.windows(2) {
            assert!(w[0] < w[1], "expected {:?} < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn ints() {
        let cases: &[(Vec<u8>, i64)] = &[
            (raw_cbor!(0:0), 0),
            (raw_cbor!(0:24), 24),
            (raw_cbor!(0:256), 256),
            (raw_cbor!(0:65536), 65536),
            (raw_cbor!(1:15), -16),
            (raw_cbor!(1:43), -44),
        ];
        for (bytes, value) in cases {
            let i = parse_with(bytes, |i| i.into_int()).unwrap();
            assert_eq!(i.to_i64(), *value);
        }
        assert_eq!(Int::from_i32(-16).to_i32(), Ok(-16));
        assert_eq!(Int::from_i32(-1).to_u32(), Err(Error::OutOfRange));
    }

    #[test]
    fn non_minimal_encodings() {
        for bytes in [
            raw_cbor!(0@1:23),
            raw_cbor!(0@2:255),
            raw_cbor!(0@4:65535),
            raw_cbor!(0@8:1),
            raw_cbor!(2@2 { "ab" }),
        ] {
            assert_eq!(
                parse_with(&bytes, |i| i.ignore()),
                Err(Error::BadEncoding),
                "{:x?}",
                bytes
            );
        }
        assert!(parse_with(&raw_cbor!(0@2:256), |i| i.ignore()).is_ok());
    }

    #[test]
    fn simple_values_and_tags() {
        assert_eq!(parse_with(&[0xf5], |i| i.into_bool()), Ok(true));
        assert_eq!(parse_with(&[0xf4], |i| i.into_bool()), Ok(false));
        assert!(matches!(
            parse_with(&[0xf6], |i| match i {
                Item::Scalar(s) => Ok(s),
                _ => Err(Error::UnexpectedType),
            }),
            Ok(Scalar::Null)
        ));
        // Floats are not supported.
        assert_eq!(parse_with(&[0xf9, 0, 0], |i| i.ignore()), Err(Error::BadEncoding));

        // Tag 107 around an empty byte string.
        let tagged = raw_cbor!(6:107 2 {});
        assert_eq!(parse_with(&tagged, |i| i.into_bytes()), Ok(&[][..]));

        let too_many = raw_cbor!(6:1 6:1 6:1 6:1 6:1 0:0);
        assert_eq!(parse_with(&too_many, |i| i.ignore()), Err(Error::BadEncoding));
    }

    #[test]
    fn truncation() {
        assert_eq!(parse_with(&[0x19, 0x01], |i| i.ignore()), Err(Error::Truncated));
        assert_eq!(parse_with(&[0x43, 1], |i| i.ignore()), Err(Error::Truncated));
    }

    #[test]
    fn maps_walk_in_order() {
        let map = raw_cbor!(5 [
            0:1 2 { "one" },
            0:3 3 { "three" },
            3 { "name" } 0:7,
        ]);
        let (one, name) = parse_with(&map, |i| {
            i.into_map()?.walk(|m| {
                let one = m.must_get(Int::from_u32(1))?.into_bytes()?;
                assert!(m.get(Int::from_u32(2))?.is_none());
                let name = m.must_get("name")?.into_u32()?;
                Ok((one, name))
            })
        })
        .unwrap();
        assert_eq!(one, b"one");
        assert_eq!(name, 7);

        let unordered = raw_cbor!(5 [0:3 0:0, 0:1 0:0]);
        assert_eq!(
            parse_with(&unordered, |i| i.ignore()),
            Err(Error::BadEncoding)
        );

        let duplicate = raw_cbor!(5 [0:1 0:0, 0:1 0:0]);
        assert_eq!(
            parse_with(&duplicate, |i| i.ignore()),
            Err(Error::BadEncoding)
        );
    }

    #[test]
    fn item_lengths() {
        let mut bytes = raw_cbor!(4 [0:1, 2 { "abc" }, 5 [0:1 0:2]]);
        let len = bytes.len();
        bytes.extend_from_slice(&[0xff; 8]);
        assert_eq!(item_len(&bytes), Ok(len));
        assert_eq!(item_len(&[0xff; 8]), Err(Error::BadEncoding));
        assert_eq!(item_len(&[]), Err(Error::Truncated));
    }

    #[test]
    fn heads() {
        for (major, arg) in [(0, 0), (2, 23), (2, 24), (3, 300), (2, 70_000)] {
            let head = encode_head(major, arg);
            assert_eq!(&head[..], &raw_cbor!(major:(arg as u64))[..]);
        }
    }

    #[test]
    fn array_readers() {
        let bytes = raw_cbor!(4 [0:1, 0:2, 0:3, 0:4]);
        let mut pairs = Vec::new();
        parse_with(&bytes, |i| {
            i.into_array()?.with_reader(|r| {
                let a = Item::parse(r)?.into_u32()?;
                let b = Item::parse(r)?.into_u32()?;
                pairs.push((a, b));
                Ok(2)
            })
        })
        .unwrap();
        assert_eq!(pairs, vec![(1, 2), (3, 4)]);
    }
}
