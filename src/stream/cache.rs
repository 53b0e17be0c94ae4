// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The local DFU cache.
//!
//! A cache partition holds an indefinite-length CBOR map from URIs to
//! payloads. An erased partition is an empty cache; otherwise it begins with
//! the map header, and the first erased byte after the last entry doubles
//! as the map's break marker.
//!
//! Every entry is a text key followed by a byte string whose length is
//! always encoded in four bytes. Entries are appended one [`Slot`] at a
//! time: the length is left erased while the payload streams in, and is
//! programmed when the slot is closed. Each entry is padded to the erase
//! block size with an entry under the empty key, so that an unfinished
//! entry can be dropped by erasing from its start to the end of the
//! partition.

use arrayvec::ArrayVec;
use byteorder::ByteOrder as _;
use byteorder::BE;

use crate::hardware::flash::Flash;
use crate::hardware::flash::Ptr;
use crate::hardware::flash::Region;
use crate::manifest::cbor;
use crate::manifest::cbor::Item;
use crate::mem::Arena;
use crate::mem::OutOfMemory;
use crate::mem::round_up;
use crate::plat;
use crate::storage::record;
use crate::storage::AlignedWriter;
use crate::storage::MAX_WRITE_ALIGNMENT;
use crate::stream::Options;
use crate::stream::Sink;
use crate::stream::Source;

/// The longest URI a cache entry can be stored under.
pub const MAX_URI_LEN: usize = 128;

/// Header of an indefinite-length map.
const MAP_START: u8 = 0xbf;

/// The break marker, which is also the value of erased flash.
const BREAK: u8 = 0xff;

/// Head of a byte string with a four-byte length.
const BSTR_U32: u8 = 0x5a;

/// Length of a byte string head with a four-byte length.
const BSTR_HEAD_LEN: usize = 5;

/// The smallest possible padding entry: an empty key and an empty payload.
const MIN_PADDING: u32 = 1 + BSTR_HEAD_LEN as u32;

/// Where the well-formed entries of a partition end.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Tail {
    /// Everything past this offset is erased.
    Free(u32),
    /// The bytes at this offset are not a well-formed entry.
    Dirty(u32),
}

fn read_entry<'a>(
    r: &mut untrusted::Reader<'a>,
) -> Result<(&'a str, &'a [u8]), cbor::Error> {
    let uri = Item::parse(r)?.into_utf8()?;
    let head = r.read_bytes(BSTR_HEAD_LEN)?.as_slice_less_safe();
    if head[0] != BSTR_U32 {
        return Err(cbor::Error::UnexpectedType);
    }
    let len = BE::read_u32(&head[1..]) as usize;
    let payload = r.read_bytes(len)?.as_slice_less_safe();
    Ok((uri, payload))
}

/// Walks the entries of a partition, calling `visit` on each non-padding
/// entry until it returns `true`.
fn scan<'a>(
    bytes: &'a [u8],
    mut visit: impl FnMut(&'a str, &'a [u8]) -> bool,
) -> Tail {
    match bytes.first() {
        None | Some(&BREAK) => return Tail::Free(0),
        Some(&MAP_START) => {}
        Some(_) => return Tail::Dirty(0),
    }

    let mut r = untrusted::Reader::new(untrusted::Input::from(&bytes[1..]));
    let mut pos = 1;
    loop {
        if r.at_end() || r.peek(BREAK) {
            return Tail::Free(pos as u32);
        }
        match r.read_partial(read_entry) {
            Ok((raw, (uri, payload))) => {
                pos += raw.len();
                if !uri.is_empty() && visit(uri, payload) {
                    return Tail::Free(pos as u32);
                }
            }
            Err(_) => return Tail::Dirty(pos as u32),
        }
    }
}

/// A set of cache partitions on a flash device.
pub struct DfuCache<'p, F> {
    flash: F,
    partitions: &'p [Region],
}

impl<'p, F: Flash> DfuCache<'p, F> {
    /// Creates a cache over `partitions` of `flash`.
    ///
    /// Each partition must be made of whole erase blocks.
    pub fn new(
        flash: F,
        partitions: &'p [Region],
    ) -> crate::Result<Self, plat::Error> {
        for p in partitions {
            record::check_region(&flash, *p)?;
        }
        Ok(Self { flash, partitions })
    }

    /// Returns the underlying flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Tears down the cache, returning the flash device.
    pub fn into_flash(self) -> F {
        self.flash
    }

    fn contents<'s>(
        &'s self,
        partition: Region,
        arena: &'s dyn Arena,
    ) -> crate::Result<&'s [u8], plat::Error> {
        self.flash
            .read_direct(partition, arena, 1)
            .map_err(|e| fail!(plat::Error::from(e)))
    }

    /// Looks up the payload stored under `uri`, in any partition.
    pub fn search<'s>(
        &'s self,
        uri: &str,
        arena: &'s dyn Arena,
    ) -> crate::Result<&'s [u8], plat::Error> {
        for &partition in self.partitions {
            let bytes = self.contents(partition, arena)?;
            let mut found = None;
            scan(bytes, |key, payload| {
                if key == uri {
                    found = Some(payload);
                }
                found.is_some()
            });
            if let Some(payload) = found {
                return Ok(payload);
            }
        }
        Err(fail!(plat::Error::NotFound))
    }

    /// Erases partition `index`, dropping every entry in it.
    pub fn clear(&mut self, index: usize) -> crate::Result<(), plat::Error> {
        let partition = self.partition(index)?;
        self.flash
            .erase(partition)
            .map_err(|e| fail!(plat::Error::from(e)))
    }

    fn partition(&self, index: usize) -> crate::Result<Region, plat::Error> {
        self.partitions
            .get(index)
            .copied()
            .ok_or_else(|| fail!(plat::Error::NotFound))
    }

    /// Opens a new entry for `uri` at the end of partition `index`.
    ///
    /// The payload is written through the returned [`Slot`], which only
    /// becomes visible once [`Slot::close()`] succeeds. A slot that is never
    /// closed is dropped by the next call to this function.
    ///
    /// Fails with [`plat::Error::Inval`] if `uri` is already cached.
    pub fn slot(
        &mut self,
        index: usize,
        uri: &str,
    ) -> crate::Result<Slot<'_, F>, plat::Error> {
        check!(!uri.is_empty(), plat::Error::Inval);
        check!(uri.len() <= MAX_URI_LEN, plat::Error::Size);
        if self.search(uri, &OutOfMemory).is_ok() {
            return Err(fail!(plat::Error::Inval, "{} is already cached", uri));
        }

        let partition = self.partition(index)?;
        let block = self.flash.erase_block_size();
        let tail = scan(self.contents(partition, &OutOfMemory)?, |_, _| false);
        let start = match tail {
            Tail::Free(pos) if pos % block == 0 => pos,
            Tail::Free(pos) | Tail::Dirty(pos) => {
                // Entries end on block boundaries, so this only drops the
                // unfinished entry.
                let start = pos - pos % block;
                warn!("dropping unfinished cache entry at {:#x}", start);
                let stale = Region::new(
                    partition.ptr.address + start,
                    partition.len - start,
                );
                self.flash
                    .erase(stale)
                    .map_err(|e| fail!(plat::Error::from(e)))?;
                start
            }
        };
        check!(start < partition.len, plat::Error::NoResources);

        let mut header = ArrayVec::new();
        if start == 0 {
            header.push(MAP_START);
        }
        let _ = header.try_extend_from_slice(&cbor::encode_head(3, uri.len() as u32));
        let _ = header.try_extend_from_slice(uri.as_bytes());
        let length_at = partition.ptr.address + start + header.len() as u32 + 1;
        let _ = header.try_extend_from_slice(&[BSTR_U32, 0xff, 0xff, 0xff, 0xff]);

        let region =
            Region::new(partition.ptr.address + start, partition.len - start);
        let mut writer = AlignedWriter::new(&mut self.flash, region)?;
        writer.write(&header)?;
        trace!("opened cache slot for {} at {:?}", uri, region.ptr);
        Ok(Slot {
            writer,
            header,
            block,
            length_at,
            written: 0,
        })
    }
}

impl<F: Flash> Source for DfuCache<'_, F> {
    /// Streams a cached payload.
    ///
    /// Cache partitions are read in place, so they must be directly
    /// addressable.
    fn stream(
        &mut self,
        uri: &str,
        sink: &mut dyn Sink,
        _: &Options,
    ) -> Result<(), plat::Error> {
        let payload = self.search(uri, &OutOfMemory).map_err(|e| e.into_inner())?;
        sink.write(payload)
    }
}

/// An open cache entry.
pub struct Slot<'c, F: ?Sized> {
    writer: AlignedWriter<'c, F>,
    header: ArrayVec<u8, { 1 + 5 + MAX_URI_LEN + BSTR_HEAD_LEN }>,
    block: u32,
    length_at: u32,
    written: u32,
}

impl<'c, F: Flash + ?Sized> Slot<'c, F> {
    /// Finishes the entry, making it visible to lookups.
    pub fn close(mut self) -> crate::Result<(), plat::Error> {
        let used = self.header.len() as u32 + self.written;
        let room = self.writer.region().len;
        let mut padding = round_up(used, self.block)
            .ok_or_else(|| fail!(plat::Error::Size))?
            - used;
        if padding != 0 && padding < MIN_PADDING {
            padding += self.block;
        }
        check!(
            used.checked_add(padding).map_or(false, |end| end <= room),
            plat::Error::NoResources
        );

        if padding != 0 {
            let mut head = [0x60, BSTR_U32, 0, 0, 0, 0];
            BE::write_u32(&mut head[2..], padding - MIN_PADDING);
            self.writer.write(&head)?;
            let zeros = [0; 32];
            let mut left = (padding - MIN_PADDING) as usize;
            while left > 0 {
                let n = left.min(zeros.len());
                self.writer.write(&zeros[..n])?;
                left -= n;
            }
        }
        self.writer.flush()?;

        let mut length = [0; 4];
        BE::write_u32(&mut length, self.written);
        program_over(self.writer.into_flash(), self.length_at, &length)
    }

    /// Drops the entry, erasing everything written for it.
    pub fn abandon(mut self) -> crate::Result<(), plat::Error> {
        self.writer.erase()
    }
}

impl<F: Flash + ?Sized> Sink for Slot<'_, F> {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        self.writer.write(data).map_err(|e| e.into_inner())?;
        self.written += data.len() as u32;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), plat::Error> {
        self.writer.erase().map_err(|e| e.into_inner())?;
        self.written = 0;
        let header = self.header.clone();
        self.writer.write(&header).map_err(|e| e.into_inner())
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        Ok(self.written)
    }
}

/// Programs `bytes` at an arbitrary offset that has been left erased inside
/// already-programmed write units.
fn program_over<F: Flash + ?Sized>(
    flash: &mut F,
    at: u32,
    bytes: &[u8],
) -> crate::Result<(), plat::Error> {
    let align = flash.write_alignment();
    let start = at - at % align;
    let end = at
        .checked_add(bytes.len() as u32)
        .and_then(|end| round_up(end, align))
        .ok_or_else(|| fail!(plat::Error::OutOfBounds))?;

    let mut buf = [0xff; 2 * MAX_WRITE_ALIGNMENT];
    let units = buf
        .get_mut(..(end - start) as usize)
        .ok_or_else(|| fail!(plat::Error::Size))?;
    flash
        .read(Ptr::new(start), units)
        .map_err(|e| fail!(plat::Error::from(e)))?;
    let offset = (at - start) as usize;
    units[offset..offset + bytes.len()].copy_from_slice(bytes);
    flash
        .program(Ptr::new(start), units)
        .map_err(|e| fail!(plat::Error::from(e)))
}
