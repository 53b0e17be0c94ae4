// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Flash device abstraction.
//!
//! This module provides the [`Flash`] trait, which represents an *abstract
//! NOR-like flash device*: a byte-addressable region that can be read
//! freely, but that must be erased in blocks before it is programmed in
//! write-alignment-sized units.
//!
//! Adapters are provided for windows onto a device ([`SubFlash`]) and for
//! RAM-backed simulation ([`Ram`], [`RamMut`]).

#![allow(unsafe_code)]

use core::convert::TryFrom;
use core::convert::TryInto;
use core::mem;

use static_assertions::assert_obj_safe;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::LayoutVerified;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mem::is_multiple_of;
use crate::mem::stride_of;
use crate::mem::Arena;
use crate::mem::OutOfMemory;

/// A [`Flash`] error.
///
/// None of these errors are retryable from the point of view of this crate;
/// a [`Flash`] implementation should block until the operation completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested operation was outside of the device's address space.
    OutOfRange,

    /// The device is locked in some manner and cannot be affected by the
    /// operation.
    Locked,

    /// The device has not finished initializing.
    NotReady,

    /// A program or erase operation did not respect the device geometry.
    Misaligned,

    /// An internal invariant was violated, such as running out of memory.
    Internal,

    /// An unspecified error occurred.
    Unspecified,
}

impl From<OutOfMemory> for Error {
    fn from(_: OutOfMemory) -> Error {
        Error::Internal
    }
}

/// Provides access to a flash-like storage device.
///
/// # Safety
///
/// This trait is unsafe due to alignment requirements in `read_direct()`.
pub unsafe trait Flash {
    /// Returns whether the device is ready to service requests.
    fn is_ready(&self) -> bool {
        true
    }

    /// Returns the size, in bytes, of this device.
    fn size(&self) -> Result<u32, Error>;

    /// Returns the program unit of this device, in bytes.
    ///
    /// Every `program()` call must start at a multiple of this value and
    /// have a length that is a multiple of it.
    fn write_alignment(&self) -> u32 {
        1
    }

    /// Returns the erase unit of this device, in bytes.
    fn erase_block_size(&self) -> u32 {
        1
    }

    /// Attempts to read `out.len()` bytes starting at `offset`.
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error>;

    /// Attempts to perform a "direct read" of the given `Region`.
    ///
    /// Implementations that hold their contents in memory may return a
    /// reference into themselves; others allocate out of `arena` and copy.
    /// The returned memory is aligned to `align`.
    ///
    /// # Panics
    ///
    /// This function may panic if `align` is not a power of two.
    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error>;

    /// Attempts to program `buf` starting at `offset`.
    ///
    /// Programming can only clear bits; the target range must have been
    /// erased first for the result to read back as `buf`. The result is not
    /// guaranteed to be visible to `read()` until `flush()` is called.
    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error>;

    /// Erases `region`, setting every byte in it to `0xff`.
    ///
    /// `region` must be aligned to the erase block size.
    fn erase(&mut self, region: Region) -> Result<(), Error>;

    /// Flushes any pending `program()` operations.
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
assert_obj_safe!(Flash);

unsafe impl<F: Flash + ?Sized> Flash for &F {
    #[inline]
    fn is_ready(&self) -> bool {
        F::is_ready(self)
    }

    #[inline]
    fn size(&self) -> Result<u32, Error> {
        F::size(self)
    }

    #[inline]
    fn write_alignment(&self) -> u32 {
        F::write_alignment(self)
    }

    #[inline]
    fn erase_block_size(&self) -> u32 {
        F::erase_block_size(self)
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        F::read(self, offset, out)
    }

    #[inline]
    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error> {
        F::read_direct(self, region, arena, align)
    }

    #[inline]
    fn program(&mut self, _: Ptr, _: &[u8]) -> Result<(), Error> {
        Err(Error::Locked)
    }

    #[inline]
    fn erase(&mut self, _: Region) -> Result<(), Error> {
        Err(Error::Locked)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        Err(Error::Locked)
    }
}

unsafe impl<F: Flash + ?Sized> Flash for &mut F {
    #[inline]
    fn is_ready(&self) -> bool {
        F::is_ready(self)
    }

    #[inline]
    fn size(&self) -> Result<u32, Error> {
        F::size(self)
    }

    #[inline]
    fn write_alignment(&self) -> u32 {
        F::write_alignment(self)
    }

    #[inline]
    fn erase_block_size(&self) -> u32 {
        F::erase_block_size(self)
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        F::read(self, offset, out)
    }

    #[inline]
    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error> {
        F::read_direct(self, region, arena, align)
    }

    #[inline]
    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error> {
        F::program(self, offset, buf)
    }

    #[inline]
    fn erase(&mut self, region: Region) -> Result<(), Error> {
        F::erase(self, region)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        F::flush(self)
    }
}

/// Convenience functions for direct flash reads, exposed as a trait.
///
/// Note that this trait is implemented for `&impl Flash`, which is the reason
/// for the slightly odd signature.
pub trait FlashExt<'flash> {
    /// Reads a slice of `n` values of type `T`, starting at `offset`.
    fn read_slice<'b: 'c, 'c, T>(
        self,
        offset: Ptr,
        n: usize,
        arena: &'b dyn Arena,
    ) -> Result<&'c [T], Error>
    where
        'flash: 'c,
        T: AsBytes + FromBytes + Copy;
}

impl<'flash, F: Flash + ?Sized> FlashExt<'flash> for &'flash F {
    fn read_slice<'b: 'c, 'c, T>(
        self,
        offset: Ptr,
        n: usize,
        arena: &'b dyn Arena,
    ) -> Result<&'c [T], Error>
    where
        'flash: 'c,
        T: AsBytes + FromBytes + Copy,
    {
        let bytes_requested = stride_of::<T>()
            .checked_mul(n)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or(Error::OutOfRange)?;
        let bytes = self.read_direct(
            Region::new(offset.address, bytes_requested),
            arena,
            mem::align_of::<T>(),
        )?;

        LayoutVerified::<_, [T]>::new_slice(bytes)
            .map(LayoutVerified::into_slice)
            .ok_or(Error::Internal)
    }
}

/// Adapter for working with a sub-region of a [`Flash`] type.
///
/// Reads, programs and erases on the device are constrained to a given
/// [`Region`], and addresses are relative to its start.
#[derive(Copy, Clone)]
pub struct SubFlash<F>(pub F, pub Region);

impl<F> SubFlash<F> {
    /// Translates a `len`-byte access at `offset` into the parent device's
    /// address space, checking that it lies inside the window.
    fn translate(&self, offset: u32, len: usize) -> Result<Ptr, Error> {
        let len: u32 = len.try_into().map_err(|_| Error::OutOfRange)?;
        let end = offset.checked_add(len).ok_or(Error::OutOfRange)?;
        if end > self.1.len {
            return Err(Error::OutOfRange);
        }
        let address = offset
            .checked_add(self.1.ptr.address)
            .ok_or(Error::OutOfRange)?;
        Ok(Ptr::new(address))
    }
}

unsafe impl<F: Flash> Flash for SubFlash<F> {
    #[inline]
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    #[inline]
    fn size(&self) -> Result<u32, Error> {
        Ok(self.1.len)
    }

    #[inline]
    fn write_alignment(&self) -> u32 {
        self.0.write_alignment()
    }

    #[inline]
    fn erase_block_size(&self) -> u32 {
        self.0.erase_block_size()
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        let ptr = self.translate(offset.address, out.len())?;
        self.0.read(ptr, out)
    }

    #[inline]
    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error> {
        let ptr = self.translate(region.ptr.address, region.len as usize)?;
        self.0
            .read_direct(Region::new(ptr.address, region.len), arena, align)
    }

    #[inline]
    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error> {
        let ptr = self.translate(offset.address, buf.len())?;
        self.0.program(ptr, buf)
    }

    #[inline]
    fn erase(&mut self, region: Region) -> Result<(), Error> {
        let ptr = self.translate(region.ptr.address, region.len as usize)?;
        self.0.erase(Region::new(ptr.address, region.len))
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        self.0.flush()
    }
}

/// Returns the subslice of `bytes` covered by `region`, or a copy of it
/// aligned to `align` when the slice itself is misaligned.
fn direct_slice<'a: 'c, 'b: 'c, 'c>(
    bytes: &'a [u8],
    region: Region,
    arena: &'b dyn Arena,
    align: usize,
) -> Result<&'c [u8], Error> {
    let start = region.ptr.address as usize;
    let end = start
        .checked_add(region.len as usize)
        .ok_or(Error::OutOfRange)?;
    let slice = bytes.get(start..end).ok_or(Error::OutOfRange)?;

    assert!(align.is_power_of_two());
    if slice.as_ptr() as usize & (align - 1) == 0 {
        return Ok(slice);
    }

    let buf = arena.alloc_aligned(slice.len(), align)?;
    buf.copy_from_slice(slice);
    Ok(buf)
}

/// Adapter for converting read-only, RAM-backed storage into a [`Flash`].
///
/// For the purposes of this type, "RAM-backed" means that `AsRef<[u8]>`
/// is implemented. All mutating operations fail with [`Error::Locked`].
#[derive(Copy, Clone)]
pub struct Ram<Bytes>(pub Bytes);

unsafe impl<Bytes: AsRef<[u8]>> Flash for Ram<Bytes> {
    fn size(&self) -> Result<u32, Error> {
        self.0
            .as_ref()
            .len()
            .try_into()
            .map_err(|_| Error::Unspecified)
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        let len = out.len().try_into().map_err(|_| Error::OutOfRange)?;
        out.copy_from_slice(direct_slice(
            self.0.as_ref(),
            Region::new(offset.address, len),
            &OutOfMemory,
            1,
        )?);
        Ok(())
    }

    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error> {
        direct_slice(self.0.as_ref(), region, arena, align)
    }

    fn program(&mut self, _: Ptr, _: &[u8]) -> Result<(), Error> {
        Err(Error::Locked)
    }

    fn erase(&mut self, _: Region) -> Result<(), Error> {
        Err(Error::Locked)
    }
}

/// A RAM-backed simulation of a NOR flash device.
///
/// Erasing sets bytes to `0xff` and must cover whole erase blocks;
/// programming can only clear bits and must respect the write alignment,
/// exactly like the hardware it stands in for. For exercising failure paths,
/// the device can be marked not-ready, and a fault can be scheduled to fire
/// after a number of successful mutations.
#[derive(Clone)]
pub struct RamMut<Bytes> {
    bytes: Bytes,
    write_alignment: u32,
    erase_block_size: u32,
    ready: bool,
    mutations: usize,
    fault_after: Option<usize>,
}

impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> RamMut<Bytes> {
    /// Creates a new byte-granular `RamMut` over `bytes`.
    ///
    /// The contents of `bytes` are used as-is; call `erase()` or fill it
    /// with `0xff` to start from an erased device.
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            write_alignment: 1,
            erase_block_size: 1,
            ready: true,
            mutations: 0,
            fault_after: None,
        }
    }

    /// Sets the program and erase units of this device.
    pub fn with_geometry(
        mut self,
        write_alignment: u32,
        erase_block_size: u32,
    ) -> Self {
        self.write_alignment = write_alignment;
        self.erase_block_size = erase_block_size;
        self
    }

    /// Sets whether `is_ready()` reports the device as ready.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Makes every program or erase after the next `n` fail with
    /// [`Error::Unspecified`], or clears the fault if `n` is `None`.
    pub fn set_fault_after(&mut self, n: Option<usize>) {
        self.fault_after = n.map(|n| self.mutations + n);
    }

    /// Returns the number of program and erase operations performed so far.
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Returns the current contents of the device.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Returns the current contents of the device, mutably, bypassing
    /// erase and program rules.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut()
    }

    fn begin_mutation(&mut self) -> Result<(), Error> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        if matches!(self.fault_after, Some(n) if self.mutations >= n) {
            return Err(Error::Unspecified);
        }
        self.mutations += 1;
        Ok(())
    }

    fn range(&self, start: u32, len: usize) -> Result<(usize, usize), Error> {
        let start = start as usize;
        let end = start.checked_add(len).ok_or(Error::OutOfRange)?;
        if end > self.bytes.as_ref().len() {
            return Err(Error::OutOfRange);
        }
        Ok((start, end))
    }
}

unsafe impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> Flash for RamMut<Bytes> {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn size(&self) -> Result<u32, Error> {
        self.bytes
            .as_ref()
            .len()
            .try_into()
            .map_err(|_| Error::Unspecified)
    }

    fn write_alignment(&self) -> u32 {
        self.write_alignment
    }

    fn erase_block_size(&self) -> u32 {
        self.erase_block_size
    }

    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        let (start, end) = self.range(offset.address, out.len())?;
        out.copy_from_slice(&self.bytes.as_ref()[start..end]);
        Ok(())
    }

    fn read_direct<'a: 'c, 'b: 'c, 'c>(
        &'a self,
        region: Region,
        arena: &'b dyn Arena,
        align: usize,
    ) -> Result<&'c [u8], Error> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        direct_slice(self.bytes.as_ref(), region, arena, align)
    }

    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error> {
        let (start, end) = self.range(offset.address, buf.len())?;
        if !is_multiple_of(offset.address, self.write_alignment)
            || buf.len() % self.write_alignment as usize != 0
        {
            return Err(Error::Misaligned);
        }
        self.begin_mutation()?;

        for (dst, src) in self.bytes.as_mut()[start..end].iter_mut().zip(buf) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase(&mut self, region: Region) -> Result<(), Error> {
        let (start, end) = self.range(region.ptr.address, region.len as usize)?;
        if !is_multiple_of(region.ptr.address, self.erase_block_size)
            || !is_multiple_of(region.len, self.erase_block_size)
        {
            return Err(Error::Misaligned);
        }
        self.begin_mutation()?;

        for byte in &mut self.bytes.as_mut()[start..end] {
            *byte = 0xff;
        }
        Ok(())
    }
}

/// An abstract pointer into a [`Flash`] type.
///
/// A `Ptr` needs to be used in conjunction with a [`Flash`]
/// implementation to be read from or written to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, AsBytes, FromBytes)]
#[repr(transparent)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ptr {
    /// The abstract address of this pointer.
    pub address: u32,
}

impl Ptr {
    /// Convenience method for creating a `Ptr` without having to use
    /// a struct literal.
    pub const fn new(address: u32) -> Self {
        Self { address }
    }
}

/// A region within a [`Flash`] type.
///
/// Much like a [`Ptr`], a `Region` needs to be interpreted with
/// respect to a [`Flash`] implementation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, AsBytes, FromBytes)]
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    /// The base pointer for this slice.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub ptr: Ptr,
    /// The length of the slice, in bytes.
    pub len: u32,
}

impl Region {
    /// Convenience method for creating a `Region` without having to use
    /// a struct literal.
    pub const fn new(ptr: u32, len: u32) -> Self {
        Self {
            ptr: Ptr::new(ptr),
            len,
        }
    }

    /// Returns the first address past the end of this region, or `None` if
    /// that overflows.
    pub fn end(self) -> Option<u32> {
        self.ptr.address.checked_add(self.len)
    }

    /// Returns whether `self` and `other` share at least one byte.
    pub fn overlaps(self, other: Region) -> bool {
        let (a_end, b_end) = match (self.end(), other.end()) {
            (Some(a), Some(b)) => (a, b),
            _ => return true,
        };
        self.len != 0
            && other.len != 0
            && self.ptr.address < b_end
            && other.ptr.address < a_end
    }

    /// Returns the sub-region of `len` bytes at `offset` into `self`, if it
    /// fits.
    pub fn subregion(self, offset: u32, len: u32) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Region::new(self.ptr.address.checked_add(offset)?, len))
    }
}
