// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Scratch-memory arenas.
//!
//! Reads out of flash, such as loading a stored envelope, need a buffer whose
//! lifetime outlives the read call but whose size is only known at runtime.
//! An [`Arena`] hands out such buffers without a global allocator.

#![allow(unsafe_code)]

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use core::slice;

use static_assertions::assert_obj_safe;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::LayoutVerified;

use crate::mem::align_to;
use crate::mem::stride_of;

/// An error indicating that an [`Arena`] has run out of allocatable
/// memory or that memory that is more aligned than is supported
/// was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutOfMemory;

/// Represents a re-usable allocation arena.
///
/// The `reset()` method returns the arena to its unallocated state once all
/// allocated buffers have been rendered unreachable.
///
/// # Safety
///
/// `alloc_aligned()` is required to return memory with the requested size
/// and alignment. Unsafe code is permitted to rely on this.
pub unsafe trait Arena {
    /// Allocates `len` bytes of `align`-aligned memory from this arena.
    ///
    /// Returned slices are disjoint until `reset()` is called. Calling
    /// `alloc_aligned(0, 1)` must never fail.
    ///
    /// # Panics
    ///
    /// This function will panic if `align` is not a power of two.
    fn alloc_aligned(
        &self,
        len: usize,
        align: usize,
    ) -> Result<&mut [u8], OutOfMemory>;

    /// Resets this arena, freeing all memory that was given out.
    ///
    /// Taking `self` by unique reference guarantees that no previously
    /// returned slice is still reachable.
    fn reset(&mut self);
}

assert_obj_safe!(Arena);

/// The empty arena: every non-empty allocation fails.
///
/// This is useful for calling functions that take an arena when the caller
/// knows no allocation will be necessary, such as reading directly out of
/// RAM-backed flash.
unsafe impl Arena for OutOfMemory {
    fn alloc_aligned(
        &self,
        len: usize,
        align: usize,
    ) -> Result<&mut [u8], OutOfMemory> {
        if len == 0 {
            return Ok(empty_aligned(align));
        }
        Err(OutOfMemory)
    }

    fn reset(&mut self) {}
}

/// Returns an empty slice whose address satisfies `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
fn empty_aligned<'a>(align: usize) -> &'a mut [u8] {
    assert!(align.is_power_of_two());
    // SAFE: zero-length slices only need a non-null, aligned pointer, and
    // `align` is non-zero.
    unsafe { slice::from_raw_parts_mut(align as *mut u8, 0) }
}

/// Convenience functions for arenas, exposed as a trait.
///
/// Note that this trait is implemented for `&impl Arena`, which is the reason
/// for the slightly odd signature.
pub trait ArenaExt<'arena> {
    /// Allocates a slice with `n` elements of `T`.
    ///
    /// Because of the `reset()` function, it needs to be safe to transmute
    /// `T` back into bytes, hence the `AsBytes` bound.
    fn alloc_slice<T>(self, n: usize) -> Result<&'arena mut [T], OutOfMemory>
    where
        T: AsBytes + FromBytes + Copy;
}

impl<'arena, A: Arena + ?Sized> ArenaExt<'arena> for &'arena A {
    fn alloc_slice<T: AsBytes + FromBytes + Copy>(
        self,
        n: usize,
    ) -> Result<&'arena mut [T], OutOfMemory> {
        let bytes_requested =
            stride_of::<T>().checked_mul(n).ok_or(OutOfMemory)?;
        let bytes =
            self.alloc_aligned(bytes_requested, mem::align_of::<T>())?;

        // `alloc_aligned()` guarantees size and alignment, so this cannot fail.
        LayoutVerified::new_slice(bytes)
            .map(LayoutVerified::into_mut_slice)
            .ok_or(OutOfMemory)
    }
}

/// A bump-allocating [`Arena`] that is backed by a byte slice.
///
/// # Examples
/// ```
/// # use suit_core::mem::*;
/// let mut data = [0; 128];
/// let mut arena = BumpArena::new(&mut data);
///
/// let buf = arena.alloc_slice::<u8>(100)?;
/// assert_eq!(buf.len(), 100);
/// assert!(arena.alloc_slice::<u8>(64).is_err());
///
/// arena.reset();
/// let buf = arena.alloc_slice::<u32>(16)?;
/// assert_eq!(buf.len(), 16);
/// # Ok::<(), OutOfMemory>(())
/// ```
///
/// Resetting the arena while a buffer is still alive does not compile:
/// ```compile_fail
/// # use suit_core::mem::*;
/// let mut data = [0; 128];
/// let mut arena = BumpArena::new(&mut data);
///
/// let buf = arena.alloc_slice::<u8>(64)?;
/// arena.reset();
/// buf[0] = 42;
/// # Ok::<(), OutOfMemory>(())
/// ```
pub struct BumpArena<'arena> {
    lifetime_phantom: PhantomData<&'arena mut ()>,
    // Invariant: points to the first byte of a `buf_len`-byte allocation
    // that lives for 'arena.
    buf_ptr: NonNull<u8>,
    buf_len: usize,
    // Invariant: cursor <= buf_len.
    cursor: Cell<usize>,
}

impl<'arena> BumpArena<'arena> {
    /// Create a new `BumpArena` by taking ownership of `slice`.
    pub fn new(slice: &'arena mut [u8]) -> Self {
        let buf_len = slice.len();
        Self {
            lifetime_phantom: PhantomData,
            buf_ptr: NonNull::from(slice).cast::<u8>(),
            buf_len,
            cursor: Cell::new(0),
        }
    }

    /// Allocates unaligned memory of the given length, moving the cursor
    /// forward as necessary.
    fn alloc_raw(&self, len: usize) -> Result<&mut [u8], OutOfMemory> {
        if len == 0 {
            return Ok(&mut []);
        }
        let cursor = self.cursor.get();
        let proposed_cursor = len.checked_add(cursor).ok_or(OutOfMemory)?;
        if proposed_cursor > self.buf_len {
            return Err(OutOfMemory);
        }
        self.cursor.set(proposed_cursor);

        // SAFE: buf_ptr[cursor..proposed_cursor] is in-bounds and was not
        // handed out before, since the cursor only moves forward until reset.
        let slice = unsafe {
            let offset_ptr = self.buf_ptr.as_ptr().add(cursor);
            slice::from_raw_parts_mut(offset_ptr, len)
        };
        Ok(slice)
    }
}

unsafe impl<'arena> Arena for BumpArena<'arena> {
    fn alloc_aligned(
        &self,
        len: usize,
        align: usize,
    ) -> Result<&mut [u8], OutOfMemory> {
        assert!(align.is_power_of_two());

        // SAFE: cursor <= buf_len, so this stays within (or one past) the
        // allocation.
        let current_addr =
            unsafe { self.buf_ptr.as_ptr().add(self.cursor.get()) as usize };
        let misalignment = align_to(current_addr, align) - current_addr;
        if len == 0 {
            return Ok(empty_aligned(align));
        }

        self.alloc_raw(misalignment)?;
        self.alloc_raw(len)
    }

    fn reset(&mut self) {
        self.cursor.set(0)
    }
}
