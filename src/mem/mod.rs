// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! General memory manipulation utilities, such as arenas.

mod arena;
pub use arena::*;

/// Aligns the given address up to `align`.
///
/// `align` must be a power of two; otherwise, the returned value
/// will be well-defined but unspecified.
///
/// This function will always return a value greater than or equal to `addr`.
/// This invariant is always maintained, even if it would cause an unaligned
/// value to be returned.
#[inline]
pub(crate) fn align_to(addr: usize, align: usize) -> usize {
    let mask = align.wrapping_sub(1);
    let (addr, overflow) = addr.overflowing_add(mask);
    if overflow {
        return usize::MAX;
    }
    addr & !mask
}

/// Returns whether `addr` is a multiple of `align`.
///
/// Unlike [`align_to()`], `align` need not be a power of two: flash write
/// units and erase blocks are usually powers of two, but nothing requires it.
#[inline]
pub(crate) fn is_multiple_of(addr: u32, align: u32) -> bool {
    align != 0 && addr % align == 0
}

/// Rounds `len` up to the next multiple of `align`, returning `None` on
/// overflow.
#[inline]
pub(crate) fn round_up(len: u32, align: u32) -> Option<u32> {
    if align == 0 {
        return None;
    }
    let rem = len % align;
    if rem == 0 {
        Some(len)
    } else {
        len.checked_add(align - rem)
    }
}

/// Returns the distance between consecutive elements of `[T]`.
#[inline]
pub(crate) const fn stride_of<T>() -> usize {
    let size = core::mem::size_of::<T>();
    let align = core::mem::align_of::<T>();
    (size + align - 1) / align * align
}
