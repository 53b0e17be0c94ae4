// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic, non-repeating firmware-like payloads.
//!
//! Streaming tests need images whose contents catch reordered, duplicated or
//! dropped chunks, which an all-zero or periodic buffer would not.

/// The image size used by the streaming tests: deliberately not a multiple
/// of any write unit or chunk size.
pub const IMAGE_LEN: usize = 32 * 1024 - 3;

/// Generates `len` bytes of pseudorandom data from `seed`.
///
/// The same `(seed, len)` pair always produces the same bytes.
pub fn image(seed: u32, len: usize) -> Vec<u8> {
    // xorshift32; any seed other than zero has a full period.
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(image(7, 64), image(7, 64));
        assert_ne!(image(7, 64), image(8, 64));
        assert_eq!(image(1, IMAGE_LEN).len(), IMAGE_LEN);
    }
}
