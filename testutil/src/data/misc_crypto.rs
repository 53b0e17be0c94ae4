// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Known-answer vectors for digest engines.

/// A short plaintext.
pub const PLAIN_TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog";

/// The SHA-256 digest of [`PLAIN_TEXT`].
#[rustfmt::skip]
pub const PLAIN_SHA256: &[u8; 32] = &[
    0xd7, 0xa8, 0xfb, 0xb3, 0x07, 0xd7, 0x80, 0x94,
    0x69, 0xca, 0x9a, 0xbc, 0xb0, 0x08, 0x2e, 0x4f,
    0x8d, 0x56, 0x51, 0xe4, 0x6d, 0x3c, 0xdb, 0x76,
    0x2d, 0x02, 0xd0, 0xbf, 0x37, 0xc9, 0xe5, 0x92,
];

/// The SHA-384 digest of [`PLAIN_TEXT`].
#[rustfmt::skip]
pub const PLAIN_SHA384: &[u8; 48] = &[
    0xca, 0x73, 0x7f, 0x10, 0x14, 0xa4, 0x8f, 0x4c,
    0x0b, 0x6d, 0xd4, 0x3c, 0xb1, 0x77, 0xb0, 0xaf,
    0xd9, 0xe5, 0x16, 0x93, 0x67, 0x54, 0x4c, 0x49,
    0x40, 0x11, 0xe3, 0x31, 0x7d, 0xbf, 0x9a, 0x50,
    0x9c, 0xb1, 0xe5, 0xdc, 0x1e, 0x85, 0xa9, 0x41,
    0xbb, 0xee, 0x3d, 0x7f, 0x2a, 0xfb, 0xc9, 0xb1,
];
