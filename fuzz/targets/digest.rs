// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Fuzz tests for the digest-verifying sink: whatever is streamed through it,
//! it must agree with a one-shot hash and always return its engine.

#![no_main]

use libfuzzer_sys::fuzz_target;

use suit_core::crypto::hash::Algo;
use suit_core::crypto::hash::EngineExt as _;
use suit_core::crypto::ring;
use suit_core::stream::DigestPool;
use suit_core::stream::Match;
use suit_core::stream::Sink as _;

fuzz_target!(|input: (Algo, Vec<u8>, u8)| {
    let (algo, data, split) = input;

    let mut expected = [0; 64];
    let expected = &mut expected[..algo.bytes()];
    ring::hash::Engine::new()
        .contiguous_hash(algo, &data, expected)
        .unwrap();

    let pool = DigestPool::<_, 1>::new([ring::hash::Engine::new()]);
    let mut sink = pool.get(algo, expected).unwrap();
    let (head, tail) = data.split_at((split as usize).min(data.len()));
    sink.write(head).unwrap();
    sink.write(tail).unwrap();
    assert_eq!(sink.digest_match().unwrap(), Match::Match);
    drop(sink);
    assert_eq!(pool.available(), 1);
});
