// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Fuzz tests for the envelope decoder, including every command sequence the
//! manifest carries.

#![no_main]

use libfuzzer_sys::fuzz_target;

use suit_core::manifest::command::Sequence;
use suit_core::manifest::Envelope;
use suit_core::manifest::SequenceKind;

fuzz_target!(|data: &[u8]| {
    let envelope = match Envelope::parse(data) {
        Ok(envelope) => envelope,
        Err(_) => return,
    };

    // Decoding already checked every sequence; walking them again must not
    // turn up anything new.
    let manifest = &envelope.manifest;
    let all = SequenceKind::ALL
        .iter()
        .filter_map(|&kind| manifest.sequence(kind))
        .chain(manifest.shared);
    for seq in all {
        assert!(Sequence::check(seq).is_ok());
    }
});
