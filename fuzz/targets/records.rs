// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Fuzz tests for the decoders of data read back from flash: storage records
//! and processing reports.

#![no_main]

use libfuzzer_sys::fuzz_target;

use suit_core::processor::Report;
use suit_core::storage::record::Record;

fuzz_target!(|data: &[u8]| {
    let _ = Record::decode(data);

    if let Some(report) = Report::decode(data) {
        assert_eq!(&report.encode()[..], &data[..Report::LEN]);
    }
});
