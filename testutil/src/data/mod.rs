// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Test data: known-answer digests and deterministic payloads.

pub mod misc_crypto;
pub mod payload;
