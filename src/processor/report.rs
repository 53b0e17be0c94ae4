// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Processing reports.
//!
//! Every processing run leaves a [`Report`] in a report slot, so that the
//! outcome of an update or boot survives a reset. Reports have a fixed
//! little-endian layout:
//!
//! ```text
//! 0      1      2     3         4        6         8          12        16        32
//! +------+------+-----+---------+--------+---------+----------+---------+---------+
//! | vers | state| mode| (zero)  | outcome| (zero)  | sequence | seq. no.| class id|
//! +------+------+-----+---------+--------+---------+----------+---------+---------+
//! ```
//!
//! `sequence` is zero when the run did not fail inside a command sequence.

use byteorder::ByteOrder as _;
use byteorder::LE;

use crate::manifest::SequenceKind;
use crate::manifest::Uuid;
use crate::processor::Mode;
use crate::processor::State;
use crate::wire::WireEnum as _;

/// The current report layout version.
const VERSION: u8 = 1;

wire_enum! {
    /// The outcome of a processing run.
    pub enum Outcome: u16 {
        /// The run completed.
        Success = 0,
        /// The envelope or manifest could not be decoded.
        Malformed = 1,
        /// A platform or storage operation failed.
        PlatformFailure = 2,
        /// The manifest digest or a signature did not verify.
        Unauthenticated = 3,
        /// A policy check rejected the manifest.
        Denied = 4,
        /// A condition did not hold.
        ConditionFailed = 5,
        /// A component's contents did not match the expected digest.
        DigestMismatch = 6,
        /// A command named a component that does not exist or cannot be
        /// used that way.
        BadComponent = 7,
        /// A command needed a parameter that was never set.
        MissingParameter = 8,
    }
}

/// A record of a processing run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Report {
    /// How the run ended.
    pub outcome: Outcome,
    /// The state the run was in when it ended; [`State::Done`] for
    /// successful runs.
    pub state: State,
    /// The pass the run was in when it ended.
    pub mode: Mode,
    /// The command sequence that failed, if any.
    pub sequence: Option<SequenceKind>,
    /// The class of the manifest, or all zeroes if it was never decoded.
    pub class_id: Uuid,
    /// The sequence number of the manifest, or zero if it was never decoded.
    pub sequence_number: u32,
}

impl Report {
    /// A report for a run that has not gotten anywhere yet.
    pub(crate) fn start() -> Self {
        Self {
            outcome: Outcome::Success,
            state: State::Start,
            mode: Mode::Validate,
            sequence: None,
            class_id: Uuid::default(),
            sequence_number: 0,
        }
    }

    /// The length of an encoded report.
    pub const LEN: usize = 32;

    /// Encodes this report.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0; Self::LEN];
        out[0] = VERSION;
        out[1] = self.state.to_wire_value();
        out[2] = match self.mode {
            Mode::Validate => 0,
            Mode::Execute => 1,
        };
        LE::write_u16(&mut out[4..6], self.outcome.to_wire_value());
        LE::write_u32(
            &mut out[8..12],
            self.sequence.map(|s| s.to_wire_value()).unwrap_or(0),
        );
        LE::write_u32(&mut out[12..16], self.sequence_number);
        out[16..].copy_from_slice(&self.class_id.0);
        out
    }

    /// Decodes a report from the start of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short or does not hold a report in
    /// a known layout.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::LEN)?;
        if bytes[0] != VERSION {
            return None;
        }

        let mode = match bytes[2] {
            0 => Mode::Validate,
            1 => Mode::Execute,
            _ => return None,
        };
        let sequence = match LE::read_u32(&bytes[8..12]) {
            0 => None,
            s => Some(SequenceKind::from_wire_value(s)?),
        };
        Some(Self {
            outcome: Outcome::from_wire_value(LE::read_u16(&bytes[4..6]))?,
            state: State::from_wire_value(bytes[1])?,
            mode,
            sequence,
            class_id: Uuid::from_bytes(&bytes[16..])?,
            sequence_number: LE::read_u32(&bytes[12..16]),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        let report = Report {
            outcome: Outcome::ConditionFailed,
            state: State::Install,
            mode: Mode::Execute,
            sequence: Some(SequenceKind::Install),
            class_id: Uuid([0xc1; 16]),
            sequence_number: 0x0102_0304,
        };
        let bytes = report.encode();
        assert_eq!(
            &bytes[..16],
            &[
                1, 5, 1, 0, //
                5, 0, 0, 0, //
                17, 0, 0, 0, //
                4, 3, 2, 1,
            ]
        );
        assert_eq!(&bytes[16..], &[0xc1; 16]);
        assert_eq!(Report::decode(&bytes), Some(report));
    }

    #[test]
    fn garbage() {
        let mut bytes = Report {
            outcome: Outcome::Success,
            state: State::Done,
            mode: Mode::Execute,
            sequence: None,
            class_id: Uuid::default(),
            sequence_number: 0,
        }
        .encode();
        assert!(Report::decode(&bytes[..31]).is_none());

        // Erased flash.
        assert!(Report::decode(&[0xff; 64]).is_none());

        bytes[8] = 99;
        assert!(Report::decode(&bytes).is_none());
    }
}
