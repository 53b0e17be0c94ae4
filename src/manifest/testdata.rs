// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Envelope builders for tests.

use crate::manifest::Uuid;
use crate::manifest::SequenceKind;
use crate::wire::WireEnum as _;

/// The vendor id used by test manifests.
pub const VENDOR_ID: Uuid = Uuid([0x56; 16]);

/// The class id used by test manifests.
pub const CLASS_ID: Uuid = Uuid([0x11; 16]);

/// The COSE ES256 algorithm id.
pub const COSE_ES256: i32 = -7;

/// Wraps `bytes` in a byte string.
pub fn bstr(bytes: &[u8]) -> Vec<u8> {
    raw_cbor!(2 { bytes })
}

/// Encodes an array of already-encoded items.
pub fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = raw_cbor!(4:(items.len() as u64));
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// Encodes the SHA-256 `SUIT_Digest` of the bstr-wrapped `manifest`.
pub fn digest(manifest: &[u8]) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(ring::digest::digest(&ring::digest::SHA256, &bstr(manifest)).as_ref());
    out
}

/// A `MEM` component id.
pub fn mem_component(cpu: u32, address: u32, size: u32) -> Vec<u8> {
    raw_cbor!(4 [
        2 { t"MEM" },
        2 { 0:(cpu as u64) },
        2 { 0:(address as u64) },
        2 { 0:(size as u64) },
    ])
}

/// A component id with the given type name and a single integer part.
pub fn indexed_component(ty: &str, index: u32) -> Vec<u8> {
    raw_cbor!(4 [2 { t(ty) }, 2 { 0:(index as u64) }])
}

/// Builds a manifest.
pub struct ManifestBuilder {
    /// The manifest format version.
    pub version: u32,
    /// The sequence number.
    pub sequence_number: u32,
    /// The class id, placed in the manifest component id.
    pub class_id: Option<Uuid>,
    /// Encoded component ids.
    pub components: Vec<Vec<u8>>,
    /// The shared sequence.
    pub shared: Option<Vec<u8>>,
    /// The command sequences, in any order.
    pub sequences: Vec<(SequenceKind, Vec<u8>)>,
}

impl ManifestBuilder {
    /// A manifest with one `MEM` component and a trivial install sequence.
    pub fn new() -> Self {
        Self {
            version: 1,
            sequence_number: 1,
            class_id: Some(CLASS_ID),
            components: vec![mem_component(0, 0x1000, 0x100)],
            shared: None,
            sequences: vec![(SequenceKind::Install, raw_cbor!(4 [0:12, 0:0]))],
        }
    }

    /// Sets the sequence number.
    pub fn sequence_number(mut self, n: u32) -> Self {
        self.sequence_number = n;
        self
    }

    /// Replaces the component list.
    pub fn components(mut self, components: Vec<Vec<u8>>) -> Self {
        self.components = components;
        self
    }

    /// Sets the shared sequence.
    pub fn shared(mut self, seq: Vec<u8>) -> Self {
        self.shared = Some(seq);
        self
    }

    /// Sets sequence `kind`, replacing any previous one.
    pub fn sequence(mut self, kind: SequenceKind, seq: Vec<u8>) -> Self {
        self.sequences.retain(|(k, _)| *k != kind);
        self.sequences.push((kind, seq));
        self
    }

    /// Encodes the manifest map.
    pub fn build(&self) -> Vec<u8> {
        let mut common = vec![raw_cbor!(0:2), array(&self.components)];
        if let Some(shared) = &self.shared {
            common.push(raw_cbor!(0:4));
            common.push(bstr(shared));
        }
        let mut common_map = raw_cbor!(5:((common.len() / 2) as u64));
        for item in &common {
            common_map.extend_from_slice(item);
        }

        let mut entries = vec![
            (1, raw_cbor!(0:(self.version as u64))),
            (2, raw_cbor!(0:(self.sequence_number as u64))),
            (3, bstr(&common_map)),
        ];
        if let Some(class) = self.class_id {
            let class = class.0;
            entries.push((5, raw_cbor!(4 [2 { t"INSTLD_MFST" }, 2 { class }])));
        }
        for (kind, seq) in &self.sequences {
            entries.push((kind.to_wire_value(), bstr(seq)));
        }
        entries.sort_by_key(|(k, _)| *k);

        let mut out = raw_cbor!(5:(entries.len() as u64));
        for (key, value) in entries {
            out.extend_from_slice(&raw_cbor!(0:(key as u64)));
            out.extend_from_slice(&value);
        }
        out
    }
}

/// Builds an envelope around an encoded manifest.
pub struct EnvelopeBuilder<'a> {
    manifest: &'a [u8],
    digest: [u8; 32],
    signatures: Vec<Vec<u8>>,
    payloads: Vec<(String, Vec<u8>)>,
}

impl<'a> EnvelopeBuilder<'a> {
    /// Starts an unsigned envelope carrying the correct manifest digest.
    pub fn new(manifest: &'a [u8]) -> Self {
        Self {
            manifest,
            digest: digest(manifest),
            signatures: Vec::new(),
            payloads: Vec::new(),
        }
    }

    /// Replaces the manifest digest.
    pub fn digest(mut self, digest: [u8; 32]) -> Self {
        self.digest = digest;
        self
    }

    /// Adds an ES256 `COSE_Sign1` with a detached payload.
    pub fn sign(mut self, kid: &[u8], signature: &[u8]) -> Self {
        self.signatures.push(raw_cbor!(6:18 4 [
            2 { 5 [0:1 1:6] },
            5 [0:4 2 { kid }],
            h"f6",
            2 { signature },
        ]));
        self
    }

    /// Adds an integrated payload.
    pub fn payload(mut self, name: &str, data: &[u8]) -> Self {
        self.payloads.push((name.to_string(), data.to_vec()));
        self
    }

    /// Encodes the tagged envelope.
    pub fn build(&self) -> Vec<u8> {
        let digest = self.digest;
        let mut auth = vec![bstr(&raw_cbor!(4 [1:15, 2 { digest }]))];
        auth.extend(self.signatures.iter().map(|s| bstr(s)));

        let mut payloads = self.payloads.clone();
        payloads.sort_by(|(a, _), (b, _)| {
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        });

        let mut out = raw_cbor!(6:107 5:((2 + payloads.len()) as u64));
        out.extend_from_slice(&raw_cbor!(0:2));
        out.extend_from_slice(&bstr(&array(&auth)));
        out.extend_from_slice(&raw_cbor!(0:3));
        out.extend_from_slice(&bstr(self.manifest));
        for (name, data) in &payloads {
            out.extend_from_slice(&raw_cbor!(t(name.as_str())));
            out.extend_from_slice(&bstr(data));
        }
        out
    }
}
