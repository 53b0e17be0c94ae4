// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Persistent storage regions.
//!
//! [`Storage`] owns a flash device and a [`Layout`] that carves it into
//! regions with fixed roles:
//! - one slot per manifest class, holding the installed envelope;
//! - a flags array ([`Flag`]) read by the boot flow;
//! - report slots recording the outcome of processing runs;
//! - the non-volatile manifest variable area, protected by a digest and
//!   mirrored into a backup;
//! - the update-candidate list.
//!
//! Mutating operations take `&mut self`, which serializes them; sharing a
//! `Storage` between threads requires wrapping it in a lock.

use core::convert::TryFrom as _;
use core::iter;

use byteorder::ByteOrder as _;
use byteorder::LE;
use zerocopy::AsBytes as _;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::hardware::flash::Flash;
use crate::hardware::flash::FlashExt as _;
use crate::hardware::flash::Ptr;
use crate::hardware::flash::Region;
use crate::manifest::cbor;
use crate::manifest::Uuid;
use crate::mem::Arena;
use crate::plat;
use crate::wire::WireEnum as _;
use crate::Result;

mod flags;
mod nvv;
pub mod record;

pub use flags::Flag;
pub use nvv::Repair;

/// The largest write alignment supported by storage operations.
pub const MAX_WRITE_ALIGNMENT: usize = 16;

/// The largest number of regions an update candidate can list.
pub const MAX_CANDIDATE_REGIONS: usize = 8;

wire_enum! {
    /// The role of a manifest class, which decides where its envelope lives
    /// and which rules apply to it.
    pub enum Role: u8 {
        /// The top-level manifest of the secure domain.
        SecTop = 0x10,
        /// The secure domain firmware.
        SecSdfw = 0x11,
        /// The system controller firmware.
        SecSysctrl = 0x12,
        /// The radio domain recovery manifest.
        RadRecovery = 0x20,
        /// The first radio domain local manifest.
        RadLocal1 = 0x21,
        /// The second radio domain local manifest.
        RadLocal2 = 0x22,
        /// The application root manifest.
        AppRoot = 0x30,
        /// The application recovery manifest.
        AppRecovery = 0x31,
        /// The first application local manifest.
        AppLocal1 = 0x32,
        /// The second application local manifest.
        AppLocal2 = 0x33,
        /// The third application local manifest.
        AppLocal3 = 0x34,
    }
}

/// When a manifest class requires a signature.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SignatureCheck {
    /// Unsigned manifests are always accepted.
    Disabled,
    /// Signatures are required when installing, but not when booting an
    /// already-installed envelope.
    OnUpdate,
    /// Signatures are always required.
    OnUpdateAndBoot,
}

/// The per-class policy provisioned alongside a manifest slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManifestPolicy {
    /// Whether a new envelope must carry a sequence number strictly greater
    /// than the installed one.
    pub downgrade_prevention: bool,
    /// Whether this class may be updated on its own, without its parent.
    pub independent_update: bool,
    /// When signatures are required.
    pub signature_check: SignatureCheck,
}

/// A manifest class and the slot its installed envelope is stored in.
#[derive(Copy, Clone, Debug)]
pub struct ManifestSlot {
    /// The class id carried by envelopes of this class.
    pub class_id: Uuid,
    /// The role of this class.
    pub role: Role,
    /// The region holding the installed envelope.
    pub region: Region,
    /// The rules applying to this class.
    pub policy: ManifestPolicy,
}

/// The division of a flash device into storage regions.
///
/// Every region must be non-empty, made of whole erase blocks, inside the
/// device, and disjoint from every other region; [`Storage::init()`]
/// rejects layouts that are not.
#[derive(Copy, Clone, Debug)]
pub struct Layout<'a> {
    /// Manifest classes and their envelope slots.
    pub manifests: &'a [ManifestSlot],
    /// The flags array.
    pub flags: Region,
    /// Report slots, indexed from zero.
    pub reports: &'a [Region],
    /// The non-volatile variable area.
    pub nvv: Region,
    /// The backup copy of the non-volatile variable area.
    pub nvv_backup: Region,
    /// The number of non-volatile variables.
    pub nvv_count: u32,
    /// The update candidate list.
    pub update_candidate: Region,
}

impl<'a> Layout<'a> {
    /// Returns every region named by this layout.
    pub fn regions(&self) -> impl Iterator<Item = Region> + 'a {
        self.manifests
            .iter()
            .map(|slot| slot.region)
            .chain(self.reports.iter().copied())
            .chain(iter::once(self.flags))
            .chain(iter::once(self.nvv))
            .chain(iter::once(self.nvv_backup))
            .chain(iter::once(self.update_candidate))
    }

    fn validate<F: Flash + ?Sized>(&self, flash: &F) -> Result<(), plat::Error> {
        for (i, region) in self.regions().enumerate() {
            record::check_region(flash, region)?;
            for other in self.regions().skip(i + 1) {
                check!(!region.overlaps(other), plat::Error::Inval);
            }
        }

        for (i, slot) in self.manifests.iter().enumerate() {
            for other in &self.manifests[i + 1..] {
                check!(slot.class_id != other.class_id, plat::Error::Inval);
            }
        }

        check!(
            flags::area_len(flash.write_alignment()) <= self.flags.len,
            plat::Error::Size
        );
        check!(
            self.nvv_count as usize <= nvv::MAX_VARIABLES,
            plat::Error::Inval
        );
        check!(
            nvv::record_len(self.nvv_count) <= self.nvv.len.min(self.nvv_backup.len),
            plat::Error::Size
        );
        Ok(())
    }
}

/// A storage handle.
///
/// Created with [`Storage::init()`], which validates the layout and the
/// device; there is no way to obtain a `Storage` that has not been
/// initialized.
pub struct Storage<'a, F, H> {
    flash: F,
    layout: Layout<'a>,
    hash: H,
}

impl<'a, F: Flash, H: hash::Engine> Storage<'a, F, H> {
    /// Initializes storage over `flash`.
    ///
    /// Fails with [`plat::Error::HwNotReady`] if the device is not ready,
    /// and with an argument error if `layout` does not fit the device. The
    /// non-volatile variable area is checked against its digest and
    /// repaired from its backup if necessary; if neither copy is intact, both
    /// are reinitialized with erased (`0xff`) values.
    pub fn init(flash: F, layout: Layout<'a>, hash: H) -> Result<Self, plat::Error> {
        check!(flash.is_ready(), plat::Error::HwNotReady);
        layout.validate(&flash)?;

        let mut storage = Self {
            flash,
            layout,
            hash,
        };
        let repair = storage.nvv_validate()?;
        info!("storage initialized; nvv: {:?}", repair);
        Ok(storage)
    }

    /// Returns the layout this storage was initialized with.
    pub fn layout(&self) -> &Layout<'a> {
        &self.layout
    }

    /// Returns the underlying flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Returns the underlying flash device, mutably.
    ///
    /// Writes made through this reference bypass every storage invariant.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Tears down this handle, returning the flash device.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Looks up the slot for the manifest class `class_id`.
    pub fn manifest_slot(&self, class_id: &Uuid) -> Result<&ManifestSlot, plat::Error> {
        self.layout
            .manifests
            .iter()
            .find(|slot| slot.class_id == *class_id)
            .ok_or_else(|| fail!(plat::Error::NotFound))
    }

    /// Stores `envelope` as the installed envelope of `class_id`.
    pub fn install_envelope(
        &mut self,
        class_id: &Uuid,
        envelope: &[u8],
    ) -> Result<(), plat::Error> {
        let region = self.manifest_slot(class_id)?.region;
        info!("installing {}-byte envelope for {}", envelope.len(), class_id);
        record::save(&mut self.flash, region, envelope)
    }

    /// Returns the installed envelope of `class_id`.
    ///
    /// The slot's padding is trimmed by decoding exactly one CBOR item.
    pub fn installed_envelope<'s>(
        &'s self,
        class_id: &Uuid,
        arena: &'s dyn Arena,
    ) -> Result<&'s [u8], plat::Error> {
        let region = self.manifest_slot(class_id)?.region;
        match record::read(&self.flash, region, arena)? {
            record::Record::Binary(body) => {
                let len = cbor::item_len(body).map_err(|e| {
                    fail!(plat::Error::NotFound, "stored envelope is not CBOR: {:?}", e)
                })?;
                Ok(&body[..len])
            }
            _ => Err(fail!(plat::Error::NotFound)),
        }
    }

    /// Erases the installed envelope of `class_id`.
    pub fn clear_envelope(&mut self, class_id: &Uuid) -> Result<(), plat::Error> {
        let region = self.manifest_slot(class_id)?.region;
        record::clear(&mut self.flash, region)
    }

    /// Saves `report` into report slot `index`.
    pub fn report_save(&mut self, index: usize, report: &[u8]) -> Result<(), plat::Error> {
        let region = self.report_region(index)?;
        record::save(&mut self.flash, region, report)
    }

    /// Reads the contents of report slot `index`, including trailing padding.
    pub fn report_read<'s>(
        &'s self,
        index: usize,
        arena: &'s dyn Arena,
    ) -> Result<&'s [u8], plat::Error> {
        let region = self.report_region(index)?;
        match record::read(&self.flash, region, arena)? {
            record::Record::Binary(body) => Ok(body),
            _ => Err(fail!(plat::Error::NotFound)),
        }
    }

    /// Erases report slot `index`.
    pub fn report_clear(&mut self, index: usize) -> Result<(), plat::Error> {
        let region = self.report_region(index)?;
        record::clear(&mut self.flash, region)
    }

    fn report_region(&self, index: usize) -> Result<Region, plat::Error> {
        self.layout
            .reports
            .get(index)
            .copied()
            .ok_or_else(|| fail!(plat::Error::OutOfBounds))
    }

    /// Records the list of memory regions making up an update candidate.
    pub fn update_candidate_set(&mut self, regions: &[Region]) -> Result<(), plat::Error> {
        check!(!regions.is_empty(), plat::Error::Inval);
        check!(regions.len() <= MAX_CANDIDATE_REGIONS, plat::Error::Size);

        let mut count = [0; 4];
        LE::write_u32(&mut count, regions.len() as u32);
        record::write_record(
            &mut self.flash,
            self.layout.update_candidate,
            record::Magic::Binary,
            &[&count, regions.as_bytes()],
        )
    }

    /// Reads back the update candidate list.
    pub fn update_candidate_get<'s>(
        &'s self,
        arena: &'s dyn Arena,
    ) -> Result<&'s [Region], plat::Error> {
        let region = self.layout.update_candidate;
        record::check_region(&self.flash, region)?;

        let mut header = [0; 8];
        self.flash
            .read(region.ptr, &mut header)
            .map_err(|e| fail!(plat::Error::from(e)))?;
        check!(
            record::Magic::from_wire_value(LE::read_u32(&header[..4]))
                == Some(record::Magic::Binary),
            plat::Error::NotFound
        );
        let count = LE::read_u32(&header[4..]);
        check!(
            count != 0 && count as usize <= MAX_CANDIDATE_REGIONS,
            plat::Error::NotFound
        );

        let offset = region.ptr.address + record::HEADER_LEN + 4;
        (&self.flash)
            .read_slice::<Region>(Ptr::new(offset), count as usize, arena)
            .map_err(|e| fail!(plat::Error::from(e)))
    }

    /// Erases the update candidate list.
    pub fn update_candidate_clear(&mut self) -> Result<(), plat::Error> {
        record::clear(&mut self.flash, self.layout.update_candidate)
    }

    /// Converts a variable index into a byte offset inside the NVV area.
    fn nvv_index(&self, index: u32) -> Result<usize, plat::Error> {
        check!(index < self.layout.nvv_count, plat::Error::OutOfBounds);
        usize::try_from(index).map_err(|_| fail!(plat::Error::OutOfBounds))
    }
}

/// An alignment-respecting sequential writer into a flash region.
///
/// Bytes are staged until a full write unit is available; full units in the
/// middle of a write are programmed straight from the caller's buffer. The
/// final partial unit is padded with `0xff` by [`AlignedWriter::finish()`].
pub struct AlignedWriter<'f, F: ?Sized> {
    flash: &'f mut F,
    region: Region,
    offset: u32,
    align: usize,
    staged: [u8; MAX_WRITE_ALIGNMENT],
    staged_len: usize,
}

impl<'f, F: Flash + ?Sized> AlignedWriter<'f, F> {
    /// Creates a writer positioned at the start of `region`, which must
    /// already be erased.
    pub fn new(flash: &'f mut F, region: Region) -> Result<Self, plat::Error> {
        let align = flash.write_alignment() as usize;
        check!(
            align != 0 && align <= MAX_WRITE_ALIGNMENT,
            plat::Error::Inval
        );
        Ok(Self {
            flash,
            region,
            offset: 0,
            align,
            staged: [0xff; MAX_WRITE_ALIGNMENT],
            staged_len: 0,
        })
    }

    /// Returns the number of bytes accepted so far.
    pub fn position(&self) -> u32 {
        self.offset + self.staged_len as u32
    }

    /// Moves the write position to `offset`, which must be a multiple of the
    /// write alignment. Staged bytes are written out first.
    pub fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        check!(offset as usize % self.align == 0, plat::Error::Inval);
        check!(offset <= self.region.len, plat::Error::OutOfBounds);
        self.pad_staged()?;
        self.offset = offset;
        Ok(())
    }

    fn program(&mut self, at: u32, data: &[u8]) -> Result<(), plat::Error> {
        let in_bounds = at
            .checked_add(data.len() as u32)
            .map_or(false, |end| end <= self.region.len);
        check!(in_bounds, plat::Error::Size);

        let ptr = Ptr::new(self.region.ptr.address + at);
        self.flash.program(ptr, data).map_err(|e| {
            fail!(plat::Error::from(e), "program at {:?} failed: {:?}", ptr, e)
        })
    }

    /// Appends `data`.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), plat::Error> {
        if self.staged_len > 0 {
            let take = (self.align - self.staged_len).min(data.len());
            self.staged[self.staged_len..self.staged_len + take]
                .copy_from_slice(&data[..take]);
            self.staged_len += take;
            data = &data[take..];

            if self.staged_len < self.align {
                return Ok(());
            }
            let unit = self.staged;
            self.program(self.offset, &unit[..self.align])?;
            self.offset += self.align as u32;
            self.staged_len = 0;
        }

        let direct = data.len() - data.len() % self.align;
        if direct > 0 {
            self.program(self.offset, &data[..direct])?;
            self.offset += direct as u32;
        }

        let rest = &data[direct..];
        self.staged[..rest.len()].copy_from_slice(rest);
        self.staged_len = rest.len();
        Ok(())
    }

    fn pad_staged(&mut self) -> Result<(), plat::Error> {
        if self.staged_len == 0 {
            return Ok(());
        }
        let mut unit = self.staged;
        for byte in &mut unit[self.staged_len..self.align] {
            *byte = 0xff;
        }
        self.program(self.offset, &unit[..self.align])?;
        self.offset += self.align as u32;
        self.staged_len = 0;
        Ok(())
    }

    /// Pads and writes out any staged bytes, then flushes the device.
    ///
    /// Writing may continue afterwards, from the next write unit.
    pub fn flush(&mut self) -> Result<(), plat::Error> {
        self.pad_staged()?;
        self.flash
            .flush()
            .map_err(|e| fail!(plat::Error::from(e)))
    }

    /// Like [`AlignedWriter::flush()`], but consumes the writer.
    pub fn finish(mut self) -> Result<(), plat::Error> {
        self.flush()
    }

    /// Erases the whole region, dropping staged bytes, and moves back to its
    /// start.
    pub fn erase(&mut self) -> Result<(), plat::Error> {
        self.staged_len = 0;
        self.offset = 0;
        self.flash
            .erase(self.region)
            .map_err(|e| fail!(plat::Error::from(e)))
    }

    /// Returns the region this writer writes into.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Tears down this writer, returning the flash device.
    ///
    /// Staged bytes are dropped; call [`AlignedWriter::flush()`] first.
    pub fn into_flash(self) -> &'f mut F {
        self.flash
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::crypto::ring;
    use crate::hardware::flash::RamMut;
    use crate::mem::BumpArena;
    use crate::mem::OutOfMemory;
    use pretty_assertions::assert_eq;

    pub const CLASS_ROOT: Uuid = Uuid([0x11; 16]);
    pub const CLASS_APP: Uuid = Uuid([0x22; 16]);

    pub const POLICY: ManifestPolicy = ManifestPolicy {
        downgrade_prevention: true,
        independent_update: true,
        signature_check: SignatureCheck::OnUpdateAndBoot,
    };

    pub const MANIFESTS: &[ManifestSlot] = &[
        ManifestSlot {
            class_id: CLASS_ROOT,
            role: Role::AppRoot,
            region: Region::new(0x0000, 0x400),
            policy: POLICY,
        },
        ManifestSlot {
            class_id: CLASS_APP,
            role: Role::AppLocal1,
            region: Region::new(0x0400, 0x400),
            policy: ManifestPolicy {
                downgrade_prevention: false,
                independent_update: false,
                signature_check: SignatureCheck::OnUpdate,
            },
        },
    ];

    pub const REPORTS: &[Region] =
        &[Region::new(0x0800, 0x100), Region::new(0x0900, 0x100)];

    pub const LAYOUT: Layout<'static> = Layout {
        manifests: MANIFESTS,
        flags: Region::new(0x0a00, 0x100),
        reports: REPORTS,
        nvv: Region::new(0x0b00, 0x100),
        nvv_backup: Region::new(0x0c00, 0x100),
        nvv_count: 8,
        update_candidate: Region::new(0x0d00, 0x100),
    };

    pub type TestFlash = RamMut<Vec<u8>>;
    pub type TestStorage = Storage<'static, TestFlash, ring::hash::Engine>;

    pub fn blank_flash() -> TestFlash {
        RamMut::new(vec![0xff; 0x1000]).with_geometry(8, 0x100)
    }

    pub fn storage() -> TestStorage {
        Storage::init(blank_flash(), LAYOUT, ring::hash::Engine::new()).unwrap()
    }

    #[test]
    fn init_checks_readiness() {
        let mut flash = blank_flash();
        flash.set_ready(false);
        let err = Storage::init(flash, LAYOUT, ring::hash::Engine::new())
            .err()
            .unwrap();
        assert_eq!(err.into_inner(), plat::Error::HwNotReady);
    }

    #[test]
    fn init_rejects_bad_layouts() {
        let init = |layout| {
            Storage::init(blank_flash(), layout, ring::hash::Engine::new())
                .err()
                .map(|e| e.into_inner())
        };

        let overlapping = Layout {
            flags: Region::new(0x0900, 0x100),
            ..LAYOUT
        };
        assert_eq!(init(overlapping), Some(plat::Error::Inval));

        let unaligned = Layout {
            update_candidate: Region::new(0x0d80, 0x100),
            ..LAYOUT
        };
        assert_eq!(init(unaligned), Some(plat::Error::Inval));

        let outside = Layout {
            update_candidate: Region::new(0x1000, 0x100),
            ..LAYOUT
        };
        assert_eq!(init(outside), Some(plat::Error::OutOfBounds));

        let too_many_vars = Layout {
            nvv_count: 1000,
            ..LAYOUT
        };
        assert_eq!(init(too_many_vars), Some(plat::Error::Inval));
    }

    #[test]
    fn envelope_roundtrip_trims_padding() {
        let mut storage = storage();
        // A CBOR byte string holding three bytes.
        let envelope = [0x43, 1, 2, 3];
        storage.install_envelope(&CLASS_APP, &envelope).unwrap();
        assert_eq!(
            storage.installed_envelope(&CLASS_APP, &OutOfMemory).unwrap(),
            &envelope
        );
        assert_eq!(
            storage
                .installed_envelope(&CLASS_ROOT, &OutOfMemory)
                .unwrap_err()
                .into_inner(),
            plat::Error::NotFound
        );

        storage.clear_envelope(&CLASS_APP).unwrap();
        assert!(storage.installed_envelope(&CLASS_APP, &OutOfMemory).is_err());
    }

    #[test]
    fn unknown_class() {
        let mut storage = storage();
        let err = storage
            .install_envelope(&Uuid([0x33; 16]), &[0x40])
            .unwrap_err();
        assert_eq!(err.into_inner(), plat::Error::NotFound);
    }

    #[test]
    fn reports() {
        let mut storage = storage();
        storage.report_save(1, b"report").unwrap();
        assert_eq!(
            &storage.report_read(1, &OutOfMemory).unwrap()[..6],
            b"report"
        );
        assert_eq!(
            storage.report_read(0, &OutOfMemory).unwrap_err().into_inner(),
            plat::Error::NotFound
        );
        assert_eq!(
            storage.report_save(2, b"x").unwrap_err().into_inner(),
            plat::Error::OutOfBounds
        );
        storage.report_clear(1).unwrap();
        assert!(storage.report_read(1, &OutOfMemory).is_err());
    }

    #[test]
    fn update_candidate() {
        let mut storage = storage();
        let regions = [Region::new(0x1000_0000, 0x4000), Region::new(0x2000_0000, 12)];
        storage.update_candidate_set(&regions).unwrap();

        let mut buf = [0; 64];
        let arena = BumpArena::new(&mut buf);
        assert_eq!(storage.update_candidate_get(&arena).unwrap(), &regions);

        storage.update_candidate_clear().unwrap();
        assert!(storage.update_candidate_get(&arena).is_err());
        assert_eq!(
            storage.update_candidate_set(&[]).unwrap_err().into_inner(),
            plat::Error::Inval
        );
    }

    #[test]
    fn aligned_writer_chunking_is_irrelevant() {
        let payload: Vec<u8> = (0..=99).collect();
        let mut reference = None;
        for chunk in [1, 3, 7, 8, 9, 100] {
            let mut flash = RamMut::new(vec![0xff; 128]).with_geometry(8, 128);
            let mut writer = AlignedWriter::new(&mut flash, Region::new(0, 128)).unwrap();
            for part in payload.chunks(chunk) {
                writer.write(part).unwrap();
            }
            writer.finish().unwrap();

            let image = flash.as_bytes().to_vec();
            assert_eq!(&image[..100], &payload[..]);
            match &reference {
                None => reference = Some(image),
                Some(r) => assert_eq!(r, &image),
            }
        }
    }

    #[test]
    fn aligned_writer_respects_region_end() {
        let mut flash = RamMut::new(vec![0xff; 32]).with_geometry(8, 16);
        let mut writer = AlignedWriter::new(&mut flash, Region::new(0, 16)).unwrap();
        writer.write(&[0; 16]).unwrap();
        writer.write(&[0]).unwrap();
        assert_eq!(writer.finish().unwrap_err().into_inner(), plat::Error::Size);
    }
}
