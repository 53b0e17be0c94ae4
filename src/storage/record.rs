// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Region-level records.
//!
//! Every storage region starts with a 4-byte little-endian magic word that
//! says what the rest of the region holds:
//!
//! | magic           | meaning                                      |
//! |-----------------|----------------------------------------------|
//! | `0xffffffff`    | erased; nothing stored                       |
//! | [`Magic::Flag`] | a flag record; the next word says which flag |
//! | [`Magic::Binary`] | binary data fills the rest of the region, padded with `0xff` |
//!
//! Anything else is corruption. Regions are always erased before they are
//! written, so a power loss part-way through a write leaves either an erased
//! region or a partially programmed one, never a stale record with a valid
//! magic in front of new data.

use byteorder::ByteOrder as _;
use byteorder::LE;

use crate::hardware::flash::Flash;
use crate::hardware::flash::Region;
use crate::mem::is_multiple_of;
use crate::mem::Arena;
use crate::plat;
use crate::storage::AlignedWriter;
use crate::wire::WireEnum as _;
use crate::Result;

/// The length of the magic word at the start of every record.
pub const HEADER_LEN: u32 = 4;

wire_enum! {
    /// The magic word at the start of a record.
    pub enum Magic: u32 {
        /// The region is erased.
        Empty = 0xffff_ffff,
        /// The region holds a flag record.
        Flag = 0x4c46_5553,
        /// The region holds binary data.
        Binary = 0x4e42_5553,
    }
}

/// A decoded record.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Record<'a> {
    /// The region is erased.
    Empty,
    /// The region holds a flag record.
    Flag,
    /// The region holds binary data.
    ///
    /// The slice covers everything after the header, including any `0xff`
    /// padding; the stored length is not recorded, so formats stored here
    /// must be self-delimiting.
    Binary(&'a [u8]),
}

impl<'a> Record<'a> {
    /// Decodes the record stored in `bytes`, the full contents of a region.
    ///
    /// Returns `None` if the region is too short to hold a header or holds
    /// an unknown magic word.
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN as usize {
            return None;
        }
        let (header, body) = bytes.split_at(HEADER_LEN as usize);
        match Magic::from_wire_value(LE::read_u32(header))? {
            Magic::Empty => Some(Self::Empty),
            Magic::Flag => Some(Self::Flag),
            Magic::Binary => Some(Self::Binary(body)),
        }
    }
}

/// Validates `region` against the geometry of `flash`, returning the write
/// alignment to use.
///
/// Checks are ordered so that argument errors are reported before device
/// state: an empty region is `Inval`, a region smaller than one write unit
/// is `Size`, a region not made of whole erase blocks is `Inval`, a region
/// past the end of the device is `OutOfBounds`, and only then is readiness
/// checked.
pub(crate) fn check_region<F: Flash + ?Sized>(
    flash: &F,
    region: Region,
) -> Result<u32, plat::Error> {
    check!(region.len != 0, plat::Error::Inval);

    let align = flash.write_alignment();
    check!(
        align != 0 && align as usize <= super::MAX_WRITE_ALIGNMENT,
        plat::Error::Inval
    );
    check!(region.len >= align, plat::Error::Size);

    let block = flash.erase_block_size();
    check!(
        is_multiple_of(region.ptr.address, block)
            && is_multiple_of(region.len, block),
        plat::Error::Inval
    );

    let end = region.end().ok_or_else(|| fail!(plat::Error::OutOfBounds))?;
    let size = flash.size().map_err(|e| fail!(plat::Error::from(e)))?;
    check!(end <= size, plat::Error::OutOfBounds);

    check!(flash.is_ready(), plat::Error::HwNotReady);
    Ok(align)
}

/// Erases `region`.
pub fn clear<F: Flash + ?Sized>(
    flash: &mut F,
    region: Region,
) -> Result<(), plat::Error> {
    check_region(flash, region)?;
    trace!("erasing {:?}", region);
    flash
        .erase(region)
        .map_err(|e| fail!(plat::Error::from(e), "erase of {:?} failed: {:?}", region, e))
}

/// Stores `payload` as a binary record in `region`.
///
/// The region is erased first; the header and payload are then programmed
/// in write-alignment-sized units, with the final unit padded with `0xff`.
pub fn save<F: Flash + ?Sized>(
    flash: &mut F,
    region: Region,
    payload: &[u8],
) -> Result<(), plat::Error> {
    write_record(flash, region, Magic::Binary, &[payload])
}

/// Stores a flag record carrying `value` in `region`.
pub fn save_flag<F: Flash + ?Sized>(
    flash: &mut F,
    region: Region,
    value: u32,
) -> Result<(), plat::Error> {
    let mut word = [0; 4];
    LE::write_u32(&mut word, value);
    write_record(flash, region, Magic::Flag, &[&word])
}

/// Writes a record made of `magic` followed by the concatenation of `parts`.
pub(crate) fn write_record<F: Flash + ?Sized>(
    flash: &mut F,
    region: Region,
    magic: Magic,
    parts: &[&[u8]],
) -> Result<(), plat::Error> {
    check_region(flash, region)?;
    let len: usize = parts.iter().map(|p| p.len()).sum();
    check!(
        len <= (region.len - HEADER_LEN.min(region.len)) as usize,
        plat::Error::Size
    );

    flash
        .erase(region)
        .map_err(|e| fail!(plat::Error::from(e), "erase of {:?} failed: {:?}", region, e))?;

    let mut header = [0; HEADER_LEN as usize];
    LE::write_u32(&mut header, magic.to_wire_value());

    let mut writer = AlignedWriter::new(flash, region)?;
    writer.write(&header)?;
    for part in parts {
        writer.write(part)?;
    }
    writer.finish()
}

/// Reads the record stored in `region`.
///
/// Erased regions and regions with an unknown magic word are both reported
/// as [`plat::Error::NotFound`]; the latter is additionally logged as
/// corruption.
pub fn read<'a, F: Flash + ?Sized>(
    flash: &'a F,
    region: Region,
    arena: &'a dyn Arena,
) -> Result<Record<'a>, plat::Error> {
    check_region(flash, region)?;
    let bytes = flash
        .read_direct(region, arena, 1)
        .map_err(|e| fail!(plat::Error::from(e)))?;

    match Record::decode(bytes) {
        Some(Record::Empty) => Err(fail!(plat::Error::NotFound)),
        Some(record) => Ok(record),
        None => Err(fail!(
            plat::Error::NotFound,
            "corrupt record header in {:?}",
            region
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hardware::flash::RamMut;
    use crate::mem::BumpArena;
    use crate::mem::OutOfMemory;

    fn flash() -> RamMut<Vec<u8>> {
        RamMut::new(vec![0xff; 256]).with_geometry(8, 64)
    }

    #[test]
    fn save_then_read() {
        let mut flash = flash();
        let region = Region::new(64, 64);
        save(&mut flash, region, b"hello, world").unwrap();

        let record = read(&flash, region, &OutOfMemory).unwrap();
        let body = match record {
            Record::Binary(body) => body,
            r => panic!("unexpected record: {:?}", r),
        };
        assert_eq!(body.len(), 60);
        assert_eq!(&body[..12], b"hello, world");
        assert!(body[12..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn partial_units_are_padded() {
        let mut flash = flash();
        let region = Region::new(0, 64);
        // Header plus 5 bytes is 9 bytes: one full write unit and one padded.
        save(&mut flash, region, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(&flash.as_bytes()[4..9], &[1, 2, 3, 4, 5]);
        assert!(flash.as_bytes()[9..64].iter().all(|&b| b == 0xff));
        assert_eq!(flash.mutations(), 3);
    }

    #[test]
    fn erased_and_corrupt_are_not_found() {
        let mut flash = flash();
        let region = Region::new(0, 64);
        assert_eq!(
            read(&flash, region, &OutOfMemory).unwrap_err().into_inner(),
            plat::Error::NotFound
        );

        flash.as_bytes_mut()[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            read(&flash, region, &OutOfMemory).unwrap_err().into_inner(),
            plat::Error::NotFound
        );
    }

    #[test]
    fn clear_erases() {
        let mut flash = flash();
        let region = Region::new(128, 64);
        save(&mut flash, region, b"data").unwrap();
        clear(&mut flash, region).unwrap();
        assert_eq!(
            read(&flash, region, &OutOfMemory).unwrap_err().into_inner(),
            plat::Error::NotFound
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let mut flash = flash();
        let region = Region::new(64, 64);
        save_flag(&mut flash, region, 7).unwrap();
        for _ in 0..2 {
            clear(&mut flash, region).unwrap();
            assert_eq!(
                read(&flash, region, &OutOfMemory).unwrap_err().into_inner(),
                plat::Error::NotFound
            );
            assert!(flash.as_bytes()[64..128].iter().all(|&b| b == 0xff));
        }
    }

    #[test]
    fn flag_records() {
        let mut flash = flash();
        let region = Region::new(0, 64);
        save_flag(&mut flash, region, 7).unwrap();
        assert_eq!(read(&flash, region, &OutOfMemory).unwrap(), Record::Flag);
    }

    #[test]
    fn argument_errors() {
        let mut flash = flash();
        let err = |r: Result<(), plat::Error>| r.unwrap_err().into_inner();

        assert_eq!(err(clear(&mut flash, Region::new(0, 0))), plat::Error::Inval);
        assert_eq!(err(clear(&mut flash, Region::new(0, 4))), plat::Error::Size);
        assert_eq!(err(clear(&mut flash, Region::new(8, 64))), plat::Error::Inval);
        assert_eq!(
            err(clear(&mut flash, Region::new(256, 64))),
            plat::Error::OutOfBounds
        );
        assert_eq!(
            err(save(&mut flash, Region::new(0, 64), &[0; 61])),
            plat::Error::Size
        );
        assert!(save(&mut flash, Region::new(0, 64), &[0; 60]).is_ok());
    }

    #[test]
    fn not_ready() {
        let mut flash = flash();
        flash.set_ready(false);
        assert_eq!(
            save(&mut flash, Region::new(0, 64), b"x")
                .unwrap_err()
                .into_inner(),
            plat::Error::HwNotReady
        );
    }

    #[test]
    fn device_errors_are_io() {
        let mut flash = flash();
        flash.set_fault_after(Some(1));
        assert_eq!(
            save(&mut flash, Region::new(0, 64), b"payload")
                .unwrap_err()
                .into_inner(),
            plat::Error::Io
        );
    }

    #[test]
    fn read_through_arena() {
        let mut flash = flash();
        let region = Region::new(0, 64);
        save(&mut flash, region, b"abc").unwrap();
        let mut buf = [0; 64];
        let arena = BumpArena::new(&mut buf);
        assert!(matches!(
            read(&flash, region, &arena),
            Ok(Record::Binary(b)) if &b[..3] == b"abc"
        ));
    }
}
