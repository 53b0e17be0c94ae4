// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The boot flags array.
//!
//! The flags region is an array of cells, each one write unit wide (but at
//! least eight bytes). A cell is either erased or holds a flag record: the
//! [`Magic::Flag`] word followed by the magic word of the [`Flag`] it
//! carries. Flags that live in the same cell are mutually exclusive; setting
//! one replaces the other.

use byteorder::ByteOrder as _;
use byteorder::LE;

use crate::crypto::hash;
use crate::hardware::flash::Flash;
use crate::hardware::flash::Ptr;
use crate::mem::round_up;
use crate::plat;
use crate::storage::record;
use crate::storage::record::Magic;
use crate::storage::AlignedWriter;
use crate::storage::Storage;
use crate::wire::WireEnum as _;
use crate::Result;

wire_enum! {
    /// A boot flag, identified by the magic word stored in its cell.
    pub enum Flag: u32 {
        /// The device should boot into recovery mode.
        Recovery = 0x5256_4352,
        /// The device should boot into foreground DFU mode.
        ForegroundDfu = 0x5546_4446,
    }
}

impl Flag {
    /// Returns the index of the cell this flag is stored in.
    pub fn cell(self) -> usize {
        match self {
            Self::Recovery | Self::ForegroundDfu => 0,
        }
    }
}

/// The number of cells in the flags array.
const CELLS: usize = 1;

/// The number of meaningful bytes in a cell.
const CELL_DATA_LEN: usize = 8;

fn cell_len(align: u32) -> u32 {
    round_up(CELL_DATA_LEN as u32, align).unwrap_or(u32::MAX)
}

/// Returns the minimum length of a flags region for a device with the given
/// write alignment.
pub(crate) fn area_len(align: u32) -> u32 {
    cell_len(align).saturating_mul(CELLS as u32)
}

fn decode_cell(bytes: &[u8; CELL_DATA_LEN], index: usize) -> Result<Option<Flag>, plat::Error> {
    let magic = LE::read_u32(&bytes[..4]);
    let value = LE::read_u32(&bytes[4..]);
    match Magic::from_wire_value(magic) {
        Some(Magic::Empty) if value == u32::MAX => Ok(None),
        Some(Magic::Flag) => match Flag::from_wire_value(value) {
            Some(flag) if flag.cell() == index => Ok(Some(flag)),
            _ => Err(fail!(
                plat::Error::Crash,
                "flag cell {} holds unknown flag {:#010x}",
                index,
                value
            )),
        },
        _ => Err(fail!(
            plat::Error::Crash,
            "flag cell {} is corrupt: {:#010x} {:#010x}",
            index,
            magic,
            value
        )),
    }
}

impl<'a, F: Flash, H: hash::Engine> Storage<'a, F, H> {
    fn flag_cells(&self) -> Result<[Option<Flag>; CELLS], plat::Error> {
        let region = self.layout.flags;
        let align = record::check_region(&self.flash, region)?;
        let stride = cell_len(align);

        let mut cells = [None; CELLS];
        for (i, cell) in cells.iter_mut().enumerate() {
            let mut bytes = [0; CELL_DATA_LEN];
            let ptr = Ptr::new(region.ptr.address + stride * i as u32);
            self.flash
                .read(ptr, &mut bytes)
                .map_err(|e| fail!(plat::Error::from(e)))?;
            *cell = decode_cell(&bytes, i)?;
        }
        Ok(cells)
    }

    fn flag_cells_write(&mut self, cells: &[Option<Flag>; CELLS]) -> Result<(), plat::Error> {
        let region = self.layout.flags;
        record::clear(&mut self.flash, region)?;

        let stride = cell_len(self.flash.write_alignment());
        let mut writer = AlignedWriter::new(&mut self.flash, region)?;
        for (i, cell) in cells.iter().enumerate() {
            let flag = match cell {
                Some(flag) => flag,
                None => continue,
            };
            let mut bytes = [0; CELL_DATA_LEN];
            LE::write_u32(&mut bytes[..4], Magic::Flag.to_wire_value());
            LE::write_u32(&mut bytes[4..], flag.to_wire_value());

            writer.seek(stride * i as u32)?;
            writer.write(&bytes)?;
        }
        writer.finish()
    }

    /// Sets `flag`, replacing any other flag sharing its cell.
    ///
    /// Writes nothing if `flag` is already set.
    pub fn flags_set(&mut self, flag: Flag) -> Result<(), plat::Error> {
        let mut cells = self.flag_cells()?;
        if cells[flag.cell()] == Some(flag) {
            return Ok(());
        }
        info!("setting flag {}", flag);
        cells[flag.cell()] = Some(flag);
        self.flag_cells_write(&cells)
    }

    /// Clears `flag`.
    ///
    /// Writes nothing if `flag` is not set.
    pub fn flags_clear(&mut self, flag: Flag) -> Result<(), plat::Error> {
        let mut cells = self.flag_cells()?;
        if cells[flag.cell()] != Some(flag) {
            return Ok(());
        }
        info!("clearing flag {}", flag);
        cells[flag.cell()] = None;
        self.flag_cells_write(&cells)
    }

    /// Checks whether `flag` is set, returning [`plat::Error::NotFound`] if
    /// it is not.
    pub fn flags_check(&self, flag: Flag) -> Result<(), plat::Error> {
        let cells = self.flag_cells()?;
        if cells[flag.cell()] != Some(flag) {
            return Err(fail!(plat::Error::NotFound));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::test::storage;
    use crate::storage::test::LAYOUT;

    fn is_set(storage: &crate::storage::test::TestStorage, flag: Flag) -> bool {
        match storage.flags_check(flag) {
            Ok(()) => true,
            Err(e) if e.into_inner() == plat::Error::NotFound => false,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn fresh_flags_are_clear() {
        let storage = storage();
        assert!(!is_set(&storage, Flag::Recovery));
        assert!(!is_set(&storage, Flag::ForegroundDfu));
    }

    #[test]
    fn set_and_clear() {
        let mut storage = storage();
        storage.flags_set(Flag::Recovery).unwrap();
        assert!(is_set(&storage, Flag::Recovery));
        assert!(!is_set(&storage, Flag::ForegroundDfu));

        storage.flags_clear(Flag::Recovery).unwrap();
        assert!(!is_set(&storage, Flag::Recovery));
    }

    #[test]
    fn flags_sharing_a_cell_are_exclusive() {
        let mut storage = storage();
        storage.flags_set(Flag::Recovery).unwrap();
        storage.flags_set(Flag::ForegroundDfu).unwrap();
        assert!(is_set(&storage, Flag::ForegroundDfu));
        assert!(!is_set(&storage, Flag::Recovery));

        // Clearing a flag that is not set leaves the other one alone.
        storage.flags_clear(Flag::Recovery).unwrap();
        assert!(is_set(&storage, Flag::ForegroundDfu));
    }

    #[test]
    fn redundant_writes_are_skipped() {
        let mut storage = storage();
        storage.flags_set(Flag::Recovery).unwrap();
        let before = storage.flash().mutations();

        storage.flags_set(Flag::Recovery).unwrap();
        storage.flags_clear(Flag::ForegroundDfu).unwrap();
        assert_eq!(storage.flash().mutations(), before);
    }

    #[test]
    fn corruption_is_reported() {
        let mut storage = storage();
        let base = LAYOUT.flags.ptr.address as usize;
        storage.flash_mut().as_bytes_mut()[base..base + 8]
            .copy_from_slice(&[0x53, 0x55, 0x46, 0x4c, 1, 2, 3, 4]);
        assert_eq!(
            storage.flags_check(Flag::Recovery).unwrap_err().into_inner(),
            plat::Error::Crash
        );

        storage.flash_mut().as_bytes_mut()[base] = 0x00;
        assert_eq!(
            storage.flags_set(Flag::Recovery).unwrap_err().into_inner(),
            plat::Error::Crash
        );
    }
}
