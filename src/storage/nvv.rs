// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The non-volatile variable area.
//!
//! Variables are single bytes. The area is stored as a binary record holding
//! the variables followed by their SHA-256 digest, and the same record is
//! mirrored into a backup region. A copy is valid only if its digest matches.

use byteorder::ByteOrder as _;
use byteorder::LE;

use crate::crypto::hash;
use crate::crypto::hash::EngineExt as _;
use crate::hardware::flash::Flash;
use crate::hardware::flash::Region;
use crate::plat;
use crate::storage::record;
use crate::storage::record::Magic;
use crate::storage::Storage;
use crate::variables::Nvm;
use crate::wire::WireEnum as _;
use crate::Result;

/// The largest number of non-volatile variables.
pub const MAX_VARIABLES: usize = 64;

const DIGEST_ALGO: hash::Algo = hash::Algo::Sha256;
const DIGEST_LEN: usize = DIGEST_ALGO.bytes();
const MAX_RECORD_LEN: usize = record::HEADER_LEN as usize + MAX_VARIABLES + DIGEST_LEN;

/// Returns the length of an NVV record holding `count` variables.
pub(crate) fn record_len(count: u32) -> u32 {
    record::HEADER_LEN
        .saturating_add(count)
        .saturating_add(DIGEST_LEN as u32)
}

/// What [`Storage::init()`] had to do to bring the variable area into a
/// consistent state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Repair {
    /// Both copies were valid and identical.
    Intact,
    /// The main copy was valid; the backup was rewritten from it.
    BackupRefreshed,
    /// Only the backup was valid; the main copy was restored from it.
    MainRestored,
    /// Neither copy was valid; both were rewritten with erased values.
    Reinitialized,
}

/// A copy of the variables, as read from one region.
struct Image {
    vars: [u8; MAX_VARIABLES],
    digest: [u8; DIGEST_LEN],
}

impl<'a, F: Flash, H: hash::Engine> Storage<'a, F, H> {
    fn nvv_len(&self) -> usize {
        self.layout.nvv_count as usize
    }

    /// Reads the copy stored in `region`, returning `None` if it is erased,
    /// corrupt, or fails digest verification.
    fn nvv_read_copy(&mut self, region: Region) -> Result<Option<Image>, plat::Error> {
        let n = self.nvv_len();
        let len = record_len(n as u32) as usize;
        let mut buf = [0; MAX_RECORD_LEN];
        self.flash
            .read(region.ptr, &mut buf[..len])
            .map_err(|e| fail!(plat::Error::from(e)))?;

        if Magic::from_wire_value(LE::read_u32(&buf[..4])) != Some(Magic::Binary) {
            return Ok(None);
        }

        let body = &buf[record::HEADER_LEN as usize..len];
        let (vars, digest) = body.split_at(n);
        let verified = self
            .hash
            .new_hash(DIGEST_ALGO)
            .and_then(|mut h| {
                h.write(vars)?;
                h.expect(digest)
            });
        match verified {
            Ok(()) => {}
            Err(hash::Error::Mismatch) => {
                warn!("nvv digest mismatch in {:?}", region);
                return Ok(None);
            }
            Err(e) => return Err(fail!(plat::Error::from(e))),
        }

        let mut copy = Image {
            vars: [0xff; MAX_VARIABLES],
            digest: [0; DIGEST_LEN],
        };
        copy.vars[..n].copy_from_slice(vars);
        copy.digest.copy_from_slice(digest);
        Ok(Some(copy))
    }

    fn nvv_write_copy(&mut self, region: Region, copy: &Image) -> Result<(), plat::Error> {
        let n = self.nvv_len();
        record::write_record(
            &mut self.flash,
            region,
            Magic::Binary,
            &[&copy.vars[..n], &copy.digest],
        )
    }

    /// Recomputes the digest of `vars` and writes them to the main area, then
    /// to the backup.
    fn nvv_commit(&mut self, vars: &[u8; MAX_VARIABLES]) -> Result<(), plat::Error> {
        let n = self.nvv_len();
        let mut copy = Image {
            vars: *vars,
            digest: [0; DIGEST_LEN],
        };
        self.hash
            .contiguous_hash(DIGEST_ALGO, &vars[..n], &mut copy.digest)
            .map_err(|e| fail!(plat::Error::from(e)))?;

        self.nvv_write_copy(self.layout.nvv, &copy)?;
        self.nvv_write_copy(self.layout.nvv_backup, &copy)
    }

    /// Brings the main and backup areas into agreement.
    pub(crate) fn nvv_validate(&mut self) -> Result<Repair, plat::Error> {
        let main = self.nvv_read_copy(self.layout.nvv)?;
        let backup = self.nvv_read_copy(self.layout.nvv_backup)?;

        match (main, backup) {
            (Some(main), Some(backup)) if main.digest == backup.digest => Ok(Repair::Intact),
            (Some(main), _) => {
                info!("refreshing nvv backup");
                self.nvv_write_copy(self.layout.nvv_backup, &main)?;
                Ok(Repair::BackupRefreshed)
            }
            (None, Some(backup)) => {
                info!("restoring nvv from backup");
                self.nvv_write_copy(self.layout.nvv, &backup)?;
                Ok(Repair::MainRestored)
            }
            (None, None) => {
                warn!("no valid nvv copy; loading defaults");
                self.nvv_commit(&[0xff; MAX_VARIABLES])?;
                Ok(Repair::Reinitialized)
            }
        }
    }

    /// Reads non-volatile variable `index` from the first valid copy.
    pub fn nvv_get(&mut self, index: u32) -> Result<u8, plat::Error> {
        let index = self.nvv_index(index)?;
        if let Some(copy) = self.nvv_read_copy(self.layout.nvv)? {
            return Ok(copy.vars[index]);
        }
        match self.nvv_read_copy(self.layout.nvv_backup)? {
            Some(copy) => Ok(copy.vars[index]),
            None => Err(fail!(plat::Error::Authentication)),
        }
    }

    /// Writes non-volatile variable `index`.
    ///
    /// Refuses to write unless the main copy is valid; in particular, a
    /// valid backup alone is not enough.
    pub fn nvv_set(&mut self, index: u32, value: u8) -> Result<(), plat::Error> {
        let index = self.nvv_index(index)?;
        let mut copy = match self.nvv_read_copy(self.layout.nvv)? {
            Some(copy) => copy,
            None => {
                if self.nvv_read_copy(self.layout.nvv_backup)?.is_some() {
                    return Err(fail!(
                        plat::Error::Io,
                        "refusing to update nvv while only the backup is valid"
                    ));
                }
                return Err(fail!(plat::Error::Authentication));
            }
        };

        if copy.vars[index] == value {
            return Ok(());
        }
        copy.vars[index] = value;
        self.nvv_commit(&copy.vars)
    }
}

impl<'a, F: Flash, H: hash::Engine> Nvm for Storage<'a, F, H> {
    fn nvm_get(&mut self, index: u32) -> Result<u8, plat::Error> {
        self.nvv_get(index)
    }

    fn nvm_set(&mut self, index: u32, value: u8) -> Result<(), plat::Error> {
        self.nvv_set(index, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::ring;
    use crate::storage::test::blank_flash;
    use crate::storage::test::storage;
    use crate::storage::test::TestStorage;
    use crate::storage::test::LAYOUT;
    use crate::storage::Layout;

    fn reinit(storage: TestStorage) -> TestStorage {
        Storage::init(storage.into_flash(), LAYOUT, ring::hash::Engine::new()).unwrap()
    }

    /// Rebuilds the handle without running the repair pass.
    fn reopen(storage: TestStorage) -> TestStorage {
        Storage {
            flash: storage.into_flash(),
            layout: LAYOUT,
            hash: ring::hash::Engine::new(),
        }
    }

    fn corrupt(storage: &mut TestStorage, region: Region) {
        // Flip a variable byte without updating the digest.
        let at = (region.ptr.address + record::HEADER_LEN) as usize;
        storage.flash_mut().as_bytes_mut()[at] ^= 0x01;
    }

    #[test]
    fn defaults_are_erased() {
        let mut storage = storage();
        for i in 0..LAYOUT.nvv_count {
            assert_eq!(storage.nvv_get(i).unwrap(), 0xff);
        }
        assert_eq!(
            storage.nvv_get(LAYOUT.nvv_count).unwrap_err().into_inner(),
            plat::Error::OutOfBounds
        );
    }

    #[test]
    fn values_persist() {
        let mut storage = storage();
        storage.nvv_set(3, 0x42).unwrap();
        let mut storage = reinit(storage);
        assert_eq!(storage.nvv_get(3).unwrap(), 0x42);
        assert_eq!(storage.nvv_get(2).unwrap(), 0xff);
    }

    #[test]
    fn backup_restores_main() {
        let mut storage = storage();
        storage.nvv_set(0, 7).unwrap();
        corrupt(&mut storage, LAYOUT.nvv);

        // Reads fall back to the backup, but writes are refused.
        assert_eq!(storage.nvv_get(0).unwrap(), 7);
        assert_eq!(
            storage.nvv_set(0, 8).unwrap_err().into_inner(),
            plat::Error::Io
        );

        let mut storage = reopen(storage);
        assert_eq!(storage.nvv_validate().unwrap(), Repair::MainRestored);
        assert_eq!(storage.nvv_validate().unwrap(), Repair::Intact);
        storage.nvv_set(0, 8).unwrap();
        assert_eq!(storage.nvv_get(0).unwrap(), 8);
    }

    #[test]
    fn main_refreshes_backup() {
        let mut storage = storage();
        storage.nvv_set(1, 1).unwrap();
        corrupt(&mut storage, LAYOUT.nvv_backup);

        let mut storage = reopen(storage);
        assert_eq!(storage.nvv_validate().unwrap(), Repair::BackupRefreshed);
        assert!(storage.nvv_read_copy(LAYOUT.nvv_backup).unwrap().is_some());
    }

    #[test]
    fn both_corrupt_reinitializes() {
        let mut storage = storage();
        storage.nvv_set(5, 5).unwrap();
        corrupt(&mut storage, LAYOUT.nvv);
        corrupt(&mut storage, LAYOUT.nvv_backup);
        assert_eq!(
            storage.nvv_get(5).unwrap_err().into_inner(),
            plat::Error::Authentication
        );

        let mut storage = reinit(storage);
        assert_eq!(storage.nvv_get(5).unwrap(), 0xff);
    }

    #[test]
    fn fresh_device_is_provisioned() {
        let mut storage = Storage {
            flash: blank_flash(),
            layout: LAYOUT,
            hash: ring::hash::Engine::new(),
        };
        assert_eq!(storage.nvv_validate().unwrap(), Repair::Reinitialized);
        assert_eq!(storage.nvv_validate().unwrap(), Repair::Intact);
    }

    #[test]
    fn record_fits_layout() {
        let layout: Layout<'_> = LAYOUT;
        assert!(record_len(layout.nvv_count) <= layout.nvv.len);
        assert_eq!(MAX_RECORD_LEN, 4 + 64 + 32);
    }
}
