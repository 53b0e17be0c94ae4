// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Manifest variables.
//!
//! Manifest variables are small unsigned integers addressed by a numeric id.
//! The id space is split into three ranges with different backing stores:
//! - platform-volatile variables live in RAM until reset;
//! - manifest-volatile variables live in RAM until the manifest session that
//!   set them ends;
//! - NVM variables are single bytes persisted by an [`Nvm`] implementation,
//!   normally [`Storage`](crate::storage::Storage).
//!
//! Each range carries an access mask that manifests are checked against.

use enumflags2::bitflags;
use enumflags2::BitFlags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::plat;
use crate::Result;

/// A kind of access a manifest may be granted on a range of variables.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    /// Manifests may read these variables.
    Read = 0b01,
    /// Manifests may write these variables.
    Write = 0b10,
}

/// A contiguous range of variable ids.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Range {
    /// The first id in the range.
    pub base: u32,
    /// The number of ids in the range.
    pub count: u32,
    /// The access manifests have to this range.
    pub access: BitFlags<Access>,
}

impl Range {
    /// Returns the offset of `id` into this range, if it is inside it.
    pub fn offset_of(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.base)?;
        if offset < self.count {
            Some(offset)
        } else {
            None
        }
    }

    fn overlaps(&self, other: &Range) -> bool {
        let end = |r: &Range| u64::from(r.base) + u64::from(r.count);
        self.count != 0
            && other.count != 0
            && u64::from(self.base) < end(other)
            && u64::from(other.base) < end(self)
    }
}

/// The id ranges of a [`Variables`] store.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Variables held in RAM until reset.
    pub plat_volatile: Range,
    /// Variables held in RAM until the end of the manifest session.
    pub mfst_volatile: Range,
    /// Variables backed by non-volatile memory.
    pub nvm: Range,
}

/// Persistent storage for NVM-backed variables.
///
/// Indices are relative to the start of the NVM range.
pub trait Nvm {
    /// Reads the variable at `index`.
    fn nvm_get(&mut self, index: u32) -> Result<u8, plat::Error>;

    /// Writes the variable at `index`.
    fn nvm_set(&mut self, index: u32, value: u8) -> Result<(), plat::Error>;
}

impl<N: Nvm + ?Sized> Nvm for &mut N {
    fn nvm_get(&mut self, index: u32) -> Result<u8, plat::Error> {
        N::nvm_get(self, index)
    }

    fn nvm_set(&mut self, index: u32, value: u8) -> Result<(), plat::Error> {
        N::nvm_set(self, index, value)
    }
}

/// Which range an id resolved to.
#[derive(Copy, Clone)]
enum Slot {
    PlatVolatile(usize),
    MfstVolatile(usize),
    Nvm(u32),
}

/// A manifest variable store, holding up to `PLAT` platform-volatile and
/// `MFST` manifest-volatile variables.
pub struct Variables<const PLAT: usize, const MFST: usize> {
    config: Config,
    plat_volatile: [u32; PLAT],
    mfst_volatile: [u32; MFST],
}

impl<const PLAT: usize, const MFST: usize> Variables<PLAT, MFST> {
    /// Creates a new store, with every volatile variable set to zero.
    ///
    /// Fails with [`plat::Error::Inval`] if the ranges in `config` overlap
    /// or the volatile ranges do not fit their capacities.
    pub fn new(config: Config) -> Result<Self, plat::Error> {
        check!(
            config.plat_volatile.count as usize <= PLAT
                && config.mfst_volatile.count as usize <= MFST,
            plat::Error::Inval
        );

        let ranges = [config.plat_volatile, config.mfst_volatile, config.nvm];
        for (i, range) in ranges.iter().enumerate() {
            check!(
                range.base.checked_add(range.count).is_some(),
                plat::Error::Inval
            );
            for other in &ranges[i + 1..] {
                check!(!range.overlaps(other), plat::Error::Inval);
            }
        }

        Ok(Self {
            config,
            plat_volatile: [0; PLAT],
            mfst_volatile: [0; MFST],
        })
    }

    /// Returns the configuration this store was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn resolve(&self, id: u32) -> Result<(Slot, BitFlags<Access>), plat::Error> {
        let c = &self.config;
        if let Some(i) = c.plat_volatile.offset_of(id) {
            return Ok((Slot::PlatVolatile(i as usize), c.plat_volatile.access));
        }
        if let Some(i) = c.mfst_volatile.offset_of(id) {
            return Ok((Slot::MfstVolatile(i as usize), c.mfst_volatile.access));
        }
        if let Some(i) = c.nvm.offset_of(id) {
            return Ok((Slot::Nvm(i), c.nvm.access));
        }
        Err(fail!(plat::Error::NotFound))
    }

    /// Returns the access mask of the range `id` belongs to.
    pub fn get_access_mask(&self, id: u32) -> Result<BitFlags<Access>, plat::Error> {
        self.resolve(id).map(|(_, access)| access)
    }

    /// Reads variable `id`.
    ///
    /// Access masks are not enforced here; callers acting on behalf of a
    /// manifest check them with [`Variables::get_access_mask()`].
    pub fn get(&self, nvm: &mut impl Nvm, id: u32) -> Result<u32, plat::Error> {
        match self.resolve(id)?.0 {
            Slot::PlatVolatile(i) => Ok(self.plat_volatile[i]),
            Slot::MfstVolatile(i) => Ok(self.mfst_volatile[i]),
            Slot::Nvm(i) => nvm.nvm_get(i).map(u32::from),
        }
    }

    /// Writes variable `id`.
    ///
    /// NVM variables are a single byte wide; larger values are rejected with
    /// [`plat::Error::Size`].
    pub fn set(&mut self, nvm: &mut impl Nvm, id: u32, value: u32) -> Result<(), plat::Error> {
        match self.resolve(id)?.0 {
            Slot::PlatVolatile(i) => self.plat_volatile[i] = value,
            Slot::MfstVolatile(i) => self.mfst_volatile[i] = value,
            Slot::Nvm(i) => {
                check!(value <= 0xff, plat::Error::Size);
                nvm.nvm_set(i, value as u8)?;
            }
        }
        trace!("variable {} = {:#x}", id, value);
        Ok(())
    }

    /// Resets the manifest-volatile variables, at the end of a manifest
    /// session.
    pub fn end_manifest_session(&mut self) {
        self.mfst_volatile = [0; MFST];
    }
}
