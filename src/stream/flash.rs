// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`Sink`] writing into a flash region.

use crate::hardware::flash::Flash;
use crate::hardware::flash::Region;
use crate::plat;
use crate::storage::AlignedWriter;
use crate::stream::Sink;

/// A sink that writes sequentially into a flash region, respecting the
/// device's write alignment.
///
/// The region must be erased before the first write, either beforehand or
/// through [`Sink::erase()`]. Bytes of a trailing partial write unit are only
/// programmed on [`Sink::flush()`], so callers must flush once the payload is
/// complete.
pub struct FlashSink<'f, F: ?Sized> {
    writer: AlignedWriter<'f, F>,
}

impl<'f, F: Flash + ?Sized> FlashSink<'f, F> {
    /// Creates a sink writing into `region` of `flash`.
    pub fn new(flash: &'f mut F, region: Region) -> crate::Result<Self, plat::Error> {
        Ok(Self {
            writer: AlignedWriter::new(flash, region)?,
        })
    }

    /// Returns the region this sink writes into.
    pub fn region(&self) -> Region {
        self.writer.region()
    }
}

impl<F: Flash + ?Sized> Sink for FlashSink<'_, F> {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        self.writer.write(data).map_err(|e| e.into_inner())
    }

    fn erase(&mut self) -> Result<(), plat::Error> {
        self.writer.erase().map_err(|e| e.into_inner())
    }

    fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        self.writer.seek(offset).map_err(|e| e.into_inner())
    }

    fn flush(&mut self) -> Result<(), plat::Error> {
        self.writer.flush().map_err(|e| e.into_inner())
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        Ok(self.writer.position())
    }
}
