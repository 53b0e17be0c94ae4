// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Payload streaming.
//!
//! Payload bytes flow from a [`Source`] into a [`Sink`]. Sinks make no
//! assumptions about how bytes are chunked: a sink must produce the same
//! final state whether it is fed one byte at a time or the whole payload at
//! once. Sinks compose with [`Tee`], which is how a component write is
//! chained with digest verification.
//!
//! A [`Fetcher`] tries a list of sources in order, falling through to the
//! next one whenever a source reports [`plat::Error::NotFound`].

use crate::manifest::ComponentType;
use crate::plat;

pub mod cache;
pub mod digest;
pub mod flash;
pub mod ipc;

pub use digest::DigestPool;
pub use digest::DigestSink;
pub use digest::Match;

/// A destination for streamed bytes.
///
/// Only `write()` is required; the remaining capabilities default to no-ops,
/// or to [`plat::Error::Unsupported`] where a no-op would be wrong.
pub trait Sink {
    /// Appends `data` at the current write position.
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error>;

    /// Discards everything written so far, moving back to the start.
    fn erase(&mut self) -> Result<(), plat::Error> {
        Ok(())
    }

    /// Moves the write position to `offset`.
    fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        let _ = offset;
        Err(plat::Error::Unsupported)
    }

    /// Commits any buffered bytes.
    fn flush(&mut self) -> Result<(), plat::Error> {
        Ok(())
    }

    /// Returns how many bytes of the destination are in use.
    fn used_storage(&self) -> Result<u32, plat::Error> {
        Err(plat::Error::Unsupported)
    }
}
impl dyn Sink {} // Ensure object-safe.

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        S::write(self, data)
    }

    fn erase(&mut self) -> Result<(), plat::Error> {
        S::erase(self)
    }

    fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        S::seek(self, offset)
    }

    fn flush(&mut self) -> Result<(), plat::Error> {
        S::flush(self)
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        S::used_storage(self)
    }
}

/// A sink that forwards everything to two sinks, in order.
///
/// Capabilities are the intersection of both sinks': seeking fails unless
/// both sinks can seek. Storage usage is reported from the first sink.
pub struct Tee<A, B>(pub A, pub B);

impl<A: Sink, B: Sink> Sink for Tee<A, B> {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        self.0.write(data)?;
        self.1.write(data)
    }

    fn erase(&mut self) -> Result<(), plat::Error> {
        self.0.erase()?;
        self.1.erase()
    }

    fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        self.0.seek(offset)?;
        self.1.seek(offset)
    }

    fn flush(&mut self) -> Result<(), plat::Error> {
        self.0.flush()?;
        self.1.flush()
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        self.0.used_storage()
    }
}

/// A growable in-memory sink.
///
/// Seeking truncates or extends the buffer, padding with `0xff`, so that
/// writing always appends.
#[cfg(feature = "std")]
impl Sink for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<(), plat::Error> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), plat::Error> {
        self.clear();
        Ok(())
    }

    fn seek(&mut self, offset: u32) -> Result<(), plat::Error> {
        self.resize(offset as usize, 0xff);
        Ok(())
    }

    fn used_storage(&self) -> Result<u32, plat::Error> {
        Ok(self.len() as u32)
    }
}

/// Timing parameters for streaming from a remote peer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Options {
    /// How long a stream may go without receiving a chunk before it fails
    /// with [`plat::Error::Timeout`].
    pub inter_chunk_timeout_ms: u32,
    /// How often an image request is repeated while waiting for the first
    /// chunk.
    pub requesting_period_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            inter_chunk_timeout_ms: 5000,
            requesting_period_ms: 1000,
        }
    }
}

/// A producer of payload bytes.
pub trait Source {
    /// Returns whether this source can deliver payloads for components of
    /// type `ty`.
    fn supports(&self, ty: ComponentType) -> bool {
        let _ = ty;
        true
    }

    /// Streams the payload named `uri` into `sink`.
    ///
    /// Returns [`plat::Error::NotFound`] if this source does not have the
    /// payload, in which case nothing was written.
    fn stream(
        &mut self,
        uri: &str,
        sink: &mut dyn Sink,
        opts: &Options,
    ) -> Result<(), plat::Error>;
}

/// A source over a list of named in-memory payloads, such as the payloads
/// integrated into an envelope.
#[derive(Copy, Clone, Debug)]
pub struct Payloads<'a>(pub &'a [(&'a str, &'a [u8])]);

impl Source for Payloads<'_> {
    fn stream(
        &mut self,
        uri: &str,
        sink: &mut dyn Sink,
        _: &Options,
    ) -> Result<(), plat::Error> {
        let (_, data) = self
            .0
            .iter()
            .find(|(name, _)| *name == uri)
            .ok_or(plat::Error::NotFound)?;
        sink.write(data)
    }
}

/// An ordered list of sources.
pub struct Fetcher<'a, 'b> {
    tiers: &'a mut [&'b mut dyn Source],
}

impl<'a, 'b> Fetcher<'a, 'b> {
    /// Creates a fetcher that tries `tiers` in order.
    pub fn new(tiers: &'a mut [&'b mut dyn Source]) -> Self {
        Self { tiers }
    }

    /// Streams `uri` into `sink` from the first tier that has it.
    ///
    /// Tiers that do not support `ty` are skipped. Any failure other than
    /// [`plat::Error::NotFound`] ends the search.
    pub fn stream(
        &mut self,
        uri: &str,
        ty: ComponentType,
        sink: &mut dyn Sink,
        opts: &Options,
    ) -> crate::Result<(), plat::Error> {
        for (i, tier) in self.tiers.iter_mut().enumerate() {
            if !tier.supports(ty) {
                continue;
            }
            match tier.stream(uri, sink, opts) {
                Ok(()) => {
                    trace!("fetched {} from tier {}", uri, i);
                    return Ok(());
                }
                Err(plat::Error::NotFound) => {
                    trace!("tier {} does not have {}", i, uri);
                }
                Err(e) => {
                    return Err(fail!(e, "tier {} failed to stream {}: {:?}", i, uri, e))
                }
            }
        }
        Err(fail!(plat::Error::NotFound, "no tier has {}", uri))
    }
}
