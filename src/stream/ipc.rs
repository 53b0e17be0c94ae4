// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Streaming from a peer over IPC.
//!
//! A [`Requestor`] asks a peer for an image by URI and consumes the chunks
//! the peer sends back, in arrival order. The peer is reached through a
//! [`Transport`]; [`channel()`] provides one over a bounded in-process
//! queue, with a [`Provider`] as the peer's end.
//!
//! A stream goes through two phases:
//! - while no chunk of the current session has arrived, the image request
//!   is repeated every `requesting_period_ms`;
//! - once chunks flow, each one resets the idle timer, and the stream ends
//!   with the chunk marked `last`.
//!
//! Going `inter_chunk_timeout_ms` without a chunk, in either phase, fails
//! the stream with [`plat::Error::Timeout`].

use core::cell::Cell;
use core::convert::TryFrom;
use core::cell::RefCell;
use core::time::Duration;

use crate::hardware::Clock;
use crate::plat;
use crate::stream::Options;
use crate::stream::Sink;
use crate::stream::Source;

#[cfg(feature = "std")]
pub use host::*;

/// A chunk of image data received from the peer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Chunk<'a> {
    /// The session this chunk belongs to.
    pub session: u32,
    /// An identifier assigned by the peer, echoed back in the chunk status.
    pub id: u32,
    /// Where in the image this chunk goes.
    pub offset: u32,
    /// The chunk contents; may be empty.
    pub data: &'a [u8],
    /// Whether this is the final chunk of the image.
    pub last: bool,
}

/// The outcome of processing a chunk, reported back to the peer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChunkStatus {
    /// The chunk was written to the sink.
    Processed,
    /// The chunk was dropped, either because it did not belong to the
    /// current session or because writing it failed.
    Refused,
}

/// The requestor's view of the link to the peer.
pub trait Transport {
    /// Asks the peer to start sending the image named `uri`, tagging its
    /// chunks with `session`.
    fn request_image(&mut self, uri: &str, session: u32) -> Result<(), plat::Error>;

    /// Waits up to `timeout` for the next chunk.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    fn recv_chunk(&mut self, timeout: Duration) -> Result<Option<Chunk<'_>>, plat::Error>;

    /// Reports what happened to chunk `id` of `session`.
    fn chunk_status(
        &mut self,
        session: u32,
        id: u32,
        status: ChunkStatus,
    ) -> Result<(), plat::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn request_image(&mut self, uri: &str, session: u32) -> Result<(), plat::Error> {
        T::request_image(self, uri, session)
    }

    fn recv_chunk(&mut self, timeout: Duration) -> Result<Option<Chunk<'_>>, plat::Error> {
        T::recv_chunk(self, timeout)
    }

    fn chunk_status(
        &mut self,
        session: u32,
        id: u32,
        status: ChunkStatus,
    ) -> Result<(), plat::Error> {
        T::chunk_status(self, session, id, status)
    }
}

/// A source that streams images from a peer.
///
/// Only one stream can be in progress at a time; starting another one from
/// inside a stream (for example, from a sink) fails with
/// [`plat::Error::NoResources`].
pub struct Requestor<C, T> {
    clock: C,
    transport: RefCell<T>,
    last_session: Cell<u32>,
}

impl<C: Clock, T: Transport> Requestor<C, T> {
    /// Creates a new requestor.
    pub fn new(clock: C, transport: T) -> Self {
        Self {
            clock,
            transport: RefCell::new(transport),
            last_session: Cell::new(0),
        }
    }

    /// Tears down the requestor, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }

    fn next_session(&self) -> u32 {
        let mut id = self.last_session.get().wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        self.last_session.set(id);
        id
    }

    /// Streams the image named `uri` into `sink`.
    pub fn stream_image(
        &self,
        uri: &str,
        sink: &mut dyn Sink,
        opts: &Options,
    ) -> crate::Result<(), plat::Error> {
        check!(!uri.is_empty(), plat::Error::Inval);
        let mut transport = self
            .transport
            .try_borrow_mut()
            .map_err(|_| fail!(plat::Error::NoResources, "stream already in progress"))?;

        let session = self.next_session();
        let period = Duration::from_millis(opts.requesting_period_ms.into());
        let timeout = Duration::from_millis(opts.inter_chunk_timeout_ms.into());
        trace!("streaming {} in session {}", uri, session);

        let mut pending = true;
        let mut last_request: Option<Duration> = None;
        let mut last_response = self.clock.uptime();
        let mut position = 0u32;
        loop {
            let now = self.clock.uptime();
            let mut wait = timeout.saturating_sub(now.saturating_sub(last_response));
            if wait == Duration::ZERO {
                return Err(fail!(
                    plat::Error::Timeout,
                    "session {}: no chunk for {:?}",
                    session,
                    timeout
                ));
            }

            if pending {
                let due = last_request.map_or(true, |t| now.saturating_sub(t) >= period);
                if due {
                    transport
                        .request_image(uri, session)
                        .map_err(|e| fail!(e, "could not request {}: {:?}", uri, e))?;
                    last_request = Some(now);
                }
                let next = last_request.unwrap_or(now) + period;
                wait = wait.min(next.saturating_sub(now));
            }

            let (from, id, status, last) = {
                let chunk = match transport.recv_chunk(wait).map_err(|e| fail!(e))? {
                    Some(chunk) => chunk,
                    None => continue,
                };
                if chunk.session != session {
                    warn!(
                        "refusing chunk {} of session {} in session {}",
                        chunk.id, chunk.session, session
                    );
                    (chunk.session, chunk.id, ChunkStatus::Refused, false)
                } else {
                    pending = false;
                    last_response = self.clock.uptime();
                    match write_chunk(sink, &mut position, &chunk) {
                        Ok(()) => (session, chunk.id, ChunkStatus::Processed, chunk.last),
                        Err(e) => {
                            let id = chunk.id;
                            if let Err(e) =
                                transport.chunk_status(session, id, ChunkStatus::Refused)
                            {
                                warn!(
                                    "session {}: could not refuse chunk {}: {:?}",
                                    session,
                                    id,
                                    e
                                );
                            }
                            let code = match e {
                                plat::Error::Size | plat::Error::OutOfBounds => e,
                                _ => plat::Error::Crash,
                            };
                            return Err(fail!(
                                code,
                                "session {}: sink failed at {:#x}: {:?}",
                                session,
                                position,
                                e
                            ));
                        }
                    }
                }
            };
            transport
                .chunk_status(from, id, status)
                .map_err(|e| fail!(e))?;
            if last {
                trace!("session {} complete, {} bytes", session, position);
                return Ok(());
            }
        }
    }
}

fn write_chunk(
    sink: &mut dyn Sink,
    position: &mut u32,
    chunk: &Chunk,
) -> Result<(), plat::Error> {
    // Offsets come from the peer; the chunk must end inside the u32 range.
    let len = u32::try_from(chunk.data.len()).map_err(|_| plat::Error::Size)?;
    let end = chunk
        .offset
        .checked_add(len)
        .ok_or(plat::Error::OutOfBounds)?;

    if chunk.offset != *position {
        sink.seek(chunk.offset)?;
        *position = chunk.offset;
    }
    if len != 0 {
        sink.write(chunk.data)?;
        *position = end;
    }
    Ok(())
}

impl<C: Clock, T: Transport> Source for Requestor<C, T> {
    fn stream(
        &mut self,
        uri: &str,
        sink: &mut dyn Sink,
        opts: &Options,
    ) -> Result<(), plat::Error> {
        self.stream_image(uri, sink, opts).map_err(|e| e.into_inner())
    }
}

#[cfg(feature = "std")]
mod host {
    use std::sync::mpsc;
    use std::sync::mpsc::Receiver;
    use std::sync::mpsc::RecvTimeoutError;
    use std::sync::mpsc::Sender;
    use std::sync::mpsc::SyncSender;
    use std::sync::mpsc::TrySendError;
    use std::time::Duration;

    use super::Chunk;
    use super::ChunkStatus;
    use super::Transport;
    use crate::plat;

    /// An image request, as seen by the peer.
    #[derive(Clone, PartialEq, Eq, Debug)]
    pub struct Request {
        /// The requested image.
        pub uri: String,
        /// The session to tag chunks with.
        pub session: u32,
    }

    /// An owned [`Chunk`], as queued by the peer.
    #[derive(Clone, PartialEq, Eq, Debug)]
    pub struct OwnedChunk {
        /// See [`Chunk::session`].
        pub session: u32,
        /// See [`Chunk::id`].
        pub id: u32,
        /// See [`Chunk::offset`].
        pub offset: u32,
        /// See [`Chunk::data`].
        pub data: Vec<u8>,
        /// See [`Chunk::last`].
        pub last: bool,
    }

    impl OwnedChunk {
        /// Borrows this chunk.
        pub fn as_chunk(&self) -> Chunk<'_> {
            Chunk {
                session: self.session,
                id: self.id,
                offset: self.offset,
                data: &self.data,
                last: self.last,
            }
        }
    }

    /// A chunk status report, as seen by the peer.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct StatusReport {
        /// The session the chunk was sent in.
        pub session: u32,
        /// The chunk id.
        pub id: u32,
        /// What happened to the chunk.
        pub status: ChunkStatus,
    }

    /// Creates a transport over in-process queues.
    ///
    /// At most `capacity` chunks can be queued before the consumer picks
    /// them up.
    pub fn channel(capacity: usize) -> (ChannelTransport, Provider) {
        let (request_tx, request_rx) = mpsc::channel();
        let (chunk_tx, chunk_rx) = mpsc::sync_channel(capacity);
        let (status_tx, status_rx) = mpsc::channel();
        (
            ChannelTransport {
                requests: request_tx,
                chunks: chunk_rx,
                statuses: status_tx,
                current: None,
            },
            Provider {
                requests: request_rx,
                chunks: chunk_tx,
                statuses: status_rx,
            },
        )
    }

    /// The requestor's end of [`channel()`].
    pub struct ChannelTransport {
        requests: Sender<Request>,
        chunks: Receiver<OwnedChunk>,
        statuses: Sender<StatusReport>,
        current: Option<OwnedChunk>,
    }

    impl Transport for ChannelTransport {
        fn request_image(&mut self, uri: &str, session: u32) -> Result<(), plat::Error> {
            self.requests
                .send(Request {
                    uri: uri.to_string(),
                    session,
                })
                .map_err(|_| plat::Error::Io)
        }

        fn recv_chunk(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Chunk<'_>>, plat::Error> {
            match self.chunks.recv_timeout(timeout) {
                Ok(chunk) => {
                    let chunk = self.current.insert(chunk);
                    Ok(Some(chunk.as_chunk()))
                }
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(plat::Error::Io),
            }
        }

        fn chunk_status(
            &mut self,
            session: u32,
            id: u32,
            status: ChunkStatus,
        ) -> Result<(), plat::Error> {
            // The peer may have stopped listening; statuses are advisory.
            let _ = self.statuses.send(StatusReport {
                session,
                id,
                status,
            });
            Ok(())
        }
    }

    /// The peer's end of [`channel()`].
    pub struct Provider {
        requests: Receiver<Request>,
        chunks: SyncSender<OwnedChunk>,
        statuses: Receiver<StatusReport>,
    }

    impl Provider {
        /// Waits up to `timeout` for an image request.
        pub fn next_request(&self, timeout: Duration) -> Option<Request> {
            self.requests.recv_timeout(timeout).ok()
        }

        /// Queues `chunk` without blocking.
        ///
        /// Fails with [`plat::Error::Busy`] if the queue is full, in which
        /// case the caller should try again later.
        pub fn enqueue(&self, chunk: OwnedChunk) -> Result<(), plat::Error> {
            self.chunks.try_send(chunk).map_err(|e| match e {
                TrySendError::Full(_) => plat::Error::Busy,
                TrySendError::Disconnected(_) => plat::Error::IncorrectState,
            })
        }

        /// Serves `image` in response to `request`.
        ///
        /// Chunk sizes and the delays before each chunk cycle through
        /// `pattern`; a zero size sends an empty chunk. Blocks while the
        /// queue is full.
        pub fn fetch_request(
            &self,
            request: &Request,
            image: &[u8],
            pattern: &[(usize, Duration)],
        ) -> Result<(), plat::Error> {
            // A pattern of empty chunks would never get through the image.
            let stalls =
                !image.is_empty() && pattern.iter().all(|&(size, _)| size == 0);
            if pattern.is_empty() || stalls {
                return Err(plat::Error::Inval);
            }

            let mut offset = 0;
            let mut steps = pattern.iter().cycle();
            for id in 0.. {
                let (size, delay) = steps.next().copied().unwrap_or_default();
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                let end = image.len().min(offset + size);
                let last = end == image.len();
                let chunk = OwnedChunk {
                    session: request.session,
                    id,
                    offset: offset as u32,
                    data: image[offset..end].to_vec(),
                    last,
                };
                self.chunks
                    .send(chunk)
                    .map_err(|_| plat::Error::IncorrectState)?;
                offset = end;
                if last {
                    break;
                }
            }
            Ok(())
        }

        /// Returns the chunk status reports received so far.
        pub fn statuses(&self) -> Vec<StatusReport> {
            self.statuses.try_iter().collect()
        }
    }
}
