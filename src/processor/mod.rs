// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The SUIT command sequence processor.
//!
//! A [`Processor`] takes an envelope through the following states, recording
//! the outcome in a [`Report`] whichever way the run ends:
//! ```text
//! Start -> Authenticate -> Authorize -> (sequences...) -> Commit -> Done
//! ```
//! Command sequences are run twice. The first pass, in [`Mode::Validate`],
//! consults the [`Platform`] about every step but touches nothing; only if
//! the whole manifest validates does the second pass, in [`Mode::Execute`],
//! repeat the same steps with their side effects. Both passes go through the
//! same code, so they cannot disagree about what a manifest does.
//!
//! An update only commits the envelope to its class slot after every
//! sequence has executed; a failed update leaves the installed envelope as
//! it was.

use arrayvec::ArrayVec;
use byteorder::ByteOrder as _;
use byteorder::LE;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::hardware::flash::Flash;
use crate::manifest;
use crate::manifest::command::Command;
use crate::manifest::command::Condition;
use crate::manifest::command::Index;
use crate::manifest::command::Parameters;
use crate::manifest::command::Sequence;
use crate::manifest::command::MAX_NESTING;
use crate::manifest::command::MAX_TRY_EACH;
use crate::manifest::ComponentType;
use crate::manifest::Digest;
use crate::manifest::Envelope;
use crate::manifest::Manifest;
use crate::manifest::SequenceKind;
use crate::manifest::Uuid;
use crate::manifest::MAX_COMPONENTS;
use crate::mem::Arena;
use crate::mem::ArenaExt as _;
use crate::plat;
use crate::storage::Flag;
use crate::storage::ManifestPolicy;
use crate::storage::Storage;
use crate::stream;
use crate::stream::DigestPool;
use crate::stream::Fetcher;
use crate::stream::Match;
use crate::stream::Payloads;
use crate::stream::Sink;
use crate::stream::Source;
use crate::stream::Tee;
use crate::variables::Access;
use crate::variables::Variables;

mod platform;
mod report;

pub use platform::write_sig_structure;
pub use platform::Operation;
pub use platform::Platform;
pub use platform::Trigger;
pub use report::Outcome;
pub use report::Report;

/// The largest chunk the processor moves between components at once.
pub const MAX_COPY_CHUNK: usize = 256;

/// The sequences an update runs, in order.
pub const UPDATE_SEQUENCES: [SequenceKind; 4] = [
    SequenceKind::DependencyResolution,
    SequenceKind::PayloadFetch,
    SequenceKind::Install,
    SequenceKind::Validate,
];

/// The sequences a boot runs, in order.
pub const BOOT_SEQUENCES: [SequenceKind; 3] =
    [SequenceKind::Validate, SequenceKind::Load, SequenceKind::Invoke];

wire_enum! {
    /// A processing state.
    pub enum State: u8 {
        /// Decoding the envelope.
        Start = 0,
        /// Checking the manifest digest and signatures.
        Authenticate = 1,
        /// Checking the sequence number.
        Authorize = 2,
        /// Running the validate sequence.
        Validate = 3,
        /// Running the dependency-resolution or payload-fetch sequence.
        Fetch = 4,
        /// Running the install sequence.
        Install = 5,
        /// Running the load sequence.
        Load = 6,
        /// Running the invoke sequence.
        Invoke = 7,
        /// Storing the envelope.
        Commit = 8,
        /// The run completed.
        Done = 9,
    }
}

impl State {
    fn running(kind: SequenceKind) -> Self {
        match kind {
            SequenceKind::DependencyResolution | SequenceKind::PayloadFetch => Self::Fetch,
            SequenceKind::Install => Self::Install,
            SequenceKind::Validate => Self::Validate,
            SequenceKind::Load => Self::Load,
            SequenceKind::Invoke => Self::Invoke,
        }
    }
}

/// A processing pass.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Every step is checked with the platform, but nothing is written,
    /// fetched or invoked, and content conditions are assumed to hold.
    Validate,
    /// Every step is checked again and then performed.
    Execute,
}

/// An error returned by the processor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The envelope or a command sequence is malformed.
    Manifest(manifest::Error),
    /// A platform or storage operation failed.
    Platform(plat::Error),
    /// The manifest digest or a signature did not verify, or the manifest
    /// is unsigned and that is not allowed.
    Unauthenticated,
    /// The platform's policy refused a step.
    Denied,
    /// A condition did not hold.
    ConditionFailed(Condition),
    /// Streamed or copied contents did not match the expected digest.
    DigestMismatch,
    /// A command referred to a component that does not exist, or that does
    /// not support the command.
    BadComponent,
    /// A command needed a parameter that is not set.
    MissingParameter,
}

impl Error {
    /// Returns the [`Outcome`] this error is reported as.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Manifest(_) => Outcome::Malformed,
            Self::Platform(_) => Outcome::PlatformFailure,
            Self::Unauthenticated => Outcome::Unauthenticated,
            Self::Denied => Outcome::Denied,
            Self::ConditionFailed(_) => Outcome::ConditionFailed,
            Self::DigestMismatch => Outcome::DigestMismatch,
            Self::BadComponent => Outcome::BadComponent,
            Self::MissingParameter => Outcome::MissingParameter,
        }
    }
}

impl From<manifest::Error> for Error {
    fn from(e: manifest::Error) -> Self {
        Self::Manifest(e)
    }
}

impl From<plat::Error> for Error {
    fn from(e: plat::Error) -> Self {
        Self::Platform(e)
    }
}

debug_from!(Error => manifest::Error, plat::Error);

/// Processor configuration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Options {
    /// The report slot runs are recorded in.
    pub report_slot: usize,
    /// How many bytes are moved at once when copying or hashing a
    /// component; clamped to [`MAX_COPY_CHUNK`].
    pub copy_chunk_len: usize,
    /// Timing for streaming payloads from remote sources.
    pub stream: stream::Options,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            report_slot: 0,
            copy_chunk_len: 64,
            stream: stream::Options::default(),
        }
    }
}

/// What a manifest component resolved to.
#[derive(Copy, Clone, Debug)]
enum Target<H> {
    Component(H),
    Variable(u32),
}

/// The state of one pass over a manifest.
struct Session<'e, H> {
    class_id: Uuid,
    mode: Mode,
    manifest: &'e Manifest<'e>,
    payloads: &'e [(&'e str, &'e [u8])],
    targets: ArrayVec<Target<H>, MAX_COMPONENTS>,
    params: ArrayVec<Parameters<'e>, MAX_COMPONENTS>,
    /// A bitset of selected components.
    selected: u32,
}

impl<'e, H: Copy> Session<'e, H> {
    fn select(&mut self, index: &Index) -> crate::Result<(), Error> {
        let len = self.targets.len();
        self.selected = match index {
            Index::All => (1 << len) - 1,
            Index::List(list) => {
                let mut mask = 0;
                for &i in list {
                    check!((i as usize) < len, Error::BadComponent);
                    mask |= 1 << i;
                }
                mask
            }
        };
        Ok(())
    }

    fn source(&self, target: usize) -> crate::Result<(H, H), Error> {
        let source = self.params[target]
            .source_component
            .ok_or_else(|| fail!(Error::MissingParameter))? as usize;
        check!(
            source < self.targets.len() && source != target,
            Error::BadComponent
        );
        match (self.targets[target], self.targets[source]) {
            (Target::Component(t), Target::Component(s)) => Ok((t, s)),
            _ => Err(fail!(Error::BadComponent)),
        }
    }

    fn component(&self, index: usize) -> crate::Result<H, Error> {
        match self.targets[index] {
            Target::Component(h) => Ok(h),
            Target::Variable(_) => Err(fail!(Error::BadComponent)),
        }
    }
}

/// Iterates over the indices set in `mask`, below `len`.
fn indices(mask: u32, len: usize) -> impl Iterator<Item = usize> {
    (0..len).filter(move |i| mask & (1 << i) != 0)
}

fn platform_error(e: plat::Error) -> crate::Error<Error> {
    fail!(Error::Platform(e))
}

/// Streams `uri` into `sink`, from the envelope's integrated payloads if it
/// is there and from `fetcher` otherwise.
fn stream_payload(
    payloads: &[(&str, &[u8])],
    fetcher: &mut Fetcher,
    uri: &str,
    ty: ComponentType,
    sink: &mut dyn Sink,
    opts: &stream::Options,
) -> crate::Result<(), Error> {
    match Payloads(payloads).stream(uri, sink, opts) {
        Ok(()) => return Ok(()),
        Err(plat::Error::NotFound) => {}
        Err(e) => return Err(platform_error(e)),
    }
    fetcher.stream(uri, ty, sink, opts)?;
    Ok(())
}

/// Reads `source` from the start, in chunks of `chunk` bytes, feeding each
/// chunk to `write` along with the platform.
///
/// Stops after `size` bytes, or at the end of the component if `size` is
/// unset. Returns the number of bytes read.
fn pump<P: Platform>(
    platform: &mut P,
    source: P::Handle,
    size: Option<u32>,
    chunk: usize,
    mut write: impl FnMut(&mut P, &[u8]) -> crate::Result<(), Error>,
) -> crate::Result<u32, Error> {
    let mut buf = [0; MAX_COPY_CHUNK];
    let chunk = chunk.max(1).min(buf.len());
    let mut offset = 0u32;
    loop {
        let want = match size {
            Some(size) => chunk.min((size - offset) as usize),
            None => chunk,
        };
        if want == 0 {
            break;
        }
        let n = platform
            .read(source, offset, &mut buf[..want])
            .map_err(platform_error)?;
        check!(n <= want, Error::Platform(plat::Error::Crash));
        if n == 0 {
            break;
        }
        write(platform, &buf[..n])?;
        offset += n as u32;
    }
    Ok(offset)
}

/// A command sequence processor.
///
/// The processor owns everything a run touches: the [`Platform`], the
/// [`Storage`] for installed envelopes, reports and boot flags, the manifest
/// [`Variables`], and the [`DigestPool`] used for every digest check.
pub struct Processor<'s, P, F, H, E, const N: usize, const VP: usize, const VM: usize> {
    platform: P,
    storage: Storage<'s, F, H>,
    variables: Variables<VP, VM>,
    digests: DigestPool<E, N>,
    opts: Options,
}

impl<'s, P, F, H, E, const N: usize, const VP: usize, const VM: usize>
    Processor<'s, P, F, H, E, N, VP, VM>
where
    P: Platform,
    F: Flash,
    H: hash::Engine,
    E: hash::Engine,
{
    /// Creates a new processor.
    pub fn new(
        platform: P,
        storage: Storage<'s, F, H>,
        variables: Variables<VP, VM>,
        digests: DigestPool<E, N>,
        opts: Options,
    ) -> Self {
        Self {
            platform,
            storage,
            variables,
            digests,
            opts,
        }
    }

    /// Returns the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the platform, mutably.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Returns the storage handle.
    pub fn storage(&self) -> &Storage<'s, F, H> {
        &self.storage
    }

    /// Returns the storage handle, mutably.
    pub fn storage_mut(&mut self) -> &mut Storage<'s, F, H> {
        &mut self.storage
    }

    /// Returns the manifest variables.
    pub fn variables(&self) -> &Variables<VP, VM> {
        &self.variables
    }

    /// Installs the envelope in `bytes`.
    ///
    /// Payloads not integrated into the envelope are fetched from `sources`,
    /// in order. `arena` is used to read the currently installed envelope
    /// of the same class.
    ///
    /// The envelope is stored in its class slot only if every sequence
    /// succeeds; either way, the outcome is recorded in the report slot.
    pub fn update(
        &mut self,
        bytes: &[u8],
        sources: &mut [&mut dyn Source],
        arena: &dyn Arena,
    ) -> crate::Result<(), Error> {
        let mut report = Report::start();
        let mut fetcher = Fetcher::new(sources);
        let result = self.run_update(bytes, &mut fetcher, arena, &mut report);
        let saved = self.finish(&mut report, &result);
        result?;
        saved
    }

    fn run_update(
        &mut self,
        bytes: &[u8],
        fetcher: &mut Fetcher,
        arena: &dyn Arena,
        report: &mut Report,
    ) -> crate::Result<(), Error> {
        let envelope = self.authorize_update(bytes, arena, report)?;
        let class_id = report.class_id;
        for mode in [Mode::Validate, Mode::Execute] {
            report.mode = mode;
            self.run_pass(&envelope, class_id, mode, &UPDATE_SEQUENCES, fetcher, report)?;
        }

        report.state = State::Commit;
        self.storage.install_envelope(&class_id, bytes)?;
        report.state = State::Done;
        Ok(())
    }

    /// Checks whether [`Processor::update()`] would accept the envelope in
    /// `bytes`, without touching any component or persistent storage.
    ///
    /// This authenticates and authorizes the envelope and runs the update
    /// sequences in [`Mode::Validate`]. No report is written.
    pub fn check_update(
        &mut self,
        bytes: &[u8],
        arena: &dyn Arena,
    ) -> crate::Result<(), Error> {
        let mut report = Report::start();
        let envelope = self.authorize_update(bytes, arena, &mut report)?;
        let class_id = report.class_id;
        self.run_pass(
            &envelope,
            class_id,
            Mode::Validate,
            &UPDATE_SEQUENCES,
            &mut Fetcher::new(&mut []),
            &mut report,
        )
    }

    /// Decodes, authenticates and authorizes an update envelope.
    fn authorize_update<'e>(
        &mut self,
        bytes: &'e [u8],
        arena: &dyn Arena,
        report: &mut Report,
    ) -> crate::Result<Envelope<'e>, Error> {
        let envelope = Envelope::parse(bytes)?;
        let manifest = &envelope.manifest;
        report.sequence_number = manifest.sequence_number;
        let class_id = manifest.class_id().ok_or_else(|| {
            fail!(Error::Manifest(manifest::WRONG_SHAPE), "manifest has no class id")
        })?;
        report.class_id = class_id;
        info!(
            "update: class {}, sequence number {}",
            class_id, manifest.sequence_number
        );

        report.state = State::Authenticate;
        let policy = self.storage.manifest_slot(&class_id)?.policy;
        self.authenticate(&envelope, &class_id, &policy, Trigger::Update)?;

        report.state = State::Authorize;
        let installed = self.installed_sequence_number(&class_id, arena)?;
        self.platform
            .authorize_sequence_number(
                &class_id,
                &policy,
                manifest.sequence_number,
                installed,
            )
            .map_err(|e| {
                fail!(
                    Error::Denied,
                    "sequence number {} refused (installed: {:?}): {:?}",
                    manifest.sequence_number,
                    installed,
                    e
                )
            })?;
        Ok(envelope)
    }

    /// Boots the installed envelope of `class_id`.
    ///
    /// `arena` must have room for two copies of the envelope. On failure, the
    /// recovery flag is set, so that the next boot enters recovery mode.
    pub fn boot(&mut self, class_id: &Uuid, arena: &dyn Arena) -> crate::Result<(), Error> {
        let mut report = Report::start();
        report.class_id = *class_id;
        let result = self.run_boot(class_id, arena, &mut report);
        if result.is_err() {
            if let Err(e) = self.storage.flags_set(Flag::Recovery) {
                error!("could not request recovery: {:?}", e);
            }
        }
        let saved = self.finish(&mut report, &result);
        result?;
        saved
    }

    fn run_boot(
        &mut self,
        class_id: &Uuid,
        arena: &dyn Arena,
        report: &mut Report,
    ) -> crate::Result<(), Error> {
        let policy = self.storage.manifest_slot(class_id)?.policy;

        // Runs need `&mut self.storage`, so the envelope cannot stay borrowed
        // from it.
        let stored = self.storage.installed_envelope(class_id, arena)?;
        let bytes = arena
            .alloc_slice::<u8>(stored.len())
            .map_err(|e| platform_error(e.into()))?;
        bytes.copy_from_slice(stored);
        let bytes = &*bytes;

        let envelope = Envelope::parse(bytes)?;
        report.sequence_number = envelope.manifest.sequence_number;
        check!(
            envelope.manifest.class_id() == Some(*class_id),
            Error::Denied
        );
        info!(
            "boot: class {}, sequence number {}",
            class_id, envelope.manifest.sequence_number
        );

        report.state = State::Authenticate;
        self.authenticate(&envelope, class_id, &policy, Trigger::Boot)?;

        let mut none: [&mut dyn Source; 0] = [];
        let mut fetcher = Fetcher::new(&mut none);
        for mode in [Mode::Validate, Mode::Execute] {
            report.mode = mode;
            self.run_pass(&envelope, *class_id, mode, &BOOT_SEQUENCES, &mut fetcher, report)?;
        }
        report.state = State::Done;
        Ok(())
    }

    /// Reads back the report of the last run.
    pub fn last_report(&self, arena: &dyn Arena) -> crate::Result<Report, Error> {
        let bytes = self.storage.report_read(self.opts.report_slot, arena)?;
        Report::decode(bytes)
            .ok_or_else(|| fail!(Error::Platform(plat::Error::NotFound)))
    }

    /// Ends a run: drops manifest-session state and records `result`.
    fn finish(
        &mut self,
        report: &mut Report,
        result: &crate::Result<(), Error>,
    ) -> crate::Result<(), Error> {
        self.variables.end_manifest_session();
        match result {
            Ok(()) => {
                report.outcome = Outcome::Success;
                info!("run completed for {}", report.class_id);
            }
            Err(e) => {
                report.outcome = e.as_ref().outcome();
                warn!(
                    "run failed in {} ({:?}, {:?}): {:?}",
                    report.state,
                    report.mode,
                    report.sequence,
                    e.as_ref()
                );
            }
        }
        self.storage.report_save(self.opts.report_slot, &report.encode())?;
        Ok(())
    }

    fn installed_sequence_number(
        &self,
        class_id: &Uuid,
        arena: &dyn Arena,
    ) -> crate::Result<Option<u32>, Error> {
        let bytes = match self.storage.installed_envelope(class_id, arena) {
            Ok(bytes) => bytes,
            Err(e) if *e.as_ref() == plat::Error::NotFound => return Ok(None),
            Err(e) => return Err(e.cast()),
        };
        match Envelope::parse(bytes) {
            Ok(installed) => Ok(Some(installed.manifest.sequence_number)),
            Err(e) => {
                warn!("installed envelope of {} is corrupt: {:?}", class_id, e);
                Ok(None)
            }
        }
    }

    fn authenticate(
        &mut self,
        envelope: &Envelope,
        class_id: &Uuid,
        policy: &ManifestPolicy,
        trigger: Trigger,
    ) -> crate::Result<(), Error> {
        let digest = envelope.digest;
        let mut sink = self.digests.get(digest.algo, digest.bytes)?;
        sink.write(&envelope.manifest_header())
            .and_then(|()| sink.write(envelope.manifest_bytes))
            .map_err(platform_error)?;
        let matched = sink.digest_match()?;
        sink.release();
        check!(matched == Match::Match, Error::Unauthenticated);

        if envelope.signatures.is_empty() {
            self.platform
                .authorize_unsigned_manifest(class_id, policy, trigger)
                .map_err(|e| {
                    fail!(Error::Unauthenticated, "unsigned manifest refused: {:?}", e)
                })?;
        }
        for (i, sig) in envelope.signatures.iter().enumerate() {
            self.platform
                .authenticate(class_id, sig, envelope.digest_bytes)
                .map_err(|e| {
                    fail!(Error::Unauthenticated, "signature {} refused: {:?}", i, e)
                })?;
        }
        Ok(())
    }

    /// Runs `kinds` in one mode, with freshly acquired components.
    fn run_pass<'e>(
        &mut self,
        envelope: &'e Envelope<'e>,
        class_id: Uuid,
        mode: Mode,
        kinds: &[SequenceKind],
        fetcher: &mut Fetcher,
        report: &mut Report,
    ) -> crate::Result<(), Error> {
        let mut session = Session {
            class_id,
            mode,
            manifest: &envelope.manifest,
            payloads: envelope.payloads(),
            targets: ArrayVec::new(),
            params: ArrayVec::new(),
            selected: 0,
        };

        let result = self
            .acquire_all(&mut session)
            .and_then(|()| self.run_sequences(&mut session, kinds, fetcher, report));
        for target in &session.targets {
            if let Target::Component(h) = *target {
                self.platform.release(h);
            }
        }
        result
    }

    fn acquire_all(&mut self, session: &mut Session<P::Handle>) -> crate::Result<(), Error> {
        let manifest = session.manifest;
        for id in &manifest.components {
            self.platform
                .authorize_component(&session.class_id, id)
                .map_err(|e| fail!(Error::Denied, "component {:?} refused: {:?}", id, e))?;

            let target = match id.ty {
                ComponentType::MfstVar => Target::Variable(
                    id.part_u32(0).ok_or_else(|| fail!(Error::BadComponent))?,
                ),
                _ => Target::Component(self.platform.acquire(id).map_err(platform_error)?),
            };
            // Both have room for every component a manifest can declare.
            session.targets.push(target);
            session.params.push(Parameters::default());
        }
        Ok(())
    }

    fn run_sequences<'e>(
        &mut self,
        session: &mut Session<'e, P::Handle>,
        kinds: &[SequenceKind],
        fetcher: &mut Fetcher,
        report: &mut Report,
    ) -> crate::Result<(), Error> {
        for &kind in kinds {
            let seq = match session.manifest.sequence(kind) {
                Some(seq) => seq,
                None => continue,
            };
            report.state = State::running(kind);
            report.sequence = Some(kind);
            trace!("running {} ({:?})", kind, session.mode);

            session.selected = if session.targets.is_empty() { 0 } else { 1 };
            if let Some(shared) = session.manifest.shared {
                self.run_sequence(session, shared, fetcher, 0)?;
            }
            self.run_sequence(session, seq, fetcher, 0)?;
        }
        report.sequence = None;
        Ok(())
    }

    fn run_sequence<'e>(
        &mut self,
        session: &mut Session<'e, P::Handle>,
        bytes: &'e [u8],
        fetcher: &mut Fetcher,
        depth: usize,
    ) -> crate::Result<(), Error> {
        check!(
            depth < MAX_NESTING,
            Error::Manifest(manifest::Error::CapacityExceeded)
        );
        for cmd in Sequence::new(bytes).map_err(|e| fail!(Error::Manifest(e)))? {
            let cmd = cmd.map_err(|e| fail!(Error::Manifest(e)))?;
            self.run_command(session, cmd, fetcher, depth)?;
        }
        Ok(())
    }

    fn run_command<'e>(
        &mut self,
        session: &mut Session<'e, P::Handle>,
        cmd: Command<'e>,
        fetcher: &mut Fetcher,
        depth: usize,
    ) -> crate::Result<(), Error> {
        let selected = indices(session.selected, session.targets.len());
        match cmd {
            Command::SetComponentIndex(index) => session.select(&index)?,
            Command::OverrideParameters(params) => {
                for i in selected {
                    session.params[i].apply(&params);
                }
            }
            Command::Condition(Condition::Abort) => {
                return Err(fail!(Error::ConditionFailed(Condition::Abort)));
            }
            Command::Condition(cond) => {
                for i in selected {
                    if !self.condition(session, cond, i)? {
                        return Err(fail!(
                            Error::ConditionFailed(cond),
                            "{} failed for component {}",
                            cond,
                            i
                        ));
                    }
                }
            }
            Command::TryEach(options) => self.try_each(session, &options, fetcher, depth)?,
            Command::RunSequence(seq) => {
                let saved = session.selected;
                self.run_sequence(session, seq, fetcher, depth + 1)?;
                session.selected = saved;
            }
            Command::Write => {
                for i in selected {
                    self.write(session, i)?;
                }
            }
            Command::Fetch => {
                for i in selected {
                    self.fetch(session, i, fetcher)?;
                }
            }
            Command::Copy => {
                for i in selected {
                    self.copy(session, i)?;
                }
            }
            Command::Swap => {
                for i in selected {
                    let (target, source) = session.source(i)?;
                    self.authorize(target, Operation::Swap)?;
                    self.authorize(source, Operation::Swap)?;
                    if session.mode == Mode::Execute {
                        self.platform.swap(target, source).map_err(platform_error)?;
                    }
                }
            }
            Command::Invoke => {
                for i in selected {
                    let h = session.component(i)?;
                    self.authorize(h, Operation::Invoke)?;
                    if session.mode == Mode::Execute {
                        info!("invoking component {}", i);
                        self.platform.invoke(h).map_err(platform_error)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn authorize(&mut self, h: P::Handle, op: Operation) -> crate::Result<(), Error> {
        self.platform
            .check_operation(h, op)
            .map_err(|e| fail!(Error::Denied, "{:?} on {:?} refused: {:?}", op, h, e))
    }

    /// Runs each alternative until one gets through without a failed
    /// condition. Parameters and selection set by a failed alternative are
    /// rolled back.
    fn try_each<'e>(
        &mut self,
        session: &mut Session<'e, P::Handle>,
        options: &ArrayVec<Option<&'e [u8]>, MAX_TRY_EACH>,
        fetcher: &mut Fetcher,
        depth: usize,
    ) -> crate::Result<(), Error> {
        let params = session.params.clone();
        let selected = session.selected;

        let mut last = None;
        for option in options.iter().copied() {
            let seq = match option {
                Some(seq) => seq,
                None => return Ok(()),
            };
            match self.run_sequence(session, seq, fetcher, depth + 1) {
                Ok(()) => return Ok(()),
                Err(e) if matches!(e.as_ref(), Error::ConditionFailed(_)) => {
                    trace!("try-each alternative failed: {:?}", e);
                    session.params = params.clone();
                    session.selected = selected;
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| fail!(Error::ConditionFailed(Condition::Abort))))
    }

    /// Evaluates `cond` for component `i`.
    ///
    /// In [`Mode::Validate`], conditions on contents only check that the
    /// component may be read; earlier steps that would change the contents
    /// have not run.
    fn condition(
        &mut self,
        session: &Session<P::Handle>,
        cond: Condition,
        i: usize,
    ) -> crate::Result<bool, Error> {
        let params = &session.params[i];
        let missing = || fail!(Error::MissingParameter, "{} needs a parameter", cond);
        let validating = session.mode == Mode::Validate;

        if let Target::Variable(id) = session.targets[i] {
            check!(cond == Condition::CheckContent, Error::BadComponent);
            let content = params.content.ok_or_else(missing)?;
            let access = self.variables.get_access_mask(id)?;
            check!(access.contains(Access::Read), Error::Denied);
            if validating {
                return Ok(true);
            }
            let value = self.variables.get(&mut self.storage, id)?;
            return Ok(content == &value.to_le_bytes()[..]);
        }

        let h = session.component(i)?;
        let holds = match cond {
            Condition::VendorIdentifier => {
                let id = params.vendor_id.ok_or_else(missing)?;
                self.platform.check_vendor_id(h, &id)
            }
            Condition::ClassIdentifier => {
                let id = params.class_id.ok_or_else(missing)?;
                self.platform.check_class_id(h, &id)
            }
            Condition::DeviceIdentifier => {
                let id = params.device_id.ok_or_else(missing)?;
                self.platform.check_device_id(&id)
            }
            Condition::ComponentSlot => {
                let slot = params.component_slot.ok_or_else(missing)?;
                self.platform.check_slot(h, slot)
            }
            Condition::CheckContent => {
                let content = params.content.ok_or_else(missing)?;
                self.authorize(h, Operation::Read)?;
                if validating {
                    return Ok(true);
                }
                self.platform.check_content(h, content)
            }
            Condition::ImageMatch => {
                let digest = params.image_digest.ok_or_else(missing)?;
                self.authorize(h, Operation::Read)?;
                if validating {
                    return Ok(true);
                }
                return self.image_match(h, digest, params.image_size);
            }
            Condition::Abort => Ok(false),
        };
        holds.map_err(platform_error)
    }

    fn image_match(
        &mut self,
        h: P::Handle,
        digest: Digest,
        size: Option<u32>,
    ) -> crate::Result<bool, Error> {
        let mut sink = self.digests.get(digest.algo, digest.bytes)?;
        let read = pump(
            &mut self.platform,
            h,
            size,
            self.opts.copy_chunk_len,
            |_, data| sink.write(data).map_err(platform_error),
        )?;
        if size.map_or(false, |size| read != size) {
            return Ok(false);
        }
        Ok(sink.digest_match()? == Match::Match)
    }

    fn write(&mut self, session: &Session<P::Handle>, i: usize) -> crate::Result<(), Error> {
        let content = session.params[i]
            .content
            .ok_or_else(|| fail!(Error::MissingParameter))?;

        let h = match session.targets[i] {
            Target::Component(h) => h,
            Target::Variable(id) => {
                check!(content.len() == 4, Error::Platform(plat::Error::Size));
                let access = self.variables.get_access_mask(id)?;
                check!(access.contains(Access::Write), Error::Denied);
                if session.mode == Mode::Execute {
                    self.variables
                        .set(&mut self.storage, id, LE::read_u32(content))?;
                }
                return Ok(());
            }
        };

        self.authorize(h, Operation::Write)?;
        if session.mode == Mode::Execute {
            let sink = self.platform.sink(h).map_err(platform_error)?;
            sink.erase()
                .and_then(|()| sink.write(content))
                .and_then(|()| sink.flush())
                .map_err(platform_error)?;
        }
        Ok(())
    }

    fn fetch(
        &mut self,
        session: &Session<P::Handle>,
        i: usize,
        fetcher: &mut Fetcher,
    ) -> crate::Result<(), Error> {
        let params = &session.params[i];
        let uri = params.uri.ok_or_else(|| fail!(Error::MissingParameter))?;
        let h = session.component(i)?;
        self.authorize(h, Operation::Fetch)?;
        if session.mode == Mode::Validate {
            return Ok(());
        }

        let ty = session.manifest.components[i].ty;
        let digests = &self.digests;
        let mut check = params
            .image_digest
            .map(|d| digests.get(d.algo, d.bytes))
            .transpose()?;
        let sink = self.platform.sink(h).map_err(platform_error)?;
        sink.erase().map_err(platform_error)?;
        match &mut check {
            Some(digest) => stream_payload(
                session.payloads,
                fetcher,
                uri,
                ty,
                &mut Tee(&mut *sink, digest),
                &self.opts.stream,
            )?,
            None => stream_payload(
                session.payloads,
                fetcher,
                uri,
                ty,
                sink,
                &self.opts.stream,
            )?,
        }
        sink.flush().map_err(platform_error)?;

        if let Some(mut digest) = check {
            check!(
                digest.digest_match()? == Match::Match,
                Error::DigestMismatch
            );
        }
        Ok(())
    }

    fn copy(&mut self, session: &Session<P::Handle>, i: usize) -> crate::Result<(), Error> {
        let (target, source) = session.source(i)?;
        self.authorize(source, Operation::Read)?;
        self.authorize(target, Operation::Copy)?;
        if session.mode == Mode::Validate {
            return Ok(());
        }

        let params = &session.params[i];
        let digests = &self.digests;
        let mut check = params
            .image_digest
            .map(|d| digests.get(d.algo, d.bytes))
            .transpose()?;
        self.platform
            .sink(target)
            .and_then(|sink| sink.erase())
            .map_err(platform_error)?;
        let copied = pump(
            &mut self.platform,
            source,
            params.image_size,
            self.opts.copy_chunk_len,
            |platform, data| {
                platform
                    .sink(target)
                    .and_then(|sink| sink.write(data))
                    .map_err(platform_error)?;
                if let Some(digest) = &mut check {
                    digest.write(data).map_err(platform_error)?;
                }
                Ok(())
            },
        )?;
        if let Some(size) = params.image_size {
            check!(copied == size, Error::Platform(plat::Error::Size));
        }
        self.platform
            .sink(target)
            .and_then(|sink| sink.flush())
            .map_err(platform_error)?;

        if let Some(mut digest) = check {
            check!(
                digest.digest_match()? == Match::Match,
                Error::DigestMismatch
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use testutil::data::payload;

    use crate::crypto::ring;
    use crate::manifest::testdata;
    use crate::manifest::testdata::EnvelopeBuilder;
    use crate::manifest::testdata::ManifestBuilder;
    use crate::manifest::ComponentId;
    use crate::manifest::Sign1;
    use crate::mem::BumpArena;
    use crate::mem::OutOfMemory;
    use crate::storage::test::TestFlash;
    use crate::storage::test::CLASS_APP;
    use crate::storage::test::CLASS_ROOT;
    use crate::variables::test::TestVariables;

    type Key = (ComponentType, u32);

    /// A platform backed by a map of in-memory components.
    #[derive(Default)]
    struct FakePlatform {
        memory: HashMap<Key, Vec<u8>>,
        outstanding: usize,
        invoked: Vec<Key>,
        forbidden: Option<ComponentType>,
        denied: Option<Operation>,
    }

    impl Platform for FakePlatform {
        type Handle = Key;

        fn authenticate(
            &mut self,
            _: &Uuid,
            signature: &Sign1,
            _: &[u8],
        ) -> Result<(), plat::Error> {
            if signature.signature == b"good" {
                Ok(())
            } else {
                Err(plat::Error::Authentication)
            }
        }

        fn authorize_component(
            &mut self,
            _: &Uuid,
            id: &ComponentId,
        ) -> Result<(), plat::Error> {
            if Some(id.ty) == self.forbidden {
                return Err(plat::Error::Authentication);
            }
            Ok(())
        }

        fn check_vendor_id(&mut self, _: Key, id: &Uuid) -> Result<bool, plat::Error> {
            Ok(*id == testdata::VENDOR_ID)
        }

        fn check_class_id(&mut self, _: Key, id: &Uuid) -> Result<bool, plat::Error> {
            Ok(*id == CLASS_ROOT)
        }

        fn check_operation(&mut self, _: Key, op: Operation) -> Result<(), plat::Error> {
            if Some(op) == self.denied {
                return Err(plat::Error::Authentication);
            }
            Ok(())
        }

        fn acquire(&mut self, id: &ComponentId) -> Result<Key, plat::Error> {
            let index = match id.ty {
                ComponentType::Mem => id.part_u32(1),
                _ => id.part_u32(0),
            };
            let key = (id.ty, index.ok_or(plat::Error::Inval)?);
            self.outstanding += 1;
            Ok(key)
        }

        fn release(&mut self, _: Key) {
            self.outstanding -= 1;
        }

        fn sink(&mut self, h: Key) -> Result<&mut dyn Sink, plat::Error> {
            Ok(self.memory.entry(h).or_default())
        }

        fn read(
            &mut self,
            h: Key,
            offset: u32,
            out: &mut [u8],
        ) -> Result<usize, plat::Error> {
            let data = self.memory.get(&h).map(Vec::as_slice).unwrap_or(&[]);
            let rest = data.get(offset as usize..).unwrap_or(&[]);
            let n = rest.len().min(out.len());
            out[..n].copy_from_slice(&rest[..n]);
            Ok(n)
        }

        fn swap(&mut self, target: Key, source: Key) -> Result<(), plat::Error> {
            let t = self.memory.remove(&target).unwrap_or_default();
            let s = self.memory.remove(&source).unwrap_or_default();
            self.memory.insert(target, s);
            self.memory.insert(source, t);
            Ok(())
        }

        fn invoke(&mut self, h: Key) -> Result<(), plat::Error> {
            self.invoked.push(h);
            Ok(())
        }
    }

    type TestProcessor = Processor<
        'static,
        FakePlatform,
        TestFlash,
        ring::hash::Engine,
        ring::hash::Engine,
        2,
        4,
        4,
    >;

    fn processor() -> TestProcessor {
        Processor::new(
            FakePlatform::default(),
            crate::storage::test::storage(),
            TestVariables::new(crate::variables::test::CONFIG).unwrap(),
            DigestPool::new([ring::hash::Engine::new(), ring::hash::Engine::new()]),
            Options {
                report_slot: 1,
                copy_chunk_len: 7,
                ..Options::default()
            },
        )
    }

    const IMAGE_LEN: usize = 300;
    const STAGING: Key = (ComponentType::CandImg, 0);
    const EXEC: Key = (ComponentType::Mem, 0x8000);

    fn image() -> Vec<u8> {
        payload::image(1, IMAGE_LEN)
    }

    fn sha256(data: &[u8]) -> [u8; 32] {
        let mut out = [0; 32];
        out.copy_from_slice(::ring::digest::digest(&::ring::digest::SHA256, data).as_ref());
        out
    }

    /// A staging component and an executable component.
    fn components() -> Vec<Vec<u8>> {
        vec![
            testdata::indexed_component("CAND_IMG", 0),
            testdata::mem_component(0, 0x8000, 0x1000),
        ]
    }

    /// A manifest that fetches `#app` into staging, copies it into place, and
    /// checks and boots it.
    fn update_manifest(sequence_number: u32) -> ManifestBuilder {
        let digest = sha256(&image());
        let vendor = testdata::VENDOR_ID.0;
        ManifestBuilder::new()
            .sequence_number(sequence_number)
            .components(components())
            .shared(raw_cbor!(4 [
                0:12, h"f5",
                0:20, 5 [
                    0:1 2 { vendor },
                    0:3 2 { 4 [1:15, 2 { digest }] },
                    0:14 0:(IMAGE_LEN as u64),
                ],
                0:1, 0:15,
            ]))
            .sequence(
                SequenceKind::PayloadFetch,
                raw_cbor!(4 [
                    0:12, 0:0,
                    0:20, 5 [0:21 t"#app"],
                    0:21, 0:15,
                ]),
            )
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:1,
                    0:20, 5 [0:22 0:0],
                    0:22, 0:15,
                ]),
            )
            .sequence(
                SequenceKind::Validate,
                raw_cbor!(4 [0:12, 0:1, 0:3, 0:15]),
            )
            .sequence(SequenceKind::Invoke, raw_cbor!(4 [0:12, 0:1, 0:23, 0:15]))
    }

    fn signed(manifest: &ManifestBuilder) -> Vec<u8> {
        let manifest = manifest.build();
        EnvelopeBuilder::new(&manifest)
            .sign(b"key", b"good")
            .payload("#app", &image())
            .build()
    }

    fn update(p: &mut TestProcessor, envelope: &[u8]) -> Result<(), Error> {
        p.update(envelope, &mut [], &OutOfMemory)
            .map_err(|e| e.into_inner())
    }

    fn report(p: &TestProcessor) -> Report {
        p.last_report(&OutOfMemory).unwrap()
    }

    #[test]
    fn installs_and_boots() {
        let mut p = processor();
        assert_eq!(
            p.last_report(&OutOfMemory).unwrap_err().into_inner(),
            Error::Platform(plat::Error::NotFound)
        );

        let envelope = signed(&update_manifest(1));
        update(&mut p, &envelope).unwrap();
        assert_eq!(p.platform().memory[&STAGING], image());
        assert_eq!(p.platform().memory[&EXEC], image());
        assert_eq!(p.platform().outstanding, 0);
        assert!(p.platform().invoked.is_empty());
        assert_eq!(
            p.storage().installed_envelope(&CLASS_ROOT, &OutOfMemory).unwrap(),
            &envelope[..]
        );
        assert_eq!(
            report(&p),
            Report {
                outcome: Outcome::Success,
                state: State::Done,
                mode: Mode::Execute,
                sequence: None,
                class_id: CLASS_ROOT,
                sequence_number: 1,
            }
        );

        let mut buf = vec![0; 0x800];
        let arena = BumpArena::new(&mut buf);
        p.boot(&CLASS_ROOT, &arena).unwrap();
        assert_eq!(p.platform().invoked, vec![EXEC]);
        assert_eq!(p.platform().outstanding, 0);
        assert_eq!(report(&p).outcome, Outcome::Success);
        assert!(p.storage().flags_check(Flag::Recovery).is_err());
    }

    #[test]
    fn unsigned_manifests_are_refused() {
        let mut p = processor();
        let manifest = update_manifest(1).build();
        let envelope = EnvelopeBuilder::new(&manifest)
            .payload("#app", &image())
            .build();
        assert_eq!(update(&mut p, &envelope), Err(Error::Unauthenticated));
        assert!(p.platform().memory.is_empty());
        assert!(p
            .storage()
            .installed_envelope(&CLASS_ROOT, &OutOfMemory)
            .is_err());

        let r = report(&p);
        assert_eq!(r.outcome, Outcome::Unauthenticated);
        assert_eq!(r.state, State::Authenticate);
        assert_eq!(r.class_id, CLASS_ROOT);
    }

    #[test]
    fn bad_signatures_and_digests() {
        let mut p = processor();
        let manifest = update_manifest(1).build();

        let forged = EnvelopeBuilder::new(&manifest).sign(b"key", b"bad").build();
        assert_eq!(update(&mut p, &forged), Err(Error::Unauthenticated));

        let wrong_digest = EnvelopeBuilder::new(&manifest)
            .digest([0; 32])
            .sign(b"key", b"good")
            .build();
        assert_eq!(update(&mut p, &wrong_digest), Err(Error::Unauthenticated));

        let garbage = [0x82, 0x01];
        assert!(matches!(update(&mut p, &garbage), Err(Error::Manifest(_))));
        assert_eq!(report(&p).outcome, Outcome::Malformed);
        assert_eq!(report(&p).state, State::Start);
    }

    #[test]
    fn sequence_numbers_only_go_forward() {
        let mut p = processor();
        update(&mut p, &signed(&update_manifest(2))).unwrap();

        for old in [1, 2] {
            assert_eq!(
                update(&mut p, &signed(&update_manifest(old))),
                Err(Error::Denied)
            );
            let r = report(&p);
            assert_eq!(r.state, State::Authorize);
            assert_eq!(r.sequence_number, old);
        }

        update(&mut p, &signed(&update_manifest(3))).unwrap();
        assert_eq!(report(&p).sequence_number, 3);
    }

    #[test]
    fn unknown_classes() {
        let mut p = processor();
        let mut manifest = update_manifest(1);
        manifest.class_id = Some(Uuid([0x99; 16]));
        assert_eq!(
            update(&mut p, &signed(&manifest)),
            Err(Error::Platform(plat::Error::NotFound))
        );

        manifest.class_id = None;
        assert!(matches!(
            update(&mut p, &signed(&manifest)),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn try_each_falls_back() {
        let mut p = processor();
        let wrong_vendor = [0x66; 16];
        let first = raw_cbor!(4 [
            0:20, 5 [0:1 2 { wrong_vendor }, 0:18 2 { b"first" }],
            0:1, 0:15,
            0:18, 0:15,
        ]);
        let manifest = ManifestBuilder::new()
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:0,
                    0:20, 5 [0:18 2 { b"base" }],
                    // The second alternative only sees the content set
                    // before the first one ran.
                    0:15, 4 [2 { first }, 2 { 4 [0:18, 0:15] }],
                    0:6, 0:15,
                ]),
            );
        update(&mut p, &signed(&manifest)).unwrap();
        assert_eq!(p.platform().memory[&STAGING], b"base");

        let skipped = ManifestBuilder::new()
            .sequence_number(2)
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [0:15, 4 [2 { first }, h"f6"]]),
            );
        update(&mut p, &signed(&skipped)).unwrap();

        let all_fail = ManifestBuilder::new()
            .sequence_number(3)
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [0:15, 4 [2 { first }, 2 { 4 [0:14, 0:0] }]]),
            );
        assert_eq!(
            update(&mut p, &signed(&all_fail)),
            Err(Error::ConditionFailed(Condition::Abort))
        );
        assert_eq!(p.platform().outstanding, 0);
    }

    #[test]
    fn missing_parameters_are_not_conditions() {
        let mut p = processor();
        let manifest = ManifestBuilder::new()
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [0:15, 4 [2 { 4 [0:1, 0:15] }, h"f6"]]),
            );
        assert_eq!(
            update(&mut p, &signed(&manifest)),
            Err(Error::MissingParameter)
        );
    }

    #[test]
    fn checking_leaves_everything_untouched() {
        let mut p = processor();
        let before = p.storage().flash().as_bytes().to_vec();

        let envelope = signed(&update_manifest(1));
        p.check_update(&envelope, &OutOfMemory).unwrap();
        assert!(p.platform().memory.is_empty());
        assert!(p.platform().invoked.is_empty());
        assert_eq!(p.platform().outstanding, 0);
        assert_eq!(p.storage().flash().as_bytes(), &before[..]);

        p.platform_mut().denied = Some(Operation::Copy);
        assert_eq!(
            p.check_update(&envelope, &OutOfMemory)
                .map_err(|e| e.into_inner()),
            Err(Error::Denied)
        );
        assert_eq!(p.storage().flash().as_bytes(), &before[..]);
    }

    #[test]
    fn validation_runs_before_anything_executes() {
        let mut p = processor();
        // Copy is refused, but only after the fetch in an earlier sequence.
        p.platform_mut().denied = Some(Operation::Copy);
        assert_eq!(
            update(&mut p, &signed(&update_manifest(1))),
            Err(Error::Denied)
        );
        assert!(p.platform().memory.is_empty());
        assert_eq!(p.platform().outstanding, 0);

        let r = report(&p);
        assert_eq!(r.mode, Mode::Validate);
        assert_eq!(r.state, State::Install);
        assert_eq!(r.sequence, Some(SequenceKind::Install));
    }

    #[test]
    fn failures_are_all_or_nothing() {
        let mut p = processor();
        let manifest = ManifestBuilder::new()
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:20, 5 [0:18 2 { b"staged" }],
                    0:18, 0:15,
                    0:6, 0:15,
                    // Only fails once the write has really happened.
                    0:20, 5 [0:18 2 { b"other" }],
                    0:6, 0:15,
                    0:23, 0:15,
                ]),
            );
        assert_eq!(
            update(&mut p, &signed(&manifest)),
            Err(Error::ConditionFailed(Condition::CheckContent))
        );
        assert!(p.platform().invoked.is_empty());
        assert_eq!(p.platform().outstanding, 0);
        assert_eq!(
            p.storage()
                .installed_envelope(&CLASS_ROOT, &OutOfMemory)
                .unwrap_err()
                .into_inner(),
            plat::Error::NotFound
        );

        let r = report(&p);
        assert_eq!(r.outcome, Outcome::ConditionFailed);
        assert_eq!(r.mode, Mode::Execute);
        assert_eq!(r.sequence, Some(SequenceKind::Install));
    }

    #[test]
    fn digest_mismatches() {
        let mut p = processor();
        let manifest = update_manifest(1).build();
        let mut tampered = image();
        tampered[100] ^= 1;
        let envelope = EnvelopeBuilder::new(&manifest)
            .sign(b"key", b"good")
            .payload("#app", &tampered)
            .build();
        assert_eq!(update(&mut p, &envelope), Err(Error::DigestMismatch));
        assert_eq!(report(&p).state, State::Fetch);
        assert!(p.platform().memory.get(&EXEC).is_none());
    }

    #[test]
    fn payloads_from_sources() {
        let mut p = processor();
        let manifest = update_manifest(1).build();
        let envelope = EnvelopeBuilder::new(&manifest).sign(b"key", b"good").build();

        let image = image();
        let list = [("#app", &image[..])];
        let mut cache = Payloads(&list);
        p.update(&envelope, &mut [&mut cache], &OutOfMemory).unwrap();
        assert_eq!(p.platform().memory[&EXEC], image);

        let mut p = processor();
        assert_eq!(
            update(&mut p, &envelope),
            Err(Error::Platform(plat::Error::NotFound))
        );
    }

    #[test]
    fn components_can_be_refused() {
        let mut p = processor();
        p.platform_mut().forbidden = Some(ComponentType::Mem);
        assert_eq!(
            update(&mut p, &signed(&update_manifest(1))),
            Err(Error::Denied)
        );
        assert_eq!(p.platform().outstanding, 0);
    }

    #[test]
    fn swaps() {
        let mut p = processor();
        p.platform_mut().memory.insert(EXEC, b"old".to_vec());
        let manifest = ManifestBuilder::new()
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:0,
                    0:20, 5 [0:18 2 { b"new" }],
                    0:18, 0:15,
                    0:12, 0:1,
                    0:20, 5 [0:22 0:0],
                    0:31, 0:15,
                ]),
            );
        update(&mut p, &signed(&manifest)).unwrap();
        assert_eq!(p.platform().memory[&EXEC], b"new");
        assert_eq!(p.platform().memory[&STAGING], b"old");

        // A component cannot be its own source.
        let manifest = ManifestBuilder::new()
            .sequence_number(2)
            .components(components())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [0:20, 5 [0:22 0:0], 0:31, 0:15]),
            );
        assert_eq!(update(&mut p, &signed(&manifest)), Err(Error::BadComponent));
    }

    #[test]
    fn manifest_variables() {
        let mut p = processor();
        let components = vec![
            testdata::indexed_component("MFST_VAR", 0x101),
            testdata::indexed_component("MFST_VAR", 0x202),
            testdata::indexed_component("MFST_VAR", 0x002),
        ];
        let manifest = ManifestBuilder::new()
            .components(components.clone())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:0,
                    0:20, 5 [0:18 2 { h"efbeadde" }],
                    0:18, 0:15,
                    0:6, 0:15,
                    0:12, 0:1,
                    0:20, 5 [0:18 2 { h"2a000000" }],
                    0:18, 0:15,
                    0:6, 0:15,
                ]),
            );
        update(&mut p, &signed(&manifest)).unwrap();
        assert_eq!(p.storage_mut().nvv_get(2).unwrap(), 0x2a);

        // Manifest-volatile variables do not outlive the run.
        let mut nvm = crate::variables::test::RamNvm::default();
        assert_eq!(p.variables().get(&mut nvm, 0x101).unwrap(), 0);

        // Platform-volatile variables are read-only to manifests.
        let read_only = ManifestBuilder::new()
            .sequence_number(2)
            .components(components.clone())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:2,
                    0:20, 5 [0:18 2 { h"01000000" }],
                    0:18, 0:15,
                ]),
            );
        assert_eq!(update(&mut p, &signed(&read_only)), Err(Error::Denied));

        // NVM variables are a byte wide.
        let too_wide = ManifestBuilder::new()
            .sequence_number(3)
            .components(components.clone())
            .sequence(
                SequenceKind::Install,
                raw_cbor!(4 [
                    0:12, 0:1,
                    0:20, 5 [0:18 2 { h"00010000" }],
                    0:18, 0:15,
                ]),
            );
        assert_eq!(
            update(&mut p, &signed(&too_wide)),
            Err(Error::Platform(plat::Error::Size))
        );
        assert_eq!(p.storage_mut().nvv_get(2).unwrap(), 0x2a);

        let not_a_component = ManifestBuilder::new()
            .sequence_number(4)
            .components(components)
            .sequence(SequenceKind::Install, raw_cbor!(4 [0:23, 0:15]));
        assert_eq!(
            update(&mut p, &signed(&not_a_component)),
            Err(Error::BadComponent)
        );
    }

    #[test]
    fn failed_boots_request_recovery() {
        let mut p = processor();
        let mut buf = vec![0; 0x800];
        let mut arena = BumpArena::new(&mut buf);

        assert_eq!(
            p.boot(&CLASS_ROOT, &arena).unwrap_err().into_inner(),
            Error::Platform(plat::Error::NotFound)
        );
        assert!(p.storage().flags_check(Flag::Recovery).is_ok());
        p.storage_mut().flags_clear(Flag::Recovery).unwrap();

        update(&mut p, &signed(&update_manifest(1))).unwrap();
        p.platform_mut().memory.get_mut(&EXEC).unwrap()[0] ^= 1;
        arena.reset();
        assert_eq!(
            p.boot(&CLASS_ROOT, &arena).unwrap_err().into_inner(),
            Error::ConditionFailed(Condition::ImageMatch)
        );
        assert!(p.platform().invoked.is_empty());
        assert!(p.storage().flags_check(Flag::Recovery).is_ok());

        let r = report(&p);
        assert_eq!(r.state, State::Validate);
        assert_eq!(r.mode, Mode::Execute);
        assert_eq!(r.sequence, Some(SequenceKind::Validate));
    }

    #[test]
    fn unsigned_boots_follow_class_policy() {
        let mut p = processor();
        let mut buf = vec![0; 0x800];
        let mut arena = BumpArena::new(&mut buf);

        // The application class only requires signatures on update, so an
        // unsigned envelope planted in its slot boots.
        let mut manifest = ManifestBuilder::new();
        manifest.class_id = Some(CLASS_APP);
        let manifest = manifest.build();
        let unsigned = EnvelopeBuilder::new(&manifest).build();
        p.storage_mut().install_envelope(&CLASS_APP, &unsigned).unwrap();
        p.boot(&CLASS_APP, &arena).unwrap();

        // The root class always requires them.
        let mut manifest = ManifestBuilder::new();
        manifest.class_id = Some(CLASS_ROOT);
        let manifest = manifest.build();
        let unsigned = EnvelopeBuilder::new(&manifest).build();
        p.storage_mut().install_envelope(&CLASS_ROOT, &unsigned).unwrap();
        arena.reset();
        assert_eq!(
            p.boot(&CLASS_ROOT, &arena).unwrap_err().into_inner(),
            Error::Unauthenticated
        );

        // Envelopes must be in the slot of their own class.
        p.storage_mut().install_envelope(&CLASS_APP, &unsigned).unwrap();
        arena.reset();
        assert_eq!(
            p.boot(&CLASS_APP, &arena).unwrap_err().into_inner(),
            Error::Denied
        );
    }

    #[test]
    fn options_from_json() {
        let json = r#"{
            "report_slot": 1,
            "copy_chunk_len": 128,
            "stream": { "inter_chunk_timeout_ms": 200, "requesting_period_ms": 50 }
        }"#;
        let opts: Options = serde_json::from_str(json).unwrap();
        assert_eq!(
            opts,
            Options {
                report_slot: 1,
                copy_chunk_len: 128,
                stream: stream::Options {
                    inter_chunk_timeout_ms: 200,
                    requesting_period_ms: 50,
                },
            }
        );
    }
}
