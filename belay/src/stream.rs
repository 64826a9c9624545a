//! Lazy iteration over values yielded on the device.

use parking_lot::MutexGuard;

use crate::device::{Device, Reply};
use crate::error::{Error, Result};
use crate::session::{Lines, Session};
use crate::traceback::{self, SourceLocation};

/// Values produced by a generator or iterable on the device, one result line
/// at a time.
///
/// The stream holds the device session while it is alive. Dropping it before
/// the end interrupts the device and discards the remaining output.
pub struct Stream<'a> {
    /// Device the values belong to.
    device: &'a Device,
    /// Exclusive session access.
    session: MutexGuard<'a, Session>,
    /// Line splitter for the command in flight.
    lines: Lines,
    /// Decode with the trusted evaluator.
    trusted: bool,
    /// Traceback remapping for task generators.
    origin: Option<(String, SourceLocation)>,
    /// The command has completed.
    done: bool,
}

impl std::fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("trusted", &self.trusted)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'a> Stream<'a> {
    /// Wraps a stream command that has already been sent.
    pub(crate) fn new(device: &'a Device, session: MutexGuard<'a, Session>, trusted: bool) -> Self {
        Self {
            device,
            session,
            lines: Lines::default(),
            trusted,
            origin: None,
            done: false,
        }
    }

    /// Remaps tracebacks of frames in `name` to `loc`.
    pub(crate) fn with_origin(mut self, name: String, loc: SourceLocation) -> Self {
        self.origin = Some((name, loc));
        self
    }

    /// Reads the terminators; yields an error if the generator raised.
    fn end(&mut self) -> Option<Result<Reply>> {
        self.done = true;
        match self.session.complete(&mut self.lines) {
            Ok(()) => None,
            Err(Error::RemoteExecution { raw, .. }) => {
                let remapped = match &self.origin {
                    Some((name, loc)) => traceback::remap(&raw, name, loc),
                    None => raw.clone(),
                };
                Some(Err(Error::RemoteExecution { raw, remapped }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for Stream<'_> {
    type Item = Result<Reply>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(e) = self.lines.error.take() {
                self.done = true;
                self.session.abort();
                return Some(Err(e.into()));
            }
            if let Some(line) = self.lines.results.pop_front() {
                self.session.note_ref(&line);
                return Some(self.device.reply(line, self.trusted));
            }
            if self.lines.stream_end {
                return self.end();
            }
            match self.session.pump(&mut self.lines) {
                Ok(true) => {}
                Ok(false) if !self.lines.results.is_empty() || self.lines.error.is_some() => {}
                Ok(false) => return self.end(),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for Stream<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!("stream dropped early; interrupting device");
            self.session.abort();
        }
    }
}
