//! Per-device session: connection lifecycle, command execution, replay.
//!
//! A [`Session`] sits behind the device mutex, so at most one command is in
//! flight. It owns the [`ReplController`], hands out command ids, records
//! session-defining commands and rebuilds the device state after a
//! reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use belay_proto::{FramingError, Response, ResultLine, Value, decode, parse_line, wrap_expression};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::history::{CallHistory, Command};
use crate::implementation::{Emitters, INFO_QUERY, Implementation, snippets};
use crate::repl::{ReplController, ReplOptions};
use crate::sync::HashRoutine;
use crate::transport::Transport;

/// Expression read by the clock estimate.
const MONOTONIC_QUERY: &str = "__belay_monotonic()";
/// Samples taken by the estimate made while connecting.
const CONNECT_CLOCK_SAMPLES: usize = 3;

/// Receives device output that is not a protocol line.
pub type OutputSink = Box<dyn FnMut(&str) + Send>;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkState {
    /// Raw REPL ready for commands.
    Connected,
    /// The last command hit a transport failure or timeout.
    Disconnected,
    /// Reconnect attempt `n` (1-based) in progress.
    Reconnecting(u32),
    /// [`crate::Device::close`] was called.
    Closed,
}

/// Session facts readable without taking the session lock.
#[derive(Debug, Default)]
pub(crate) struct Status {
    /// Bumped on every successful (re)connect.
    pub epoch: AtomicU64,
    /// Session is [`LinkState::Connected`].
    pub connected: AtomicBool,
    /// Session is [`LinkState::Closed`].
    pub closed: AtomicBool,
    /// Remote references waiting to be deleted, as `(epoch, ref id)`.
    pub deletes: Mutex<Vec<(u64, u64)>>,
}

/// Splits streamed stdout into lines and sorts them into results and
/// pass-through text.
#[derive(Debug, Default)]
pub(crate) struct Lines {
    /// Incomplete trailing line.
    partial: Vec<u8>,
    /// Parsed results not consumed yet.
    pub results: VecDeque<ResultLine>,
    /// `_BELAYS` seen.
    pub stream_end: bool,
    /// First malformed sentinel line.
    pub error: Option<FramingError>,
}

impl Lines {
    /// Consumes a chunk of stdout.
    fn feed(&mut self, chunk: &[u8], sink: &mut Option<OutputSink>) {
        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.line(&line, sink);
        }
    }

    /// Handles a final line without a newline.
    fn flush(&mut self, sink: &mut Option<OutputSink>) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.line(&line, sink);
        }
    }

    /// Classifies one complete line.
    fn line(&mut self, line: &[u8], sink: &mut Option<OutputSink>) {
        match parse_line(line) {
            Ok(Some(Response::Result(result))) => self.results.push_back(result),
            Ok(Some(Response::StreamEnd)) => self.stream_end = true,
            Ok(Some(_)) => {}
            Ok(None) => {
                let text = String::from_utf8_lossy(line);
                let text = text.trim_end_matches(['\r', '\n']);
                match sink {
                    Some(sink) => sink(text),
                    None => tracing::info!(target: "belay::output", "{text}"),
                }
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
    }
}

/// State behind the device lock.
pub(crate) struct Session {
    /// Protocol driver.
    repl: ReplController,
    /// Settings.
    pub config: Config,
    /// Lock-free view shared with handles.
    pub status: Arc<Status>,
    /// Connection state.
    link: LinkState,
    /// Next command id; never reset.
    next_id: u64,
    /// Firmware detected on the current connection.
    pub implementation: Option<Implementation>,
    /// Commands replayed after a reconnect.
    history: CallHistory,
    /// `device_seconds - host_seconds`, when estimated.
    time_offset: Option<f64>,
    /// Highest remote reference id seen.
    ref_high_water: u64,
    /// Hash routine installed for sync on this connection.
    pub hash_routine: Option<HashRoutine>,
    /// Code run by `close`.
    pub teardown: Vec<String>,
    /// Pass-through output receiver.
    output: Option<OutputSink>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.repl.describe())
            .field("link", &self.link)
            .field("next_id", &self.next_id)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a disconnected session.
    pub fn new(transport: Box<dyn Transport>, config: Config, status: Arc<Status>) -> Self {
        Self {
            repl: ReplController::new(transport, ReplOptions::from(&config)),
            history: CallHistory::new(config.history_capacity),
            config,
            status,
            link: LinkState::Disconnected,
            next_id: 0,
            implementation: None,
            time_offset: None,
            ref_high_water: 0,
            hash_routine: None,
            teardown: Vec::new(),
            output: None,
        }
    }

    /// Current connection state.
    pub const fn link(&self) -> LinkState {
        self.link
    }

    /// Transport description.
    pub fn describe(&self) -> String {
        self.repl.describe()
    }

    /// Number of recorded commands.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Replaces the pass-through output receiver.
    pub fn set_output(&mut self, sink: Option<OutputSink>) {
        self.output = sink;
    }

    /// First connection; no retries.
    pub fn connect(&mut self) -> Result<()> {
        self.handshake().inspect_err(|_| self.mark_disconnected())
    }

    /// Reconnects if needed so a command can be sent.
    pub fn ensure_ready(&mut self) -> Result<()> {
        match self.link {
            LinkState::Connected => Ok(()),
            LinkState::Closed => Err(Error::Closed),
            LinkState::Disconnected | LinkState::Reconnecting(_) => self.reconnect(false),
        }
    }

    /// Reopens the transport within the attempt budget and replays history.
    ///
    /// `forced` grants one attempt even when reconnecting is disabled.
    pub fn reconnect(&mut self, forced: bool) -> Result<()> {
        if self.link == LinkState::Closed {
            return Err(Error::Closed);
        }
        let attempts = self.config.attempts;
        if attempts == 0 && !forced {
            tracing::warn!(transport = %self.repl.describe(), "connection lost; reconnect disabled");
            return Err(Error::ConnectionLost);
        }
        let budget = if attempts == 0 { Some(1) } else { u32::try_from(attempts).ok() };

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            self.link = LinkState::Reconnecting(attempt);
            tracing::warn!(attempt, transport = %self.repl.describe(), "reconnecting");
            match self.handshake() {
                Ok(()) => break,
                Err(e) => {
                    self.mark_disconnected();
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    if budget.is_some_and(|b| attempt >= b) {
                        return Err(Error::ConnectionLost);
                    }
                    std::thread::sleep(self.config.reconnect_delay);
                }
            }
        }
        self.replay()
    }

    /// Reruns every recorded command in order.
    fn replay(&mut self) -> Result<()> {
        let payloads: Vec<String> = self.history.iter().map(|c| c.payload.clone()).collect();
        tracing::info!(entries = payloads.len(), "replaying history");
        for payload in payloads {
            if let Err(e) = self.execute(&payload, false) {
                tracing::warn!(error = %e, "replay failed");
                self.mark_disconnected();
                return Err(Error::ConnectionLost);
            }
        }
        tracing::info!(transport = %self.repl.describe(), "reconnected");
        Ok(())
    }

    /// Opens the transport, enters raw mode and rebuilds the device-side
    /// helpers.
    fn handshake(&mut self) -> Result<()> {
        self.repl.open()?;
        self.repl.enter(self.config.soft_reset)?;

        let protocol = format!("{}\n__belay_ref_n = {}\n", snippets::PROTOCOL, self.ref_high_water);
        self.execute(&protocol, false)?;
        let emitters = self.detect_emitters()?;
        let info = self.eval(INFO_QUERY, false)?;
        let implementation = Implementation::from_info(&info, emitters)?;
        tracing::info!(
            name = %implementation.name,
            version = ?implementation.version,
            platform = %implementation.platform,
            "device detected"
        );

        let startup = match &self.config.startup {
            Some(code) => code.clone(),
            None => implementation.dispatch().convenience_imports.to_owned(),
        };
        self.implementation = Some(implementation);
        self.hash_routine = None;
        if !startup.trim().is_empty() {
            self.execute(&startup, false)?;
        }

        self.link = LinkState::Connected;
        self.status.connected.store(true, Ordering::SeqCst);
        self.status.epoch.fetch_add(1, Ordering::SeqCst);

        if self.config.sync_time {
            self.sync_time(CONNECT_CLOCK_SAMPLES)?;
        }
        Ok(())
    }

    /// Compiles the emitter check and interprets the outcome.
    fn detect_emitters(&mut self) -> Result<Emitters> {
        match self.execute(snippets::EMITTER_CHECK, false) {
            Ok(_) => {
                self.execute("del __belay_emitter_test", false)?;
                Emitters::from_check(None)
            }
            Err(Error::RemoteExecution { raw, .. }) => Emitters::from_check(Some(&raw)),
            Err(e) => Err(e),
        }
    }

    /// Marks the link down; handles from this epoch stop sending deletes.
    fn mark_disconnected(&mut self) {
        if self.link != LinkState::Closed {
            self.link = LinkState::Disconnected;
        }
        self.status.connected.store(false, Ordering::SeqCst);
        self.hash_routine = None;
    }

    /// Records a failure of the command in flight.
    fn fail(&mut self, e: &Error) {
        if e.is_disconnect() {
            tracing::warn!(error = %e, "device link failed");
            self.mark_disconnected();
        }
    }

    /// Submits `text` and leaves its output to be read.
    pub fn begin(&mut self, text: &str) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(id, bytes = text.len(), "submitting command");
        self.repl.send(text).inspect_err(|e| self.fail(e))?;
        Ok(id)
    }

    /// Reads the next stdout chunk of the command in flight into `lines`.
    ///
    /// Returns `false` once stdout has ended.
    pub fn pump(&mut self, lines: &mut Lines) -> Result<bool> {
        match self.repl.next_stdout() {
            Ok(Some(chunk)) => {
                lines.feed(&chunk, &mut self.output);
                Ok(true)
            }
            Ok(None) => {
                lines.flush(&mut self.output);
                Ok(false)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Reads the rest of the command's output and checks for errors.
    pub fn complete(&mut self, lines: &mut Lines) -> Result<()> {
        while self.pump(lines)? {}
        let stderr = self.repl.finish().inspect_err(|e| self.fail(e))?;
        if !stderr.is_empty() {
            return Err(Error::remote(String::from_utf8_lossy(&stderr)));
        }
        match lines.error.take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Interrupts the command in flight and drains its output.
    pub fn abort(&mut self) {
        if let Err(e) = self.repl.abort() {
            self.fail(&e);
        }
    }

    /// Notes a reference id so it is never handed out twice.
    pub fn note_ref(&mut self, line: &ResultLine) {
        if let Some(id) = line.ref_id {
            self.ref_high_water = self.ref_high_water.max(id);
        }
    }

    /// Runs one program to completion and returns its result lines.
    pub fn execute(&mut self, text: &str, record: bool) -> Result<Vec<ResultLine>> {
        self.execute_as(text, record, false)
    }

    /// Like [`Self::execute`]; a recorded command remembers whether its
    /// results were decoded with the trusted evaluator.
    pub fn execute_as(
        &mut self,
        text: &str,
        record: bool,
        trusted: bool,
    ) -> Result<Vec<ResultLine>> {
        let id = self.begin(text)?;
        let mut lines = Lines::default();
        self.complete(&mut lines)?;
        for line in &lines.results {
            self.note_ref(line);
        }
        if record {
            self.history.push(Command {
                id,
                payload: text.to_owned(),
                trusted,
                record,
                issued: SystemTime::now(),
            });
        }
        Ok(lines.results.into())
    }

    /// Evaluates an expression that must produce a literal.
    pub fn eval(&mut self, expr: &str, trusted: bool) -> Result<Value> {
        let results = self.execute(&wrap_expression(expr, false, trusted), false)?;
        match results.into_iter().last() {
            None => Ok(Value::None),
            Some(line) if line.ref_id.is_some() => Err(Error::InvalidArgument(format!(
                "`{expr}` did not produce a literal"
            ))),
            Some(line) => Ok(decode(&line.payload, trusted)?),
        }
    }

    /// Sends queued `del` statements for dropped proxies of this epoch.
    pub fn flush_deletes(&mut self) {
        let epoch = self.status.epoch.load(Ordering::SeqCst);
        let ids: Vec<u64> = self
            .status
            .deletes
            .lock()
            .drain(..)
            .filter(|(e, _)| *e == epoch)
            .map(|(_, id)| id)
            .collect();
        if ids.is_empty() || self.link != LinkState::Connected {
            return;
        }
        let names: Vec<String> = ids.iter().map(|id| format!("__belay_obj_{id}")).collect();
        if let Err(e) = self.execute(&format!("del {}", names.join(", ")), false) {
            tracing::debug!(error = %e, "dropping remote references failed");
        }
    }

    /// One clock sample: `(round trip, offset seconds)`.
    fn clock_sample(&mut self) -> Result<(Duration, f64)> {
        let sent = SystemTime::now();
        let value = self.eval(MONOTONIC_QUERY, false)?;
        let received = SystemTime::now();
        let device_ms = value
            .as_f64()
            .ok_or_else(|| Error::InvalidArgument(format!("unexpected clock value: {value}")))?;
        let rtt = received.duration_since(sent).unwrap_or_default();
        let midpoint = (sent + rtt / 2)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Ok((rtt, device_ms / 1000.0 - midpoint))
    }

    /// Estimates the device clock offset from the lowest-latency sample.
    pub fn sync_time(&mut self, samples: usize) -> Result<f64> {
        let mut best = self.clock_sample()?;
        for _ in 1..samples {
            let sample = self.clock_sample()?;
            if sample.0 < best.0 {
                best = sample;
            }
        }
        let (rtt, offset) = best;
        tracing::debug!(offset, rtt_us = rtt.as_micros(), "device clock offset");
        self.time_offset = Some(offset);
        Ok(offset)
    }

    /// Current clock offset estimate.
    pub const fn time_offset(&self) -> Option<f64> {
        self.time_offset
    }

    /// Converts a device timestamp to host time.
    #[allow(clippy::cast_precision_loss)]
    pub fn host_time(&self, device_ms: u64) -> Option<SystemTime> {
        let secs = device_ms as f64 / 1000.0 - self.time_offset?;
        (secs.is_finite() && secs >= 0.0).then(|| UNIX_EPOCH + Duration::from_secs_f64(secs))
    }

    /// Runs teardown code, leaves raw mode and closes the transport.
    pub fn close(&mut self) -> Result<()> {
        if self.link == LinkState::Closed {
            return Ok(());
        }
        let mut first_error = None;
        if self.link == LinkState::Connected {
            for code in std::mem::take(&mut self.teardown) {
                if let Err(e) = self.execute(&code, false) {
                    tracing::warn!(error = %e, "teardown failed");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = self.repl.exit() {
                tracing::debug!(error = %e, "leaving raw mode failed");
            }
        }
        self.repl.close();
        self.link = LinkState::Closed;
        self.status.connected.store(false, Ordering::SeqCst);
        self.status.closed.store(true, Ordering::SeqCst);
        tracing::debug!(transport = %self.repl.describe(), "session closed");
        first_error.map_or(Ok(()), Err)
    }
}
