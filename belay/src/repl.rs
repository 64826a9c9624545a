//! Raw REPL state machine.
//!
//! [`ReplController`] owns the transport and turns it into "submit this
//! program, give me its stdout and stderr". It handles the raw-mode
//! handshake, the three submission modes (direct, raw-paste with flow
//! control, chunked fallback) and output collection.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use belay_proto::{
    CTRL_EOT, CTRL_INTERRUPT, PASTE_ACK_SUPPORTED, PASTE_ACK_UNSUPPORTED, PASTE_REQUEST,
    PASTE_WINDOW_GRANT, RAW_BANNER, RAW_PROMPT, SOFT_REBOOT,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Pause between chunks in fallback mode.
const CHUNK_PAUSE: Duration = Duration::from_millis(10);
/// Tail of the raw banner printed when a paste request is not understood.
const PASTE_REJECT_TAIL: &[u8] = b"w REPL; CTRL-B to exit\r\n>";
/// Read size for transport reads.
const READ_SIZE: usize = 512;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplState {
    /// Friendly REPL or unknown.
    Idle,
    /// Raw handshake in progress.
    EnteringRaw,
    /// Raw prompt pending; ready for a submission.
    RawReady,
    /// Program text being written.
    Submitting,
    /// Reading program output.
    Collecting,
    /// Leaving raw mode.
    ExitingRaw,
}

/// Whether raw-paste is usable on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paste {
    /// Not tried yet.
    Unknown,
    /// Device accepted raw-paste.
    Supported,
    /// Device refused or paste is disabled; use chunked writes.
    Unsupported,
}

/// Which output section the controller is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    /// Before the first `\x04`.
    Stdout,
    /// Between the first and second `\x04`.
    Stderr,
}

/// Timeouts and submission tuning.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplOptions {
    /// Bounded wait for handshake bytes, prompts and acknowledgements.
    pub read_timeout: Duration,
    /// Bounded wait for the output terminators.
    pub completion_timeout: Option<Duration>,
    /// Direct-write threshold.
    pub direct_threshold: usize,
    /// Fallback chunk size.
    pub chunk_size: usize,
    /// Raw-paste allowed.
    pub paste_mode: bool,
}

impl From<&Config> for ReplOptions {
    fn from(c: &Config) -> Self {
        Self {
            read_timeout: c.read_timeout,
            completion_timeout: c.completion_timeout,
            direct_threshold: c.direct_threshold,
            chunk_size: c.chunk_size.max(1),
            paste_mode: c.paste_mode,
        }
    }
}

/// Drives the raw REPL over a [`Transport`].
#[derive(Debug)]
pub struct ReplController {
    /// Byte channel.
    transport: Box<dyn Transport>,
    /// Protocol state.
    state: ReplState,
    /// Bytes read from the transport but not consumed yet.
    pending: VecDeque<u8>,
    /// Raw-paste availability.
    paste: Paste,
    /// Output section being read while collecting.
    section: Section,
    /// Completion deadline of the current command.
    deadline: Option<Instant>,
    /// Tuning.
    opts: ReplOptions,
}

impl ReplController {
    /// Wraps a transport; nothing is opened yet.
    pub(crate) fn new(transport: Box<dyn Transport>, opts: ReplOptions) -> Self {
        let paste = if opts.paste_mode { Paste::Unknown } else { Paste::Unsupported };
        Self {
            transport,
            state: ReplState::Idle,
            pending: VecDeque::new(),
            paste,
            section: Section::Stdout,
            deadline: None,
            opts,
        }
    }

    /// Wraps a transport with timeouts and submission tuning from `config`.
    pub fn with_config(transport: Box<dyn Transport>, config: &Config) -> Self {
        Self::new(transport, ReplOptions::from(config))
    }

    /// Current protocol state.
    pub const fn state(&self) -> ReplState {
        self.state
    }

    /// Description of the underlying transport.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// (Re)opens the transport and forgets all per-connection state.
    pub fn open(&mut self) -> Result<()> {
        self.transport.close();
        self.pending.clear();
        self.state = ReplState::Idle;
        self.paste = if self.opts.paste_mode { Paste::Unknown } else { Paste::Unsupported };
        self.transport.open().map_err(Error::Transport)
    }

    /// Closes the transport.
    pub fn close(&mut self) {
        self.transport.close();
        self.pending.clear();
        self.state = ReplState::Idle;
    }

    /// Enters raw mode, optionally soft-resetting the device first.
    pub fn enter(&mut self, soft_reset: bool) -> Result<()> {
        self.set_state(ReplState::EnteringRaw);
        let soft_reset = soft_reset && self.transport.survives_soft_reset();
        let result = self.handshake(soft_reset);
        match result {
            Ok(()) => self.set_state(ReplState::RawReady),
            Err(_) => self.set_state(ReplState::Idle),
        }
        result
    }

    /// Handshake body of [`Self::enter`].
    fn handshake(&mut self, soft_reset: bool) -> Result<()> {
        self.drain()?;
        self.write(b"\r\x03\x03")?;
        self.write(b"\r\x02")?;
        self.read_until(b">>>", "friendly prompt")?;
        self.write(b"\r\x01")?;
        if soft_reset {
            let mut prompt = RAW_BANNER.to_vec();
            prompt.extend_from_slice(RAW_PROMPT);
            self.read_until(&prompt, "raw REPL prompt")?;
            self.write(&[CTRL_EOT])?;
            self.read_until(SOFT_REBOOT, "soft reboot")?;
        }
        self.read_until(RAW_BANNER, "raw REPL banner")?;
        Ok(())
    }

    /// Leaves raw mode for the friendly REPL.
    pub fn exit(&mut self) -> Result<()> {
        self.set_state(ReplState::ExitingRaw);
        let result = self.write(b"\r\x02");
        self.set_state(ReplState::Idle);
        result
    }

    /// Interrupts the running program.
    pub fn interrupt(&mut self) -> Result<()> {
        self.write(&[CTRL_INTERRUPT])
    }

    /// Submits `code` and collects its output, forwarding stdout chunks to
    /// `consumer` as they arrive.
    ///
    /// Returns `(stdout, stderr)` without the terminators.
    pub fn submit(
        &mut self,
        code: &str,
        consumer: &mut dyn FnMut(&[u8]),
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.send(code)?;
        self.follow(consumer)
    }

    /// Submits `code` without reading its output.
    pub(crate) fn send(&mut self, code: &str) -> Result<()> {
        if self.state != ReplState::RawReady {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "raw REPL is not ready",
            )));
        }
        self.set_state(ReplState::Submitting);
        let result = self.write_program(code.as_bytes());
        match result {
            Ok(()) => {
                self.section = Section::Stdout;
                self.deadline = self.opts.completion_timeout.map(|t| Instant::now() + t);
                self.set_state(ReplState::Collecting);
            }
            Err(_) => self.set_state(ReplState::Idle),
        }
        result
    }

    /// Reads the rest of the current command's output.
    pub(crate) fn follow(
        &mut self,
        consumer: &mut dyn FnMut(&[u8]),
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut stdout = Vec::new();
        while let Some(chunk) = self.next_stdout()? {
            consumer(&chunk);
            stdout.extend_from_slice(&chunk);
        }
        let stderr = self.finish()?;
        Ok((stdout, stderr))
    }

    /// Returns the next piece of stdout, or `None` once stdout has ended.
    pub(crate) fn next_stdout(&mut self) -> Result<Option<Vec<u8>>> {
        if self.state != ReplState::Collecting || self.section != Section::Stdout {
            return Ok(None);
        }
        if self.pending.is_empty() {
            if let Err(e) = self.fill_for_completion() {
                self.set_state(ReplState::Idle);
                return Err(e);
            }
        }
        let end = self.pending.iter().position(|&b| b == CTRL_EOT);
        let take = end.unwrap_or(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..take).collect();
        if end.is_some() {
            self.pending.pop_front();
            self.section = Section::Stderr;
        }
        if !chunk.is_empty() {
            tracing::trace!(output = %String::from_utf8_lossy(&chunk), "device output");
            return Ok(Some(chunk));
        }
        if end.is_some() { Ok(None) } else { self.next_stdout() }
    }

    /// Discards remaining stdout, reads stderr and returns to the prompt.
    pub(crate) fn finish(&mut self) -> Result<Vec<u8>> {
        if self.state != ReplState::Collecting {
            return Ok(Vec::new());
        }
        while self.next_stdout()?.is_some() {}
        let mut stderr = Vec::new();
        loop {
            if self.pending.is_empty() {
                if let Err(e) = self.fill_for_completion() {
                    self.set_state(ReplState::Idle);
                    return Err(e);
                }
            }
            while let Some(b) = self.pending.pop_front() {
                if b == CTRL_EOT {
                    self.deadline = None;
                    self.set_state(ReplState::RawReady);
                    return Ok(stderr);
                }
                stderr.push(b);
            }
        }
    }

    /// Interrupts the running program and discards its remaining output.
    pub(crate) fn abort(&mut self) -> Result<()> {
        if self.state != ReplState::Collecting {
            return Ok(());
        }
        self.interrupt()?;
        self.finish().map(drop)
    }

    /// Writes a program using the best available submission mode.
    fn write_program(&mut self, code: &[u8]) -> Result<()> {
        self.read_until(RAW_PROMPT, "raw REPL prompt")?;

        if code.len() <= self.opts.direct_threshold {
            self.write(code)?;
            self.write(&[CTRL_EOT])?;
            return self.expect_ok();
        }

        if self.paste != Paste::Unsupported {
            self.write(PASTE_REQUEST)?;
            let reply = self.read_exact(2, "raw-paste reply")?;
            if reply == PASTE_ACK_SUPPORTED {
                self.paste = Paste::Supported;
                return self.paste_write(code);
            }
            if reply != PASTE_ACK_UNSUPPORTED {
                self.read_until(PASTE_REJECT_TAIL, "raw REPL prompt")?;
            }
            tracing::debug!("raw-paste unavailable; using chunked writes");
            self.paste = Paste::Unsupported;
        }

        for chunk in code.chunks(self.opts.chunk_size) {
            self.write(chunk)?;
            std::thread::sleep(CHUNK_PAUSE);
        }
        self.write(&[CTRL_EOT])?;
        self.expect_ok()
    }

    /// Raw-paste transfer with window flow control.
    fn paste_write(&mut self, code: &[u8]) -> Result<()> {
        let header = self.read_exact(2, "raw-paste window size")?;
        let window = usize::from(u16::from_le_bytes([header[0], header[1]]));
        if window == 0 {
            return Err(desync("raw-paste window of zero bytes"));
        }
        let mut remain = window;
        let mut sent = 0;
        while sent < code.len() {
            loop {
                let byte = if remain == 0 {
                    Some(self.read_byte("raw-paste window grant")?)
                } else {
                    self.poll_byte()?
                };
                match byte {
                    None => break,
                    Some(PASTE_WINDOW_GRANT) => remain += window,
                    Some(CTRL_EOT) => {
                        // device ended the transfer early
                        self.write(&[CTRL_EOT])?;
                        return Ok(());
                    }
                    Some(other) => {
                        return Err(desync(&format!("unexpected byte {other:#04x} during raw-paste")));
                    }
                }
            }
            let n = remain.min(code.len() - sent);
            self.write(&code[sent..sent + n])?;
            remain -= n;
            sent += n;
        }
        self.write(&[CTRL_EOT])?;
        self.read_until(&[CTRL_EOT], "raw-paste acknowledgement")?;
        Ok(())
    }

    /// Checks the `OK` that confirms a raw submission.
    fn expect_ok(&mut self) -> Result<()> {
        let reply = self.read_exact(2, "submission acknowledgement")?;
        if reply == b"OK" {
            Ok(())
        } else {
            Err(desync(&format!(
                "could not exec command (response: {:?})",
                String::from_utf8_lossy(&reply)
            )))
        }
    }

    /// Moves to `next`, logging the transition.
    fn set_state(&mut self, next: ReplState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "repl state");
            self.state = next;
        }
    }

    /// Writes bytes to the transport.
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write(data).map_err(Error::Transport)
    }

    /// Discards everything the device has sent so far.
    fn drain(&mut self) -> Result<()> {
        self.pending.clear();
        loop {
            let chunk = self
                .transport
                .read(READ_SIZE, Duration::ZERO)
                .map_err(Error::Transport)?;
            if chunk.is_empty() {
                return Ok(());
            }
        }
    }

    /// Reads more bytes into `pending`, waiting at most `timeout`.
    ///
    /// Returns `false` if nothing arrived.
    fn fill(&mut self, timeout: Duration) -> Result<bool> {
        let chunk = self
            .transport
            .read(READ_SIZE, timeout)
            .map_err(Error::Transport)?;
        let got = !chunk.is_empty();
        self.pending.extend(chunk);
        Ok(got)
    }

    /// Fills `pending` under the idle read timeout.
    fn fill_or_timeout(&mut self, what: &str) -> Result<()> {
        let deadline = Instant::now() + self.opts.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.fill(remaining)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ProtocolTimeout(what.to_owned()));
            }
        }
    }

    /// Fills `pending` under the command completion deadline.
    fn fill_for_completion(&mut self) -> Result<()> {
        loop {
            let slice = match self.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    remaining.min(self.opts.read_timeout)
                }
                None => self.opts.read_timeout,
            };
            if self.fill(slice)? {
                return Ok(());
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::ProtocolTimeout("command completion".to_owned()));
            }
        }
    }

    /// Reads one byte under the idle read timeout.
    fn read_byte(&mut self, what: &str) -> Result<u8> {
        if self.pending.is_empty() {
            self.fill_or_timeout(what)?;
        }
        self.pending
            .pop_front()
            .ok_or_else(|| Error::ProtocolTimeout(what.to_owned()))
    }

    /// Returns a byte if one is already available, without waiting.
    fn poll_byte(&mut self) -> Result<Option<u8>> {
        if self.pending.is_empty() {
            self.fill(Duration::ZERO)?;
        }
        Ok(self.pending.pop_front())
    }

    /// Reads exactly `n` bytes.
    fn read_exact(&mut self, n: usize, what: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            out.push(self.read_byte(what)?);
        }
        Ok(out)
    }

    /// Reads until the received data ends with `ending`.
    fn read_until(&mut self, ending: &[u8], what: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while !data.ends_with(ending) {
            data.push(self.read_byte(what)?);
        }
        Ok(data)
    }
}

/// The device sent something the protocol does not allow here.
fn desync(msg: &str) -> Error {
    Error::Transport(io::Error::new(io::ErrorKind::InvalidData, msg.to_owned()))
}
