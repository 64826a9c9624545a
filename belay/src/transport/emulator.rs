//! Scripted raw-REPL device for tests.
//!
//! The emulator speaks the byte-level protocol (friendly prompt, raw mode,
//! soft reset, raw-paste flow control) and hands every submitted program to
//! a responder closure that decides what the "device" prints.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::Transport;

/// Friendly REPL banner.
const BANNER: &[u8] = b"\r\nMicroPython v1.22.0 on 2024-01-01; emulator\r\nType \"help()\" for more information.\r\n>>> ";
/// Printed when raw mode is entered.
const RAW_ENTER: &[u8] = b"\r\nraw REPL; CTRL-B to exit\r\n>";
/// Printed on a soft reset from raw mode.
const SOFT_RESET: &[u8] = b"OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>";

/// What the emulated program prints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Reply {
    /// Standard output.
    pub stdout: String,
    /// Standard error (a traceback).
    pub stderr: String,
}

impl Reply {
    /// Runs without output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Prints arbitrary text.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
        }
    }

    /// Prints one literal result line.
    pub fn value(literal: &str) -> Self {
        Self::stdout(format!("_BELAYR||{literal}\r\n"))
    }

    /// Prints one literal result line with a device timestamp.
    pub fn timed_value(literal: &str, ts_ms: u64) -> Self {
        Self::stdout(format!("_BELAYR|{ts_ms}|{literal}\r\n"))
    }

    /// Prints one reference result line.
    pub fn reference(id: u64) -> Self {
        Self::stdout(format!("_BELAYR{id}||\r\n"))
    }

    /// Prints one result line per literal, then the stream terminator.
    pub fn stream<S: AsRef<str>>(literals: impl IntoIterator<Item = S>) -> Self {
        let mut out = String::new();
        for lit in literals {
            out.push_str("_BELAYR||");
            out.push_str(lit.as_ref());
            out.push_str("\r\n");
        }
        out.push_str("_BELAYS\r\n");
        Self::stdout(out)
    }

    /// Raises with the given traceback.
    pub fn error(traceback: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: traceback.into(),
        }
    }
}

/// Returns the expression inside a `__belay_ret` / `__belay_stream` wrapper.
pub(crate) fn expression_of(code: &str) -> Option<&str> {
    let inner = code
        .strip_prefix("__belay_ret((")
        .or_else(|| code.strip_prefix("__belay_stream(("))?;
    let end = inner.rfind("\n), ")?;
    Some(&inner[..end])
}

/// Decides the output of a submitted program; `None` defers to the defaults.
pub(crate) type Responder = Box<dyn FnMut(&str) -> Option<Reply> + Send>;

/// REPL mode of the emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// `>>>` prompt.
    Friendly,
    /// Raw REPL.
    Raw,
    /// Raw-paste transfer in progress.
    Paste,
}

/// Shared device state.
struct State {
    /// Link is up.
    open: bool,
    /// `open` succeeds.
    reachable: bool,
    /// Number of `open` calls.
    opens: usize,
    /// REPL mode.
    mode: Mode,
    /// Program text being received.
    input: Vec<u8>,
    /// Progress through the `\x05A\x01` paste request.
    paste_req: usize,
    /// Raw-paste supported.
    paste_supported: bool,
    /// Raw-paste window size.
    window: u16,
    /// Bytes received in the current paste window.
    window_used: usize,
    /// Bytes waiting to be read by the host.
    output: VecDeque<u8>,
    /// Every executed program, in order.
    log: Vec<String>,
    /// Number of interrupts received.
    interrupts: usize,
    /// Number of soft resets.
    soft_resets: usize,
    /// Largest single write received.
    max_write: usize,
    /// Test-supplied responder.
    responder: Option<Responder>,
}

impl State {
    /// Resets the REPL to its power-on state.
    fn power_on(&mut self) {
        self.mode = Mode::Friendly;
        self.input.clear();
        self.output.clear();
        self.paste_req = 0;
        self.window_used = 0;
    }

    /// Queues output for the host.
    fn emit(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    /// Runs the received program and queues its output.
    fn execute(&mut self) {
        let code = String::from_utf8_lossy(&self.input).into_owned();
        self.input.clear();
        self.log.push(code.clone());
        let reply = self
            .responder
            .as_mut()
            .and_then(|r| r(&code))
            .unwrap_or_else(|| default_reply(&code));
        self.emit(reply.stdout.as_bytes());
        self.emit(b"\x04");
        self.emit(reply.stderr.as_bytes());
        self.emit(b"\x04>");
    }

    /// Handles one byte from the host.
    fn receive(&mut self, b: u8) {
        match self.mode {
            Mode::Friendly => match b {
                0x01 => {
                    self.mode = Mode::Raw;
                    self.input.clear();
                    self.emit(RAW_ENTER);
                }
                0x02 => self.emit(BANNER),
                0x03 => self.emit(b"\r\n>>> "),
                _ => {}
            },
            Mode::Raw => {
                const REQ: &[u8] = b"\x05A\x01";
                if self.input.is_empty() && b == REQ[self.paste_req] {
                    self.paste_req += 1;
                    if self.paste_req == REQ.len() {
                        self.paste_req = 0;
                        if self.paste_supported {
                            self.mode = Mode::Paste;
                            self.window_used = 0;
                            self.emit(b"R\x01");
                            let w = self.window.to_le_bytes();
                            self.emit(&w);
                        } else {
                            self.emit(b"R\x00");
                        }
                    }
                    return;
                }
                self.paste_req = 0;
                match b {
                    0x01 => {
                        self.input.clear();
                        self.emit(RAW_ENTER);
                    }
                    0x02 => {
                        self.mode = Mode::Friendly;
                        self.input.clear();
                        self.emit(BANNER);
                    }
                    0x03 => {
                        self.interrupts += 1;
                        self.input.clear();
                    }
                    0x04 if self.input.is_empty() => {
                        self.soft_resets += 1;
                        self.emit(SOFT_RESET);
                    }
                    0x04 => {
                        self.emit(b"OK");
                        self.execute();
                    }
                    _ => self.input.push(b),
                }
            }
            Mode::Paste => {
                if b == 0x04 {
                    self.mode = Mode::Raw;
                    self.emit(b"\x04");
                    self.execute();
                    return;
                }
                self.input.push(b);
                self.window_used += 1;
                if self.window_used == usize::from(self.window) {
                    self.window_used = 0;
                    self.emit(b"\x01");
                }
            }
        }
    }
}

/// Output of the handshake programs every session runs.
fn default_reply(code: &str) -> Reply {
    match expression_of(code) {
        Some("__belay_info()") => Reply::value("('micropython', (1, 22, 0), 'linux', 2054)"),
        Some("__belay_monotonic()") => Reply::value("1.5"),
        Some(expr) if expr.starts_with("__belay_hfs(") => Reply::value("[]"),
        Some(expr) if expr.starts_with("__belay_ls(") => Reply::value("[]"),
        Some(_) => Reply::value("None"),
        None => Reply::empty(),
    }
}

/// Transport half of the emulator.
pub(crate) struct Emulator {
    /// Shared state.
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator").finish_non_exhaustive()
    }
}

/// Test-side handle for scripting and inspecting the emulator.
#[derive(Clone)]
pub(crate) struct EmulatorHandle {
    /// Shared state.
    state: Arc<Mutex<State>>,
}

impl Emulator {
    /// Creates an emulator and its handle.
    pub fn new() -> (Self, EmulatorHandle) {
        let state = Arc::new(Mutex::new(State {
            open: false,
            reachable: true,
            opens: 0,
            mode: Mode::Friendly,
            input: Vec::new(),
            paste_req: 0,
            paste_supported: true,
            window: 32,
            window_used: 0,
            output: VecDeque::new(),
            log: Vec::new(),
            interrupts: 0,
            soft_resets: 0,
            max_write: 0,
            responder: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            EmulatorHandle { state },
        )
    }
}

impl EmulatorHandle {
    /// Installs the responder consulted before the defaults.
    pub fn respond(&self, f: impl FnMut(&str) -> Option<Reply> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(f));
    }

    /// Every program executed so far.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Forgets the program log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Number of `open` calls.
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// Number of interrupts received.
    pub fn interrupts(&self) -> usize {
        self.state.lock().interrupts
    }

    /// Number of soft resets performed.
    pub fn soft_resets(&self) -> usize {
        self.state.lock().soft_resets
    }

    /// Largest single write seen.
    pub fn max_write(&self) -> usize {
        self.state.lock().max_write
    }

    /// Drops the link; reads and writes fail until the next `open`.
    pub fn unplug(&self) {
        self.state.lock().open = false;
    }

    /// Makes `open` fail (`false`) or succeed (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Enables or disables raw-paste support.
    pub fn set_paste(&self, supported: bool) {
        self.state.lock().paste_supported = supported;
    }
}

/// Error returned while the emulated link is down.
fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "emulated device unplugged")
}

impl Transport for Emulator {
    fn open(&mut self) -> io::Result<()> {
        let mut s = self.state.lock();
        s.opens += 1;
        if !s.reachable {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "emulated device unreachable"));
        }
        s.open = true;
        s.power_on();
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn read(&mut self, max: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
        let mut s = self.state.lock();
        if !s.open {
            return Err(unplugged());
        }
        let n = max.min(s.output.len());
        Ok(s.output.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut s = self.state.lock();
        if !s.open {
            return Err(unplugged());
        }
        s.max_write = s.max_write.max(data.len());
        for &b in data {
            s.receive(b);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "emulator".to_owned()
    }
}
