//! Transport over the stdin/stdout of a spawned interpreter process.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use super::{Transport, not_open};

/// A running child process and the channel its stdout is pumped into.
#[derive(Debug)]
struct Running {
    /// Child handle.
    child: Child,
    /// Child stdin.
    stdin: ChildStdin,
    /// Chunks read from the child's stdout.
    rx: Receiver<Vec<u8>>,
}

/// Runs a local interpreter (e.g. the MicroPython unix port) and talks to
/// its REPL over pipes.
#[derive(Debug)]
pub struct ProcessTransport {
    /// Shell command line.
    command: String,
    /// Live process.
    running: Option<Running>,
    /// Bytes received but not yet returned.
    buffer: Vec<u8>,
}

impl ProcessTransport {
    /// Creates a transport that runs `command` through the shell on open.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            running: None,
            buffer: Vec::new(),
        }
    }

    /// Takes at most `max` bytes from the local buffer.
    fn take_buffered(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }
}

impl Transport for ProcessTransport {
    fn open(&mut self) -> io::Result<()> {
        self.close();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(not_open)?;
        let mut stdout = child.stdout.take().ok_or_else(not_open)?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("belay-process-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })?;

        tracing::debug!(command = %self.command, pid = child.id(), "spawned interpreter");
        self.running = Some(Running { child, stdin, rx });
        self.buffer.clear();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut running) = self.running.take() {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
        self.buffer.clear();
    }

    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        if !self.buffer.is_empty() {
            return Ok(self.take_buffered(max));
        }
        let running = self.running.as_mut().ok_or_else(not_open)?;
        match running.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.buffer = chunk;
                if let Some(running) = &self.running {
                    while let Ok(more) = running.rx.try_recv() {
                        self.buffer.extend(more);
                    }
                }
                Ok(self.take_buffered(max))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "interpreter process exited",
            )),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let running = self.running.as_mut().ok_or_else(not_open)?;
        running.stdin.write_all(data)?;
        running.stdin.flush()
    }

    fn describe(&self) -> String {
        format!("exec:{}", self.command)
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.close();
    }
}
