//! Telnet-style TCP transport (e.g. the WiPy / ESP telnet REPL).

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::{Transport, not_open};

/// Telnet "interpret as command".
const IAC: u8 = 0xff;
/// Subnegotiation end.
const SE: u8 = 0xf0;
/// Subnegotiation begin.
const SB: u8 = 0xfa;
/// Option negotiation verbs.
const WILL: u8 = 0xfb;
/// Refuse a `DO`.
const WONT: u8 = 0xfc;
/// Ask the peer to enable an option.
const DO: u8 = 0xfd;
/// Refuse a `WILL`.
const DONT: u8 = 0xfe;

/// Default telnet port.
const DEFAULT_PORT: u16 = 23;
/// Timeout for establishing the socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Login prompt markers and the banner that confirms success.
const LOGIN_PROMPT: &[u8] = b"Login as:";
/// Password prompt.
const PASSWORD_PROMPT: &[u8] = b"Password:";
/// Printed after a successful login.
const LOGIN_OK: &[u8] = b"Type \"help()\" for more information.";

/// Credentials for the telnet login exchange.
#[derive(Clone)]
struct Login {
    /// User name.
    user: String,
    /// Password.
    password: String,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// TCP transport with optional telnet login.
#[derive(Debug)]
pub struct TcpTransport {
    /// `host` or `host:port`.
    addr: String,
    /// Credentials; `None` skips the login exchange.
    login: Option<Login>,
    /// How long to wait for each login prompt.
    login_timeout: Duration,
    /// Open socket.
    stream: Option<TcpStream>,
    /// Telnet command filter state.
    filter: TelnetFilter,
}

impl TcpTransport {
    /// Creates a transport for `addr` (`host` or `host:port`, default port 23).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            login: None,
            login_timeout: Duration::from_secs(10),
            stream: None,
            filter: TelnetFilter::default(),
        }
    }

    /// Performs the `Login as:` / `Password:` exchange after connecting.
    #[must_use]
    pub fn with_login(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(Login {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Sets how long to wait for each login prompt.
    #[must_use]
    pub const fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Resolves `addr`, filling in the default port.
    fn resolve(&self) -> io::Result<std::net::SocketAddr> {
        let with_port = if self.addr.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            self.addr.clone()
        } else {
            format!("{}:{DEFAULT_PORT}", self.addr)
        };
        with_port.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", self.addr))
        })
    }

    /// Reads until `marker` appears or the login timeout passes.
    fn wait_for(&mut self, marker: &[u8]) -> io::Result<bool> {
        let deadline = Instant::now() + self.login_timeout;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let chunk = self.read(256, Duration::from_millis(250))?;
            seen.extend_from_slice(&chunk);
            if seen.windows(marker.len()).any(|w| w == marker) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Runs the telnet login exchange.
    fn login(&mut self, login: &Login) -> io::Result<()> {
        let failed = || io::Error::new(io::ErrorKind::PermissionDenied, "telnet login failed");
        if !self.wait_for(LOGIN_PROMPT)? {
            return Err(failed());
        }
        self.write(format!("{}\r\n", login.user).as_bytes())?;
        if !self.wait_for(PASSWORD_PROMPT)? {
            return Err(failed());
        }
        // the board's telnet server drops input sent right after the prompt
        std::thread::sleep(Duration::from_millis(200));
        self.write(format!("{}\r\n", login.password).as_bytes())?;
        if !self.wait_for(LOGIN_OK)? {
            return Err(failed());
        }
        tracing::debug!(addr = %self.addr, "telnet login complete");
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> io::Result<()> {
        self.close();
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.filter = TelnetFilter::default();
        if let Some(login) = self.login.clone() {
            if let Err(e) = self.login(&login) {
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = vec![0; max.max(1)];
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device closed the connection",
                ));
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let (data, replies) = self.filter.feed(&buf[..n]);
        if !replies.is_empty() {
            stream.write_all(&replies)?;
        }
        Ok(data)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        // a literal 0xff must be doubled on a telnet link
        if data.contains(&IAC) {
            let mut escaped = Vec::with_capacity(data.len() + 8);
            for &b in data {
                escaped.push(b);
                if b == IAC {
                    escaped.push(IAC);
                }
            }
            stream.write_all(&escaped)?;
        } else {
            stream.write_all(data)?;
        }
        stream.flush()
    }

    fn survives_soft_reset(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Strips telnet command sequences from the byte stream, refusing every
/// option the peer proposes. Sequences may straddle reads.
#[derive(Debug, Default)]
struct TelnetFilter {
    /// Bytes of an incomplete command sequence.
    pending: Vec<u8>,
    /// Inside a subnegotiation block.
    in_sb: bool,
}

impl TelnetFilter {
    /// Returns the payload bytes and any negotiation replies to send back.
    fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(input);

        let mut data = Vec::with_capacity(bytes.len());
        let mut replies = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if self.in_sb {
                if b == IAC {
                    match bytes.get(i + 1) {
                        Some(&SE) => {
                            self.in_sb = false;
                            i += 2;
                        }
                        Some(_) => i += 2,
                        None => {
                            self.pending.push(IAC);
                            i += 1;
                        }
                    }
                } else {
                    i += 1;
                }
                continue;
            }
            if b != IAC {
                data.push(b);
                i += 1;
                continue;
            }
            let Some(&cmd) = bytes.get(i + 1) else {
                self.pending.extend_from_slice(&bytes[i..]);
                break;
            };
            match cmd {
                IAC => {
                    data.push(IAC);
                    i += 2;
                }
                WILL | WONT | DO | DONT => {
                    let Some(&opt) = bytes.get(i + 2) else {
                        self.pending.extend_from_slice(&bytes[i..]);
                        break;
                    };
                    match cmd {
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        _ => {}
                    }
                    i += 3;
                }
                SB => {
                    self.in_sb = true;
                    i += 2;
                }
                _ => i += 2,
            }
        }
        (data, replies)
    }
}
