//! Raw REPL control bytes and the fixed banners the device answers with.

/// Ctrl-A: enter raw REPL.
pub const CTRL_ENTER_RAW: u8 = 0x01;
/// Ctrl-B: leave raw REPL for the friendly REPL.
pub const CTRL_EXIT_RAW: u8 = 0x02;
/// Ctrl-C: interrupt the running program.
pub const CTRL_INTERRUPT: u8 = 0x03;
/// Ctrl-D: end of submission, output separator, or soft reset on an empty buffer.
pub const CTRL_EOT: u8 = 0x04;
/// Ctrl-E: raw-paste request prefix.
pub const CTRL_PASTE: u8 = 0x05;

/// Full raw-paste request (`Ctrl-E`, `'A'`, `Ctrl-A`).
pub const PASTE_REQUEST: &[u8] = b"\x05A\x01";
/// Device reply: raw-paste is available.
pub const PASTE_ACK_SUPPORTED: &[u8] = b"R\x01";
/// Device reply: raw-paste is understood but unavailable.
pub const PASTE_ACK_UNSUPPORTED: &[u8] = b"R\x00";
/// Flow-control byte granting another paste window.
pub const PASTE_WINDOW_GRANT: u8 = 0x01;

/// Banner printed when raw REPL is entered, without the trailing prompt.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
/// Prompt printed when the raw REPL is ready for a submission.
pub const RAW_PROMPT: &[u8] = b">";
/// Line printed by the device during a soft reset.
pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
