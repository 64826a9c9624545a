//! Connection and session configuration with JSON persistence.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Session configuration.
///
/// Durations are stored as milliseconds when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Reconnect budget: `0` never reconnects, negative retries forever.
    pub attempts: i32,
    /// Pause between reconnect attempts.
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    /// Bounded wait for handshake bytes, prompts and acknowledgements.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Bounded wait for the end of a command's output; `None` waits forever.
    #[serde(with = "opt_millis")]
    pub completion_timeout: Option<Duration>,
    /// Payloads up to this many bytes are written in one piece.
    pub direct_threshold: usize,
    /// Chunk size for raw writes when paste mode is unavailable.
    pub chunk_size: usize,
    /// Try raw-paste mode for large payloads.
    pub paste_mode: bool,
    /// Soft-reset the device when entering raw mode.
    pub soft_reset: bool,
    /// Maximum number of recorded commands kept for replay.
    pub history_capacity: usize,
    /// Code run after every (re)connect; `None` runs the convenience imports.
    pub startup: Option<String>,
    /// Strip comments and blank lines from synced `.py` files.
    pub minify: bool,
    /// Estimate the device clock offset while connecting.
    pub sync_time: bool,
    /// Bytes per write command when transferring files.
    pub transfer_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attempts: 0,
            reconnect_delay: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
            completion_timeout: None,
            direct_threshold: 256,
            chunk_size: 256,
            paste_mode: true,
            soft_reset: true,
            history_capacity: 1000,
            startup: None,
            minify: true,
            sync_time: true,
            transfer_chunk: 512,
        }
    }
}

impl Config {
    /// Sets the reconnect budget.
    pub const fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the pause between reconnect attempts.
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the handshake / prompt read timeout.
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the command completion timeout.
    pub const fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Sets the direct / paste submission threshold.
    pub const fn with_direct_threshold(mut self, bytes: usize) -> Self {
        self.direct_threshold = bytes;
        self
    }

    /// Sets the fallback raw-write chunk size.
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Enables or disables raw-paste mode.
    pub const fn with_paste_mode(mut self, enabled: bool) -> Self {
        self.paste_mode = enabled;
        self
    }

    /// Enables or disables the soft reset on connect.
    pub const fn with_soft_reset(mut self, enabled: bool) -> Self {
        self.soft_reset = enabled;
        self
    }

    /// Sets the replay history capacity.
    pub const fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Sets the startup code.
    pub fn with_startup(mut self, startup: Option<String>) -> Self {
        self.startup = startup;
        self
    }

    /// Enables or disables minification of synced files.
    pub const fn with_minify(mut self, enabled: bool) -> Self {
        self.minify = enabled;
        self
    }

    /// Enables or disables the clock estimate on connect.
    pub const fn with_sync_time(mut self, enabled: bool) -> Self {
        self.sync_time = enabled;
        self
    }

    /// Sets the file transfer chunk size.
    pub const fn with_transfer_chunk(mut self, bytes: usize) -> Self {
        self.transfer_chunk = bytes;
        self
    }

    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes the configuration to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    /// Deserializes from milliseconds.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as optional integer milliseconds.
mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as milliseconds or `null`.
    #[allow(clippy::cast_possible_truncation, clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    /// Deserializes from milliseconds or `null`.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.attempts, 0);
        assert_eq!(c.reconnect_delay, Duration::from_secs(1));
        assert_eq!(c.direct_threshold, 256);
        assert_eq!(c.history_capacity, 1000);
        assert!(c.completion_timeout.is_none());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("belay.json");
        let c = Config::default()
            .with_attempts(-1)
            .with_completion_timeout(Some(Duration::from_millis(1500)))
            .with_startup(Some(String::new()));
        c.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), c);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"completion_timeout\": 1500"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let c: Config = serde_json::from_str(r#"{"attempts": 3}"#).unwrap();
        assert_eq!(c.attempts, 3);
        assert_eq!(c.read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
