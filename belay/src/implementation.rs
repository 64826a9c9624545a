//! Detected firmware and the per-implementation dispatch table.

use belay_proto::Value;
use serde::Serialize;

use crate::error::{Error, Result};

/// Device-side code shipped with the crate.
pub(crate) mod snippets {
    /// Result reporting helpers; run on every (re)connect.
    pub(crate) const PROTOCOL: &str = include_str!("../snippets/protocol.py");
    /// Compiles a native function containing a viper function.
    pub(crate) const EMITTER_CHECK: &str = include_str!("../snippets/emitter_check.py");
    /// Default startup imports for MicroPython.
    pub(crate) const IMPORTS_MICROPYTHON: &str =
        include_str!("../snippets/convenience_imports_micropython.py");
    /// Default startup imports for CircuitPython.
    pub(crate) const IMPORTS_CIRCUITPYTHON: &str =
        include_str!("../snippets/convenience_imports_circuitpython.py");
    /// Directory iteration on MicroPython.
    pub(crate) const ILISTDIR_MICROPYTHON: &str =
        include_str!("../snippets/ilistdir_micropython.py");
    /// Directory iteration on CircuitPython.
    pub(crate) const ILISTDIR_CIRCUITPYTHON: &str =
        include_str!("../snippets/ilistdir_circuitpython.py");
    /// Interpreted FNV-1a.
    pub(crate) const HASH_INTERPRETED: &str = include_str!("../snippets/hf.py");
    /// FNV-1a compiled with the native / viper emitters.
    pub(crate) const HASH_VIPER: &str = include_str!("../snippets/hf_viper.py");
    /// FNV-1a from the `_belay_fnv1a32` native module.
    pub(crate) const HASH_NATIVE_MODULE: &str = include_str!("../snippets/hf_native.py");
    /// Listing, hashing, staging and removal helpers for sync.
    pub(crate) const SYNC: &str = include_str!("../snippets/sync.py");
}

/// Query evaluated on connect: `(name, version, platform, mpy)`.
pub(crate) const INFO_QUERY: &str = "__belay_info()";

/// Firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Kind {
    /// MicroPython.
    MicroPython,
    /// CircuitPython.
    CircuitPython,
    /// Anything else that speaks the raw REPL.
    Other,
}

impl Kind {
    /// Classifies `sys.implementation.name`.
    fn from_name(name: &str) -> Self {
        match name {
            "micropython" => Self::MicroPython,
            "circuitpython" => Self::CircuitPython,
            _ => Self::Other,
        }
    }
}

/// Native code architecture, decoded from `sys.implementation._mpy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Arch {
    /// x86.
    X86,
    /// x86-64.
    X64,
    /// ARMv6.
    Armv6,
    /// ARMv6-M.
    Armv6m,
    /// ARMv7-M.
    Armv7m,
    /// ARMv7E-M.
    Armv7em,
    /// ARMv7E-M, single-precision FPU.
    Armv7emsp,
    /// ARMv7E-M, double-precision FPU.
    Armv7emdp,
    /// Xtensa (ESP8266).
    Xtensa,
    /// Windowed Xtensa (ESP32).
    Xtensawin,
}

impl Arch {
    /// Architectures in `_mpy >> 10` order; index 0 means "none".
    const TABLE: [Option<Self>; 11] = [
        None,
        Some(Self::X86),
        Some(Self::X64),
        Some(Self::Armv6),
        Some(Self::Armv6m),
        Some(Self::Armv7m),
        Some(Self::Armv7em),
        Some(Self::Armv7emsp),
        Some(Self::Armv7emdp),
        Some(Self::Xtensa),
        Some(Self::Xtensawin),
    ];

    /// Decodes the architecture bits of `sys.implementation._mpy`.
    pub fn from_mpy(mpy: u64) -> Option<Self> {
        usize::try_from(mpy >> 10)
            .ok()
            .and_then(|i| Self::TABLE.get(i).copied().flatten())
    }
}

/// Code emitters the firmware was built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct Emitters {
    /// `@micropython.native` is available.
    pub native: bool,
    /// `@micropython.viper` is available.
    pub viper: bool,
}

impl Emitters {
    /// Interprets the outcome of running the emitter check.
    ///
    /// `stderr` is the traceback, if the check raised. A decorator error on
    /// line 1 means no emitters; on line 3, native only.
    pub(crate) fn from_check(stderr: Option<&str>) -> Result<Self> {
        let Some(tb) = stderr else {
            return Ok(Self {
                native: true,
                viper: true,
            });
        };
        if !tb.contains("invalid micropython decorator") {
            return Err(Error::remote(tb));
        }
        let line = tb
            .rmatch_indices("line ")
            .find_map(|(i, m)| {
                let digits: String = tb[i + m.len()..]
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect();
                digits.parse::<u32>().ok()
            });
        match line {
            Some(1) => Ok(Self::default()),
            Some(3) => Ok(Self {
                native: true,
                viper: false,
            }),
            _ => Err(Error::remote(tb)),
        }
    }
}

/// Firmware details detected at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct Implementation {
    /// `sys.implementation.name`.
    pub name: String,
    /// Firmware family.
    pub kind: Kind,
    /// `(major, minor, patch)`.
    pub version: (u32, u32, u32),
    /// `sys.platform`.
    pub platform: String,
    /// Native code architecture, if the firmware reports one.
    pub arch: Option<Arch>,
    /// Available emitters.
    pub emitters: Emitters,
}

impl Implementation {
    /// Builds the implementation from the info query result.
    pub(crate) fn from_info(info: &Value, emitters: Emitters) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("unexpected implementation info: {info}"));
        let fields = info.as_seq().ok_or_else(bad)?;
        let [name, version, platform, mpy] = fields else {
            return Err(bad());
        };
        let name = name.as_str().ok_or_else(bad)?.to_owned();
        let parts: Vec<u32> = version
            .as_seq()
            .ok_or_else(bad)?
            .iter()
            .map(|v| v.as_u64().and_then(|n| u32::try_from(n).ok()))
            .collect::<Option<_>>()
            .ok_or_else(bad)?;
        let version = (
            parts.first().copied().unwrap_or(0),
            parts.get(1).copied().unwrap_or(0),
            parts.get(2).copied().unwrap_or(0),
        );
        Ok(Self {
            kind: Kind::from_name(&name),
            name,
            version,
            platform: platform.as_str().ok_or_else(bad)?.to_owned(),
            arch: mpy.as_u64().and_then(Arch::from_mpy),
            emitters,
        })
    }

    /// Implementation-specific snippets and capabilities.
    pub fn dispatch(&self) -> &'static Dispatch {
        dispatch(self.kind)
    }
}

/// Implementation-specific snippets and capabilities, resolved once per
/// connection.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Dispatch {
    /// Default startup imports.
    pub convenience_imports: &'static str,
    /// Defines `__belay_ilistdir`.
    pub ilistdir: &'static str,
    /// `_thread` is available.
    pub threads: bool,
}

/// Dispatch rows keyed by firmware family.
static DISPATCH: [(Kind, Dispatch); 2] = [
    (Kind::MicroPython, Dispatch {
        convenience_imports: snippets::IMPORTS_MICROPYTHON,
        ilistdir: snippets::ILISTDIR_MICROPYTHON,
        threads: true,
    }),
    (Kind::CircuitPython, Dispatch {
        convenience_imports: snippets::IMPORTS_CIRCUITPYTHON,
        ilistdir: snippets::ILISTDIR_CIRCUITPYTHON,
        threads: false,
    }),
];

/// Looks up the dispatch row; unknown firmware uses the MicroPython row.
pub(crate) fn dispatch(kind: Kind) -> &'static Dispatch {
    DISPATCH
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or(&DISPATCH[0].1, |(_, d)| d)
}

#[cfg(test)]
mod tests {
    use belay_proto::parse_literal;

    use super::*;

    #[test]
    fn parses_info_tuple() {
        let info = parse_literal("('micropython', (1, 22, 0), 'rp2', 4102)").unwrap();
        let imp = Implementation::from_info(&info, Emitters::default()).unwrap();
        assert_eq!(imp.kind, Kind::MicroPython);
        assert_eq!(imp.version, (1, 22, 0));
        assert_eq!(imp.platform, "rp2");
        assert_eq!(imp.arch, Some(Arch::Armv6m));
    }

    #[test]
    fn missing_mpy_means_no_arch() {
        let info = parse_literal("('circuitpython', (8, 2, 6), 'RP2040', None)").unwrap();
        let imp = Implementation::from_info(&info, Emitters::default()).unwrap();
        assert_eq!(imp.kind, Kind::CircuitPython);
        assert_eq!(imp.arch, None);
        assert!(!imp.dispatch().threads);
    }

    #[test]
    fn rejects_malformed_info() {
        let info = parse_literal("('micropython', 1)").unwrap();
        assert!(Implementation::from_info(&info, Emitters::default()).is_err());
    }

    #[test]
    fn arch_table() {
        assert_eq!(Arch::from_mpy(0), None);
        assert_eq!(Arch::from_mpy(10 << 10 | 6), Some(Arch::Xtensawin));
        assert_eq!(Arch::from_mpy(63 << 10), None);
    }

    #[test]
    fn emitter_check_outcomes() {
        assert_eq!(
            Emitters::from_check(None).unwrap(),
            Emitters { native: true, viper: true }
        );
        let line1 = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\nSyntaxError: invalid micropython decorator\r\n";
        assert_eq!(Emitters::from_check(Some(line1)).unwrap(), Emitters::default());
        let line3 = line1.replace("line 1", "line 3");
        assert_eq!(
            Emitters::from_check(Some(&line3)).unwrap(),
            Emitters { native: true, viper: false }
        );
        assert!(Emitters::from_check(Some("MemoryError")).is_err());
    }

    #[test]
    fn unknown_firmware_uses_micropython_row() {
        assert_eq!(dispatch(Kind::Other), dispatch(Kind::MicroPython));
        assert!(dispatch(Kind::Other).threads);
    }
}
