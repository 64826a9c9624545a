//! Maps device tracebacks back to host source locations.

use std::sync::OnceLock;

use regex::Regex;

/// Where a registered function's source lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SourceLocation {
    /// File name shown in remapped tracebacks.
    pub file: String,
    /// 1-based line of the source's first line in `file`.
    pub line: u32,
}

impl SourceLocation {
    /// Creates a location.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Matches a traceback frame for code submitted over the REPL.
#[allow(clippy::expect_used)]
fn stdin_frame() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r#"File "<stdin>", line (\d+), in (\S+)"#).expect("frame regex must compile")
    })
}

/// Rewrites frames of function `name` to point into `loc`.
///
/// Line `N` of the submitted code corresponds to line `N - 1 + loc.line` of
/// the host file. Frames of other functions are left alone.
pub fn remap(traceback: &str, name: &str, loc: &SourceLocation) -> String {
    stdin_frame()
        .replace_all(traceback, |caps: &regex::Captures<'_>| {
            let frame_name = &caps[2];
            let line = caps[1].parse::<u32>().ok();
            match line {
                Some(n) if frame_name == name => format!(
                    "File \"{}\", line {}, in {frame_name}",
                    loc.file,
                    n.saturating_add(loc.line).saturating_sub(1)
                ),
                _ => caps[0].to_owned(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB: &str = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n  File \"<stdin>\", line 3, in blink\r\nZeroDivisionError: divide by zero\r\n";

    #[test]
    fn remaps_matching_frames() {
        let out = remap(TB, "blink", &SourceLocation::new("main.py", 10));
        assert!(out.contains("File \"main.py\", line 12, in blink"));
        assert!(out.contains("File \"<stdin>\", line 1, in <module>"));
        assert!(out.ends_with("ZeroDivisionError: divide by zero\r\n"));
    }

    #[test]
    fn leaves_other_tracebacks_alone() {
        let out = remap(TB, "other", &SourceLocation::new("main.py", 10));
        assert_eq!(out, TB);
    }

    #[test]
    fn huge_line_numbers_saturate() {
        let tb = "  File \"<stdin>\", line 4294967295, in blink\r\n";
        let out = remap(tb, "blink", &SourceLocation::new("main.py", 10));
        assert!(out.contains("File \"main.py\", line 4294967294, in blink"));
    }
}
