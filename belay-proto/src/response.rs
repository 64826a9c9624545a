//! Parsing of sentinel-tagged response lines.

use crate::error::FramingError;

/// Prefix that marks a line as a protocol response.
pub const SENTINEL: &str = "_BELAY";

/// One result reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResultLine {
    /// Reference id when the value stayed on the device.
    pub ref_id: Option<u64>,
    /// Device tick count in milliseconds, when requested.
    pub timestamp_ms: Option<u64>,
    /// Literal text of the value; empty for references.
    pub payload: String,
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Response {
    /// A single result.
    Result(ResultLine),
    /// End of a stream.
    StreamEnd,
}

/// Parses one output line.
///
/// Lines without the sentinel prefix are ordinary program output and yield
/// `Ok(None)`. A trailing `\r` or `\n` is ignored.
pub fn parse_line(line: &[u8]) -> Result<Option<Response>, FramingError> {
    if !line.starts_with(SENTINEL.as_bytes()) {
        return Ok(None);
    }
    let text = std::str::from_utf8(line).map_err(|_| FramingError::Utf8)?;
    let body = text[SENTINEL.len()..].trim_end_matches(['\r', '\n']);

    let mut chars = body.chars();
    match chars.next() {
        Some('R') => parse_result(chars.as_str()).map(|r| Some(Response::Result(r))),
        Some('S') if chars.as_str().is_empty() => Ok(Some(Response::StreamEnd)),
        Some('S') => Err(FramingError::TrailingData(chars.as_str().to_owned())),
        Some(other) => Err(FramingError::UnknownCode(other)),
        None => Err(FramingError::UnknownCode('\0')),
    }
}

/// Parses the fields after `_BELAYR`.
fn parse_result(fields: &str) -> Result<ResultLine, FramingError> {
    let mut parts = fields.splitn(3, '|');
    let ref_field = parts.next().unwrap_or_default();
    let (Some(ts_field), Some(payload)) = (parts.next(), parts.next()) else {
        return Err(FramingError::MissingSeparator(fields.to_owned()));
    };

    let ref_id = parse_optional(ref_field).map_err(|()| FramingError::InvalidRefId(ref_field.to_owned()))?;
    let timestamp_ms =
        parse_optional(ts_field).map_err(|()| FramingError::InvalidTimestamp(ts_field.to_owned()))?;

    if let Some(ref_id) = ref_id {
        if !payload.is_empty() {
            return Err(FramingError::UnexpectedPayload { ref_id });
        }
    }

    Ok(ResultLine {
        ref_id,
        timestamp_ms,
        payload: payload.to_owned(),
    })
}

/// Empty field means absent; otherwise a decimal `u64`.
fn parse_optional(field: &str) -> Result<Option<u64>, ()> {
    if field.is_empty() {
        return Ok(None);
    }
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(());
    }
    field.parse().map(Some).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(line: &str) -> ResultLine {
        match parse_line(line.as_bytes()) {
            Ok(Some(Response::Result(r))) => r,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_output_passes_through() {
        assert_eq!(parse_line(b"hello world\r\n"), Ok(None));
        assert_eq!(parse_line(b""), Ok(None));
        assert_eq!(parse_line(b"_BELA"), Ok(None));
    }

    #[test]
    fn literal_result() {
        let r = result("_BELAYR||[1, 2]\r\n");
        assert_eq!(r.ref_id, None);
        assert_eq!(r.timestamp_ms, None);
        assert_eq!(r.payload, "[1, 2]");
    }

    #[test]
    fn payload_may_contain_separators() {
        assert_eq!(result("_BELAYR|12|'a|b'").payload, "'a|b'");
        assert_eq!(result("_BELAYR|12|'a|b'").timestamp_ms, Some(12));
    }

    #[test]
    fn reference_result() {
        let r = result("_BELAYR7||");
        assert_eq!(r.ref_id, Some(7));
        assert!(r.payload.is_empty());
    }

    #[test]
    fn stream_end() {
        assert_eq!(parse_line(b"_BELAYS\r\n"), Ok(Some(Response::StreamEnd)));
        assert!(matches!(parse_line(b"_BELAYSx"), Err(FramingError::TrailingData(_))));
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse_line(b"_BELAYQ"), Err(FramingError::UnknownCode('Q')));
        assert_eq!(parse_line(b"_BELAY"), Err(FramingError::UnknownCode('\0')));
        assert!(matches!(parse_line(b"_BELAYR1"), Err(FramingError::MissingSeparator(_))));
        assert!(matches!(parse_line(b"_BELAYRx||1"), Err(FramingError::InvalidRefId(_))));
        assert!(matches!(parse_line(b"_BELAYR|-1|1"), Err(FramingError::InvalidTimestamp(_))));
        assert_eq!(
            parse_line(b"_BELAYR3||1"),
            Err(FramingError::UnexpectedPayload { ref_id: 3 })
        );
        assert_eq!(parse_line(b"_BELAYR||\xff"), Err(FramingError::Utf8));
    }
}
