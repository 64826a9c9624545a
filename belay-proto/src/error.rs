//! Protocol-level error types.

/// A sentinel-prefixed line that does not follow the response grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    /// The character after the sentinel is not a known response code.
    #[error("unknown response code {0:?}")]
    UnknownCode(char),

    /// A result line is missing one of its `|` separators.
    #[error("result line is missing a field separator: {0:?}")]
    MissingSeparator(String),

    /// The reference id is not a decimal integer.
    #[error("invalid reference id {0:?}")]
    InvalidRefId(String),

    /// The timestamp is not a decimal integer.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A reference result carried a literal payload as well.
    #[error("reference result {ref_id} carries an unexpected payload")]
    UnexpectedPayload {
        /// Reference id announced by the line.
        ref_id: u64,
    },

    /// Trailing data after a stream terminator.
    #[error("trailing data after stream terminator: {0:?}")]
    TrailingData(String),

    /// The sentinel line is not valid UTF-8.
    #[error("response line is not valid UTF-8")]
    Utf8,
}

/// Errors raised while decoding a literal payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LiteralError {
    /// Input ended in the middle of a literal.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A character that cannot start or continue a token.
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar {
        /// Offending character.
        ch: char,
        /// Byte offset in the payload.
        offset: usize,
    },

    /// A well-formed token in a position the grammar does not allow.
    #[error("unexpected token {found} at offset {offset}")]
    UnexpectedToken {
        /// Rendering of the token.
        found: String,
        /// Byte offset in the payload.
        offset: usize,
    },

    /// String literal without its closing quote.
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    /// Malformed escape sequence inside a string literal.
    #[error("invalid escape sequence {0:?}")]
    InvalidEscape(String),

    /// Malformed or unsupported numeric literal.
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),

    /// Integer outside the representable range.
    #[error("integer literal {0:?} is out of range")]
    IntegerOverflow(String),

    /// A construct outside the accepted language (names, calls, operators).
    #[error("{0} is not allowed in a safe literal")]
    NotLiteral(String),

    /// A name or call the trusted evaluator does not know.
    #[error("unsupported expression: {0}")]
    Unsupported(String),

    /// A type mismatch during trusted evaluation.
    #[error("type error: {0}")]
    Type(String),

    /// Division or modulo by zero during trusted evaluation.
    #[error("division by zero")]
    ZeroDivision,

    /// Containers or operators nested deeper than the parser allows.
    #[error("literal is nested deeper than {0} levels")]
    TooDeep(usize),
}
