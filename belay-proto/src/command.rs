//! Command shapes and the wrappers that make the device report a result.

/// How a code fragment is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Shape {
    /// Sent verbatim; produces no result line.
    Statement,
    /// Wrapped so the device prints its value as a result line.
    Expression,
    /// Classified with [`is_expression`].
    #[default]
    Auto,
}

impl Shape {
    /// Replaces [`Shape::Auto`] with the detected shape of `code`.
    pub fn resolve(self, code: &str) -> Self {
        match self {
            Self::Auto if is_expression(code) => Self::Expression,
            Self::Auto => Self::Statement,
            other => other,
        }
    }
}

/// Statement keywords that can never begin an expression.
const STATEMENT_KEYWORDS: &[&str] = &[
    "assert", "async", "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "nonlocal", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Conservative lexical check for a single expression.
///
/// Accepts one logical line that does not start with a statement keyword or
/// decorator and has no top-level assignment, augmented assignment, walrus
/// or `;`. Anything it cannot classify is treated as a statement.
pub fn is_expression(code: &str) -> bool {
    let code = code.trim();
    if code.is_empty() || code.starts_with('@') {
        return false;
    }
    let first_word: String = code
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if STATEMENT_KEYWORDS.contains(&first_word.as_str()) {
        return false;
    }

    let bytes = code.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' => match skip_string(bytes, i) {
                Some(end) => {
                    i = end;
                    continue;
                }
                None => return false,
            },
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'\\' if bytes.get(i + 1) == Some(&b'\n') => {
                i += 2;
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'\n' | b';' if depth == 0 => return false,
            b'=' if depth == 0 => {
                let prev = i.checked_sub(1).map(|p| bytes[p]);
                let next = bytes.get(i + 1).copied();
                if next == Some(b'=') {
                    // comparison `==`
                    i += 2;
                    continue;
                }
                let shifted = i >= 2 && matches!(&bytes[i - 2..i], b">>" | b"<<");
                match prev {
                    Some(b'=' | b'!') => {}
                    Some(b'<' | b'>') if !shifted => {}
                    _ => return false,
                }
            }
            _ => {}
        }
        i += 1;
    }
    true
}

/// Returns the index just past the string literal opening at `start`.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let triple = bytes.get(start + 1) == Some(&quote) && bytes.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' if !triple => return None,
            q if q == quote => {
                if !triple {
                    return Some(i + 1);
                }
                if bytes.get(i + 1) == Some(&quote) && bytes.get(i + 2) == Some(&quote) {
                    return Some(i + 3);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

/// Wraps an expression so the device prints one result line for it.
///
/// The newline before the closing parenthesis keeps a trailing comment in
/// `expr` from swallowing the rest of the call.
pub fn wrap_expression(expr: &str, timed: bool, trusted: bool) -> String {
    format!(
        "__belay_ret(({}\n), {}, {})",
        expr.trim(),
        u8::from(timed),
        u8::from(trusted)
    )
}

/// Wraps an iterable expression so the device prints one result line per
/// element followed by the stream terminator.
pub fn wrap_stream(expr: &str, timed: bool, trusted: bool) -> String {
    format!(
        "__belay_stream(({}\n), {}, {})",
        expr.trim(),
        u8::from(timed),
        u8::from(trusted)
    )
}
