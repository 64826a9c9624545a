//! Source shrinking before transfer. Line numbers are always preserved so
//! device tracebacks still point at the right host line.

/// Text-to-text transform applied to code before it is sent or synced.
pub trait Minifier: Send + Sync + std::fmt::Debug {
    /// Returns the minified source with the same number of lines.
    fn minify(&self, code: &str) -> String;
}

/// Drops comments and trailing whitespace; blank lines stay as empty lines.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct StripComments;

impl Minifier for StripComments {
    fn minify(&self, code: &str) -> String {
        strip_comments(code)
    }
}

/// Lexer position relative to string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Ordinary code.
    Code,
    /// Inside a string opened with `quote`.
    Str {
        /// Opening quote character.
        quote: char,
        /// Triple-quoted.
        triple: bool,
    },
}

/// Removes `#` comments outside string literals and trims trailing
/// whitespace on lines that do not end inside a string.
pub fn strip_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut line = String::new();
    let mut state = Scan::Code;
    let mut chars = code.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            Scan::Code => match ch {
                '#' => {
                    while chars.peek().is_some_and(|&c| c != '\n') {
                        chars.next();
                    }
                }
                '\'' | '"' => {
                    line.push(ch);
                    let mut lookahead = chars.clone();
                    let triple = lookahead.next() == Some(ch) && lookahead.next() == Some(ch);
                    if triple {
                        chars.next();
                        chars.next();
                        line.push(ch);
                        line.push(ch);
                    }
                    state = Scan::Str { quote: ch, triple };
                }
                '\n' => {
                    out.push_str(line.trim_end());
                    out.push('\n');
                    line.clear();
                }
                _ => line.push(ch),
            },
            Scan::Str { quote, triple } => {
                if ch == '\n' {
                    out.push_str(&line);
                    out.push('\n');
                    line.clear();
                    if !triple {
                        // unterminated single-quoted string; resync
                        state = Scan::Code;
                    }
                    continue;
                }
                line.push(ch);
                if ch == '\\' {
                    if let Some(next) = chars.next_if(|&c| c != '\n') {
                        line.push(next);
                    }
                } else if ch == quote {
                    if !triple {
                        state = Scan::Code;
                    } else {
                        let mut lookahead = chars.clone();
                        if lookahead.next() == Some(quote) && lookahead.next() == Some(quote) {
                            chars.next();
                            chars.next();
                            line.push(quote);
                            line.push(quote);
                            state = Scan::Code;
                        }
                    }
                }
            }
        }
    }
    if state == Scan::Code {
        out.push_str(line.trim_end());
    } else {
        out.push_str(&line);
    }
    out
}

/// Removes the indentation shared by every non-blank line.
pub fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}
