//! Tokenizer for interpreter literals and the small trusted expression language.

use crate::error::LiteralError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    /// Identifier or keyword (`None`, `True`, `set`, ...).
    Name(String),
    /// Integer literal magnitude; a leading `-` is a separate token.
    Int(u128),
    /// Float literal.
    Float(f64),
    /// Text string literal (escapes already processed).
    Str(String),
    /// Byte string literal (escapes already processed).
    Bytes(Vec<u8>),
    /// Punctuation or operator.
    Op(&'static str),
}

impl Tok {
    /// Human-readable rendering for error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Name(n) => n.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Str(_) => "string".to_owned(),
            Self::Bytes(_) => "bytes".to_owned(),
            Self::Op(op) => format!("'{op}'"),
        }
    }
}

/// Multi-character operators first so the longest match wins.
const OPERATORS: &[&str] = &[
    "**", "//", "(", ")", "[", "]", "{", "}", ",", ":", "+", "-", "*", "/", "%", "=",
];

/// Splits `src` into `(offset, token)` pairs.
pub(crate) fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, LiteralError> {
    let mut lexer = Lexer { src, pos: 0 };
    let mut out = Vec::new();
    while let Some(item) = lexer.next_token()? {
        out.push(item);
    }
    Ok(out)
}

/// Cursor over the source text.
struct Lexer<'a> {
    /// Complete input.
    src: &'a str,
    /// Byte offset of the next unread character.
    pos: usize,
}

impl Lexer<'_> {
    /// Unread remainder of the input.
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    /// Next character without consuming it.
    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Character `n` positions ahead.
    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    /// Consumes one character.
    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    /// Reads the next token, or `None` at end of input.
    fn next_token(&mut self) -> Result<Option<(usize, Tok)>, LiteralError> {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.bump();
            } else if ch == '\\' && matches!(self.peek_at(1), Some('\n' | '\r')) {
                // explicit line continuation
                self.bump();
            } else {
                break;
            }
        }
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        if ch.is_ascii_digit() || (ch == '.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            return self.number(start).map(|t| Some((start, t)));
        }

        if ch.is_alphabetic() || ch == '_' {
            if let Some(tok) = self.prefixed_string(start)? {
                return Ok(Some((start, tok)));
            }
            let name = self.take_while(|c| c.is_alphanumeric() || c == '_');
            return Ok(Some((start, Tok::Name(name.to_owned()))));
        }

        if ch == '\'' || ch == '"' {
            return self
                .string(start, false, false)
                .map(|t| Some((start, t)));
        }

        for op in OPERATORS {
            if self.rest().starts_with(op) {
                self.pos += op.len();
                return Ok(Some((start, Tok::Op(op))));
            }
        }

        Err(LiteralError::UnexpectedChar { ch, offset: start })
    }

    /// Consumes characters while `f` holds and returns them.
    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &str {
        let start = self.pos;
        while self.peek().is_some_and(&f) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    /// Handles `b'..'`, `r'..'`, `rb'..'`, `br'..'` and `u'..'`.
    fn prefixed_string(&mut self, start: usize) -> Result<Option<Tok>, LiteralError> {
        let prefix: String = self
            .rest()
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .take(3)
            .collect();
        let lower = prefix.to_ascii_lowercase();
        for (p, raw, bytes) in [
            ("rb", true, true),
            ("br", true, true),
            ("b", false, true),
            ("r", true, false),
            ("u", false, false),
        ] {
            if lower.starts_with(p) {
                let after = self.rest()[p.len()..].chars().next();
                if matches!(after, Some('\'' | '"')) {
                    self.pos += p.len();
                    return self.string(start, raw, bytes).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Reads a quoted literal starting at the opening quote.
    fn string(&mut self, start: usize, raw: bool, bytes: bool) -> Result<Tok, LiteralError> {
        let quote = self.bump().ok_or(LiteralError::UnexpectedEof)?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut text = String::new();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let ch = self.bump().ok_or(LiteralError::UnterminatedString(start))?;
            if ch == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    break;
                }
            } else if (ch == '\n' || ch == '\r') && !triple {
                return Err(LiteralError::UnterminatedString(start));
            }

            if ch == quote {
                push_char(&mut text, &mut buf, bytes, ch)?;
                continue;
            }

            if ch == '\\' {
                if raw {
                    push_char(&mut text, &mut buf, bytes, '\\')?;
                    let next = self.bump().ok_or(LiteralError::UnterminatedString(start))?;
                    push_char(&mut text, &mut buf, bytes, next)?;
                } else {
                    self.escape(&mut text, &mut buf, bytes)?;
                }
                continue;
            }
            push_char(&mut text, &mut buf, bytes, ch)?;
        }

        Ok(if bytes { Tok::Bytes(buf) } else { Tok::Str(text) })
    }

    /// Decodes one backslash escape.
    fn escape(&mut self, text: &mut String, buf: &mut Vec<u8>, bytes: bool) -> Result<(), LiteralError> {
        let ch = self.bump().ok_or(LiteralError::UnexpectedEof)?;
        let simple = match ch {
            '\n' => return Ok(()),
            '\r' => {
                if self.peek() == Some('\n') {
                    self.bump();
                }
                return Ok(());
            }
            '\\' => Some('\\'),
            '\'' => Some('\''),
            '"' => Some('"'),
            'a' => Some('\x07'),
            'b' => Some('\x08'),
            'f' => Some('\x0c'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0b'),
            _ => None,
        };
        if let Some(c) = simple {
            return push_char(text, buf, bytes, c);
        }

        match ch {
            '0'..='7' => {
                let mut code = ch.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            self.bump();
                        }
                        None => break,
                    }
                }
                push_code(text, buf, bytes, code, "\\ooo")
            }
            'x' => {
                let code = self.hex_digits(2, "\\x")?;
                push_code(text, buf, bytes, code, "\\x")
            }
            'u' | 'U' if !bytes => {
                let width = if ch == 'u' { 4 } else { 8 };
                let code = self.hex_digits(width, if ch == 'u' { "\\u" } else { "\\U" })?;
                push_code(text, buf, bytes, code, "\\u")
            }
            'N' if !bytes => Err(LiteralError::InvalidEscape("\\N{...}".to_owned())),
            other => {
                // unknown escapes keep the backslash
                push_char(text, buf, bytes, '\\')?;
                push_char(text, buf, bytes, other)
            }
        }
    }

    /// Reads exactly `n` hex digits.
    fn hex_digits(&mut self, n: usize, what: &str) -> Result<u32, LiteralError> {
        let mut code = 0u32;
        for _ in 0..n {
            let d = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| LiteralError::InvalidEscape(what.to_owned()))?;
            self.bump();
            code = code * 16 + d;
        }
        Ok(code)
    }

    /// Reads an integer or float literal.
    fn number(&mut self, start: usize) -> Result<Tok, LiteralError> {
        let rest = self.rest();
        if rest.len() > 1 && rest.starts_with('0') {
            let radix = match rest.as_bytes()[1] {
                b'x' | b'X' => Some(16),
                b'o' | b'O' => Some(8),
                b'b' | b'B' => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                let cleaned = digits.replace('_', "");
                let literal = &self.src[start..self.pos];
                if cleaned.is_empty() {
                    return Err(LiteralError::InvalidNumber(literal.to_owned()));
                }
                return u128::from_str_radix(&cleaned, radix)
                    .map(Tok::Int)
                    .map_err(|e| number_error(literal, e.kind()));
            }
        }

        let mut is_float = false;
        self.take_while(|c| c.is_ascii_digit() || c == '_');
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            self.take_while(|c| c.is_ascii_digit() || c == '_');
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = matches!(self.peek_at(1), Some('+' | '-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.bump();
                if sign {
                    self.bump();
                }
                self.take_while(|c| c.is_ascii_digit() || c == '_');
            }
        }

        let literal = &self.src[start..self.pos];
        if matches!(self.peek(), Some('j' | 'J')) || self.peek().is_some_and(char::is_alphanumeric) {
            return Err(LiteralError::InvalidNumber(format!(
                "{literal}{}",
                self.peek().unwrap_or_default()
            )));
        }
        let cleaned = literal.replace('_', "");
        if is_float {
            cleaned
                .parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| LiteralError::InvalidNumber(literal.to_owned()))
        } else {
            if cleaned.len() > 1 && cleaned.starts_with('0') && cleaned.bytes().any(|b| b != b'0') {
                // leading zeros are not valid decimal integers
                return Err(LiteralError::InvalidNumber(literal.to_owned()));
            }
            cleaned
                .parse::<u128>()
                .map(Tok::Int)
                .map_err(|e| number_error(literal, e.kind()))
        }
    }
}

/// Maps an integer parse failure to a literal error.
fn number_error(literal: &str, kind: &std::num::IntErrorKind) -> LiteralError {
    use std::num::IntErrorKind;
    match kind {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            LiteralError::IntegerOverflow(literal.to_owned())
        }
        _ => LiteralError::InvalidNumber(literal.to_owned()),
    }
}

/// Appends a character to the text or byte buffer.
fn push_char(text: &mut String, buf: &mut Vec<u8>, bytes: bool, ch: char) -> Result<(), LiteralError> {
    if bytes {
        let b = u8::try_from(u32::from(ch))
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| LiteralError::InvalidEscape(format!("non-ASCII {ch:?} in bytes")))?;
        buf.push(b);
    } else {
        text.push(ch);
    }
    Ok(())
}

/// Appends a numeric escape to the text or byte buffer.
fn push_code(
    text: &mut String,
    buf: &mut Vec<u8>,
    bytes: bool,
    code: u32,
    what: &str,
) -> Result<(), LiteralError> {
    if bytes {
        let b = u8::try_from(code).map_err(|_| LiteralError::InvalidEscape(what.to_owned()))?;
        buf.push(b);
    } else {
        let ch = char::from_u32(code).ok_or_else(|| LiteralError::InvalidEscape(what.to_owned()))?;
        text.push(ch);
    }
    Ok(())
}
