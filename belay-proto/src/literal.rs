//! Literal decoding and the opt-in trusted evaluator.
//!
//! Both entry points share one recursive-descent parser. In safe mode the
//! parser accepts exactly the interpreter's literal grammar: constants,
//! strings, numbers with a unary sign, and containers built from those, plus
//! `set()`. Trusted mode widens it to arithmetic and a fixed table of
//! builtin constructors so reprs such as `bytearray(b'..')` or `inf` decode.

use crate::{
    error::LiteralError,
    lexer::{Tok, tokenize},
    value::Value,
};

/// Upper bound on the length of a sequence built by the trusted evaluator.
const MAX_BUILT_LEN: usize = 1 << 20;

/// Deepest nesting of containers and operators a payload may use.
pub const MAX_DEPTH: usize = 256;

/// Decodes a literal payload without evaluating anything.
pub fn parse_literal(src: &str) -> Result<Value, LiteralError> {
    Parser::new(src, false)?.parse_all()
}

/// Evaluates a payload with the wider trusted grammar.
///
/// Only use this on output from a device you control.
pub fn eval_trusted(src: &str) -> Result<Value, LiteralError> {
    Parser::new(src, true)?.parse_all()
}

/// Decodes a result payload with the evaluator selected by `trusted`.
pub fn decode(payload: &str, trusted: bool) -> Result<Value, LiteralError> {
    if trusted {
        eval_trusted(payload)
    } else {
        parse_literal(payload)
    }
}

/// Token cursor.
struct Parser {
    /// Tokens with their byte offsets.
    toks: Vec<(usize, Tok)>,
    /// Index of the next unread token.
    pos: usize,
    /// Whether the trusted grammar is enabled.
    trusted: bool,
    /// Current recursion depth.
    depth: usize,
}

impl Parser {
    /// Tokenizes `src`.
    fn new(src: &str, trusted: bool) -> Result<Self, LiteralError> {
        Ok(Self {
            toks: tokenize(src)?,
            pos: 0,
            trusted,
            depth: 0,
        })
    }

    /// Parses a full payload; a bare top-level comma list is a tuple.
    fn parse_all(mut self) -> Result<Value, LiteralError> {
        let first = self.expr()?;
        let value = if self.eat_op(",") {
            let mut items = vec![first];
            while !self.at_end() {
                items.push(self.expr()?);
                if !self.eat_op(",") {
                    break;
                }
            }
            Value::Tuple(items)
        } else {
            first
        };
        match self.toks.get(self.pos) {
            None => Ok(value),
            Some((offset, tok)) => Err(LiteralError::UnexpectedToken {
                found: tok.describe(),
                offset: *offset,
            }),
        }
    }

    /// Returns `true` when all tokens are consumed.
    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    /// Peeks at the next token.
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(_, t)| t)
    }

    /// Returns `true` if the next token is operator `op`.
    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Tok::Op(o)) if *o == op)
    }

    /// Consumes operator `op` if it is next.
    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes the next token.
    fn advance(&mut self) -> Result<(usize, Tok), LiteralError> {
        let item = self
            .toks
            .get(self.pos)
            .cloned()
            .ok_or(LiteralError::UnexpectedEof)?;
        self.pos += 1;
        Ok(item)
    }

    /// Consumes operator `op` or fails.
    fn expect_op(&mut self, op: &str) -> Result<(), LiteralError> {
        let (offset, tok) = self.advance()?;
        match tok {
            Tok::Op(o) if o == op => Ok(()),
            other => Err(LiteralError::UnexpectedToken {
                found: other.describe(),
                offset,
            }),
        }
    }

    /// Rejects `what` unless the trusted grammar is enabled.
    fn require_trusted(&self, what: &str) -> Result<(), LiteralError> {
        if self.trusted {
            Ok(())
        } else {
            Err(LiteralError::NotLiteral(what.to_owned()))
        }
    }

    /// Runs `f` one level deeper, failing past [`MAX_DEPTH`].
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, LiteralError>,
    ) -> Result<T, LiteralError> {
        if self.depth >= MAX_DEPTH {
            return Err(LiteralError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    /// One expression, counted against the nesting limit.
    fn expr(&mut self) -> Result<Value, LiteralError> {
        self.nested(Self::sum)
    }

    /// `sum := term (('+' | '-') term)*`
    fn sum(&mut self) -> Result<Value, LiteralError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.peek_op("+") {
                "+"
            } else if self.peek_op("-") {
                "-"
            } else {
                return Ok(lhs);
            };
            self.require_trusted(&format!("operator '{op}'"))?;
            self.pos += 1;
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs)?;
        }
    }

    /// `term := unary (('*' | '/' | '//' | '%') unary)*`
    fn term(&mut self) -> Result<Value, LiteralError> {
        let mut lhs = self.unary()?;
        loop {
            let Some(op) = ["*", "/", "//", "%"].into_iter().find(|op| self.peek_op(op)) else {
                return Ok(lhs);
            };
            self.require_trusted(&format!("operator '{op}'"))?;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs)?;
        }
    }

    /// `unary := ('+' | '-') unary | power`
    ///
    /// Safe mode allows a single sign directly in front of a number.
    fn unary(&mut self) -> Result<Value, LiteralError> {
        let negate = if self.peek_op("-") {
            true
        } else if self.peek_op("+") {
            false
        } else {
            return self.power();
        };
        self.pos += 1;

        // The sign joins the digits so the most negative integer fits.
        if let Some(&Tok::Int(magnitude)) = self.peek() {
            let powered = matches!(self.toks.get(self.pos + 1), Some((_, Tok::Op("**"))));
            if !(self.trusted && powered) {
                self.pos += 1;
                return if negate {
                    0i128
                        .checked_sub_unsigned(magnitude)
                        .map(Value::Int)
                        .ok_or_else(|| LiteralError::IntegerOverflow(format!("-{magnitude}")))
                } else {
                    int_value(magnitude)
                };
            }
        }

        let operand = if self.trusted {
            self.nested(Self::unary)?
        } else {
            let (offset, tok) = self.advance()?;
            match tok {
                Tok::Int(i) => int_value(i)?,
                Tok::Float(x) => Value::Float(x),
                other => {
                    return Err(LiteralError::UnexpectedToken {
                        found: other.describe(),
                        offset,
                    });
                }
            }
        };

        if !negate {
            return match operand {
                Value::Int(_) | Value::Float(_) => Ok(operand),
                Value::Bool(b) => Ok(Value::Int(i128::from(b))),
                other => Err(LiteralError::Type(format!("bad operand for unary +: {}", other.kind()))),
            };
        }
        match operand {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| LiteralError::IntegerOverflow(format!("-{i}"))),
            Value::Float(x) => Ok(Value::Float(-x)),
            Value::Bool(b) => Ok(Value::Int(-i128::from(b))),
            other => Err(LiteralError::Type(format!("bad operand for unary -: {}", other.kind()))),
        }
    }

    /// `power := atom ('**' unary)?`
    fn power(&mut self) -> Result<Value, LiteralError> {
        let base = self.atom()?;
        if self.peek_op("**") {
            self.require_trusted("operator '**'")?;
            self.pos += 1;
            let exp = self.nested(Self::unary)?;
            return binary("**", base, exp);
        }
        Ok(base)
    }

    /// Constants, names, calls and container displays.
    fn atom(&mut self) -> Result<Value, LiteralError> {
        let (offset, tok) = self.advance()?;
        match tok {
            Tok::Int(i) => int_value(i),
            Tok::Float(x) => Ok(Value::Float(x)),
            Tok::Str(mut s) => {
                while let Some(Tok::Str(more)) = self.peek() {
                    s.push_str(more);
                    self.pos += 1;
                }
                if matches!(self.peek(), Some(Tok::Bytes(_))) {
                    return Err(LiteralError::Type("cannot mix bytes and str literals".to_owned()));
                }
                Ok(Value::Str(s))
            }
            Tok::Bytes(mut b) => {
                while let Some(Tok::Bytes(more)) = self.peek() {
                    b.extend_from_slice(more);
                    self.pos += 1;
                }
                if matches!(self.peek(), Some(Tok::Str(_))) {
                    return Err(LiteralError::Type("cannot mix bytes and str literals".to_owned()));
                }
                Ok(Value::Bytes(b))
            }
            Tok::Op("(") => self.paren(),
            Tok::Op("[") => {
                let items = self.items("]")?;
                Ok(Value::List(items))
            }
            Tok::Op("{") => self.brace(),
            Tok::Name(name) => self.name(&name, offset),
            other => Err(LiteralError::UnexpectedToken {
                found: other.describe(),
                offset,
            }),
        }
    }

    /// Comma-separated expressions up to `close`, trailing comma allowed.
    fn items(&mut self, close: &str) -> Result<Vec<Value>, LiteralError> {
        let mut items = Vec::new();
        loop {
            if self.eat_op(close) {
                return Ok(items);
            }
            items.push(self.expr()?);
            if !self.eat_op(",") {
                self.expect_op(close)?;
                return Ok(items);
            }
        }
    }

    /// After `(`: empty tuple, grouping, or tuple display.
    fn paren(&mut self) -> Result<Value, LiteralError> {
        if self.eat_op(")") {
            return Ok(Value::Tuple(Vec::new()));
        }
        let first = self.expr()?;
        if self.eat_op(")") {
            return Ok(first);
        }
        self.expect_op(",")?;
        let mut items = vec![first];
        items.extend(self.items(")")?);
        Ok(Value::Tuple(items))
    }

    /// After `{`: dict or set display.
    fn brace(&mut self) -> Result<Value, LiteralError> {
        if self.eat_op("}") {
            return Ok(Value::Dict(Vec::new()));
        }
        let first = self.expr()?;
        if !self.eat_op(":") {
            let mut items = vec![first];
            if self.eat_op(",") {
                items.extend(self.items("}")?);
            } else {
                self.expect_op("}")?;
            }
            return Ok(Value::Set(dedup(items)));
        }

        let mut pairs: Vec<(Value, Value)> = Vec::new();
        let value = self.expr()?;
        insert_pair(&mut pairs, first, value);
        loop {
            if self.eat_op("}") {
                return Ok(Value::Dict(pairs));
            }
            self.expect_op(",")?;
            if self.eat_op("}") {
                return Ok(Value::Dict(pairs));
            }
            let key = self.expr()?;
            self.expect_op(":")?;
            let value = self.expr()?;
            insert_pair(&mut pairs, key, value);
        }
    }

    /// Resolves a bare name or a call.
    fn name(&mut self, name: &str, offset: usize) -> Result<Value, LiteralError> {
        if self.peek_op("(") {
            self.pos += 1;
            if !self.trusted {
                if name == "set" && self.eat_op(")") {
                    return Ok(Value::Set(Vec::new()));
                }
                return Err(LiteralError::NotLiteral(format!("call to {name}()")));
            }
            let (args, kwargs) = self.call_args()?;
            return call(name, args, kwargs);
        }

        match name {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "inf" if self.trusted => Ok(Value::Float(f64::INFINITY)),
            "nan" if self.trusted => Ok(Value::Float(f64::NAN)),
            _ if self.trusted => Err(LiteralError::Unsupported(format!("name {name:?}"))),
            _ => Err(LiteralError::NotLiteral(format!("name {name:?} at offset {offset}"))),
        }
    }

    /// Positional and keyword arguments up to `)`.
    fn call_args(&mut self) -> Result<(Vec<Value>, Vec<(String, Value)>), LiteralError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        loop {
            if self.eat_op(")") {
                return Ok((args, kwargs));
            }
            let keyword = match (self.toks.get(self.pos), self.toks.get(self.pos + 1)) {
                (Some((_, Tok::Name(n))), Some((_, Tok::Op("=")))) => Some(n.clone()),
                _ => None,
            };
            if let Some(key) = keyword {
                self.pos += 2;
                kwargs.push((key, self.expr()?));
            } else {
                args.push(self.expr()?);
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                return Ok((args, kwargs));
            }
        }
    }
}

/// Converts an unsigned integer token to a value.
fn int_value(magnitude: u128) -> Result<Value, LiteralError> {
    i128::try_from(magnitude)
        .map(Value::Int)
        .map_err(|_| LiteralError::IntegerOverflow(magnitude.to_string()))
}

/// Keeps the first occurrence of every element.
fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Later keys overwrite earlier ones in place.
fn insert_pair(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if let Some(slot) = pairs.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = value;
    } else {
        pairs.push((key, value));
    }
}

/// Numeric view of a value for arithmetic.
#[derive(Debug, Clone, Copy)]
enum Num {
    /// Integer (booleans widen to this).
    Int(i128),
    /// Float.
    Float(f64),
}

impl Num {
    /// Returns the numeric view, if any.
    fn of(v: &Value) -> Option<Self> {
        match v {
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Bool(b) => Some(Self::Int(i128::from(*b))),
            Value::Float(x) => Some(Self::Float(*x)),
            _ => None,
        }
    }

    /// Widens to a float.
    #[allow(clippy::cast_precision_loss)]
    fn float(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(x) => x,
        }
    }
}

/// Applies a binary operator.
fn binary(op: &str, lhs: Value, rhs: Value) -> Result<Value, LiteralError> {
    if let (Some(a), Some(b)) = (Num::of(&lhs), Num::of(&rhs)) {
        return arith(op, a, b);
    }
    let type_error = |lhs: &Value, rhs: &Value| {
        LiteralError::Type(format!(
            "unsupported operand types for {op}: {} and {}",
            lhs.kind(),
            rhs.kind()
        ))
    };
    match (op, lhs, rhs) {
        ("+", Value::Str(mut a), Value::Str(b)) => {
            a.push_str(&b);
            Ok(Value::Str(a))
        }
        ("+", Value::Bytes(mut a), Value::Bytes(b)) => {
            a.extend(b);
            Ok(Value::Bytes(a))
        }
        ("+", Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        ("+", Value::Tuple(mut a), Value::Tuple(b)) => {
            a.extend(b);
            Ok(Value::Tuple(a))
        }
        ("*", seq, Value::Int(n)) | ("*", Value::Int(n), seq) if Num::of(&seq).is_none() => {
            repeat(seq, n)
        }
        (_, lhs, rhs) => Err(type_error(&lhs, &rhs)),
    }
}

/// Sequence repetition; non-positive counts give an empty sequence.
fn repeat(seq: Value, n: i128) -> Result<Value, LiteralError> {
    let count = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
    let check = |len: usize| {
        if len.saturating_mul(count) > MAX_BUILT_LEN {
            Err(LiteralError::Unsupported("sequence repetition is too large".to_owned()))
        } else {
            Ok(())
        }
    };
    match seq {
        Value::Str(s) => {
            check(s.len())?;
            Ok(Value::Str(s.repeat(count)))
        }
        Value::Bytes(b) => {
            check(b.len())?;
            Ok(Value::Bytes(b.repeat(count)))
        }
        Value::List(v) => {
            check(v.len())?;
            Ok(Value::List(repeat_items(&v, count)))
        }
        Value::Tuple(v) => {
            check(v.len())?;
            Ok(Value::Tuple(repeat_items(&v, count)))
        }
        other => Err(LiteralError::Type(format!(
            "can't multiply sequence of type {}",
            other.kind()
        ))),
    }
}

/// Concatenates `count` clones of `items`; the caller bounds the total.
fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    items.iter().cloned().cycle().take(items.len() * count).collect()
}

/// Numeric arithmetic with the interpreter's floor semantics.
fn arith(op: &str, a: Num, b: Num) -> Result<Value, LiteralError> {
    let overflow = || LiteralError::IntegerOverflow(format!("{} {op} {}", a.float(), b.float()));
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return match op {
            "+" => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            "-" => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            "*" => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            "/" if y == 0 => Err(LiteralError::ZeroDivision),
            "/" => Ok(Value::Float(a.float() / b.float())),
            "//" | "%" if y == 0 => Err(LiteralError::ZeroDivision),
            "//" => {
                let q = x.checked_div(y).ok_or_else(overflow)?;
                let floor = if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q };
                Ok(Value::Int(floor))
            }
            "%" => {
                let r = x.checked_rem(y).ok_or_else(overflow)?;
                let modulo = if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r };
                Ok(Value::Int(modulo))
            }
            "**" if y >= 0 => {
                let exp = u32::try_from(y).map_err(|_| overflow())?;
                x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
            }
            "**" if x == 0 => Err(LiteralError::ZeroDivision),
            "**" => Ok(Value::Float(a.float().powf(b.float()))),
            _ => Err(LiteralError::Unsupported(format!("operator '{op}'"))),
        };
    }

    let (x, y) = (a.float(), b.float());
    match op {
        "+" => Ok(Value::Float(x + y)),
        "-" => Ok(Value::Float(x - y)),
        "*" => Ok(Value::Float(x * y)),
        "/" | "//" | "%" if y == 0.0 => Err(LiteralError::ZeroDivision),
        "/" => Ok(Value::Float(x / y)),
        "//" => Ok(Value::Float((x / y).floor())),
        "%" => {
            let r = x % y;
            Ok(Value::Float(if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }))
        }
        "**" if x == 0.0 && y < 0.0 => Err(LiteralError::ZeroDivision),
        "**" => Ok(Value::Float(x.powf(y))),
        _ => Err(LiteralError::Unsupported(format!("operator '{op}'"))),
    }
}

/// Elements produced by iterating a value.
fn iterate(v: Value) -> Result<Vec<Value>, LiteralError> {
    match v {
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => Ok(items),
        Value::Dict(pairs) => Ok(pairs.into_iter().map(|(k, _)| k).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Bytes(b) => Ok(b.into_iter().map(|x| Value::Int(i128::from(x))).collect()),
        other => Err(LiteralError::Type(format!("'{}' object is not iterable", other.kind()))),
    }
}

/// Evaluates a call to one of the known builtin constructors.
fn call(
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, LiteralError> {
    if !kwargs.is_empty() && name != "dict" {
        return Err(LiteralError::Unsupported(format!(
            "keyword arguments to {name}()"
        )));
    }
    let arity = |max: usize| {
        if args.len() > max {
            Err(LiteralError::Type(format!(
                "{name}() takes at most {max} arguments ({} given)",
                args.len()
            )))
        } else {
            Ok(())
        }
    };

    match name {
        "set" | "frozenset" => {
            arity(1)?;
            let items = args.into_iter().next().map(iterate).transpose()?;
            Ok(Value::Set(dedup(items.unwrap_or_default())))
        }
        "list" | "tuple" => {
            arity(1)?;
            let items = args
                .into_iter()
                .next()
                .map(iterate)
                .transpose()?
                .unwrap_or_default();
            Ok(if name == "list" { Value::List(items) } else { Value::Tuple(items) })
        }
        "dict" => {
            arity(1)?;
            let mut pairs = Vec::new();
            if let Some(src) = args.into_iter().next() {
                let entries = match src {
                    Value::Dict(p) => p,
                    other => iterate(other)?
                        .into_iter()
                        .map(|item| match iterate(item)?.as_slice() {
                            [k, v] => Ok((k.clone(), v.clone())),
                            _ => Err(LiteralError::Type(
                                "dictionary update sequence element has wrong length".to_owned(),
                            )),
                        })
                        .collect::<Result<_, _>>()?,
                };
                for (k, v) in entries {
                    insert_pair(&mut pairs, k, v);
                }
            }
            for (k, v) in kwargs {
                insert_pair(&mut pairs, Value::Str(k), v);
            }
            Ok(Value::Dict(pairs))
        }
        "bytes" | "bytearray" => {
            arity(2)?;
            let mut it = args.into_iter();
            match (it.next(), it.next()) {
                (None, _) => Ok(Value::Bytes(Vec::new())),
                (Some(Value::Bytes(b)), None) => Ok(Value::Bytes(b)),
                (Some(Value::Str(s)), Some(Value::Str(_))) => Ok(Value::Bytes(s.into_bytes())),
                (Some(Value::Int(n)), None) => {
                    let len = usize::try_from(n)
                        .ok()
                        .filter(|n| *n <= MAX_BUILT_LEN)
                        .ok_or_else(|| LiteralError::Unsupported(format!("{name}({n})")))?;
                    Ok(Value::Bytes(vec![0; len]))
                }
                (Some(src @ (Value::List(_) | Value::Tuple(_))), None) => iterate(src)?
                    .into_iter()
                    .map(|v| match v {
                        Value::Int(i) => u8::try_from(i).map_err(|_| {
                            LiteralError::Type("bytes must be in range(0, 256)".to_owned())
                        }),
                        other => Err(LiteralError::Type(format!(
                            "'{}' object cannot be interpreted as an integer",
                            other.kind()
                        ))),
                    })
                    .collect::<Result<Vec<u8>, _>>()
                    .map(Value::Bytes),
                _ => Err(LiteralError::Unsupported(format!("{name}() with these arguments"))),
            }
        }
        "float" => {
            arity(1)?;
            match args.into_iter().next() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float_text(&s).map(Value::Float),
                Some(v) => Num::of(&v)
                    .map(|n| Value::Float(n.float()))
                    .ok_or_else(|| LiteralError::Type(format!("float() argument: {}", v.kind()))),
            }
        }
        "int" => {
            arity(2)?;
            let mut it = args.into_iter();
            match (it.next(), it.next()) {
                (None, _) => Ok(Value::Int(0)),
                (Some(Value::Str(s)), base) => {
                    let radix = match base {
                        None => 10,
                        Some(Value::Int(b)) if (2..=36).contains(&b) => {
                            u32::try_from(b).unwrap_or(10)
                        }
                        Some(other) => {
                            return Err(LiteralError::Type(format!("int() base: {other}")));
                        }
                    };
                    let cleaned = s.trim().replace('_', "");
                    i128::from_str_radix(&cleaned, radix)
                        .map(Value::Int)
                        .map_err(|_| LiteralError::InvalidNumber(s.clone()))
                }
                (Some(Value::Float(x)), None) => float_to_int(x),
                (Some(v), None) => match Num::of(&v) {
                    Some(Num::Int(i)) => Ok(Value::Int(i)),
                    _ => Err(LiteralError::Type(format!("int() argument: {}", v.kind()))),
                },
                _ => Err(LiteralError::Type("int() can't convert non-string with explicit base".to_owned())),
            }
        }
        "str" => {
            arity(1)?;
            match args.into_iter().next() {
                None => Ok(Value::Str(String::new())),
                Some(Value::Str(s)) => Ok(Value::Str(s)),
                Some(other) => Ok(Value::Str(other.to_string())),
            }
        }
        "range" => {
            arity(3)?;
            let ints = args
                .iter()
                .map(|v| match Num::of(v) {
                    Some(Num::Int(i)) => Ok(i),
                    _ => Err(LiteralError::Type(format!(
                        "'{}' object cannot be interpreted as an integer",
                        v.kind()
                    ))),
                })
                .collect::<Result<Vec<i128>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(LiteralError::Type("range expected at least 1 argument".to_owned())),
            };
            if step == 0 {
                return Err(LiteralError::Type("range() arg 3 must not be zero".to_owned()));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                if out.len() >= MAX_BUILT_LEN {
                    return Err(LiteralError::Unsupported("range is too large".to_owned()));
                }
                out.push(Value::Int(i));
                i = i.checked_add(step).ok_or_else(|| LiteralError::IntegerOverflow(i.to_string()))?;
            }
            Ok(Value::List(out))
        }
        _ => Err(LiteralError::Unsupported(format!("call to {name}()"))),
    }
}

/// Parses the text forms accepted by `float(str)`.
fn parse_float_text(s: &str) -> Result<f64, LiteralError> {
    let t = s.trim();
    let (sign, body) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    match body.to_ascii_lowercase().as_str() {
        "inf" | "infinity" => Ok(sign * f64::INFINITY),
        "nan" => Ok(f64::NAN),
        other => other
            .replace('_', "")
            .parse::<f64>()
            .map(|x| sign * x)
            .map_err(|_| LiteralError::InvalidNumber(s.to_owned())),
    }
}

/// Truncates a finite float toward zero.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_int(x: f64) -> Result<Value, LiteralError> {
    if !x.is_finite() {
        return Err(LiteralError::Type(format!("cannot convert float {x} to integer")));
    }
    let t = x.trunc();
    if t.abs() >= i128::MAX as f64 {
        return Err(LiteralError::IntegerOverflow(x.to_string()));
    }
    Ok(Value::Int(t as i128))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scalars() {
        assert_eq!(parse_literal("None"), Ok(Value::None));
        assert_eq!(parse_literal("True"), Ok(Value::Bool(true)));
        assert_eq!(parse_literal("-7"), Ok(Value::Int(-7)));
        assert_eq!(parse_literal("+2.5"), Ok(Value::Float(2.5)));
        assert_eq!(parse_literal("'a' 'b'"), Ok(Value::from("ab")));
        assert_eq!(parse_literal("b'\\x01'"), Ok(Value::Bytes(vec![1])));
    }

    #[test]
    fn containers() {
        assert_eq!(
            parse_literal("[1, (2,), {3}, {'k': None},]"),
            Ok(Value::List(vec![
                Value::Int(1),
                Value::Tuple(vec![Value::Int(2)]),
                Value::Set(vec![Value::Int(3)]),
                Value::Dict(vec![(Value::from("k"), Value::None)]),
            ]))
        );
        assert_eq!(parse_literal("()"), Ok(Value::Tuple(vec![])));
        assert_eq!(parse_literal("{}"), Ok(Value::Dict(vec![])));
        assert_eq!(parse_literal("set()"), Ok(Value::Set(vec![])));
        assert_eq!(parse_literal("(1)"), Ok(Value::Int(1)));
        assert_eq!(
            parse_literal("1, 2"),
            Ok(Value::Tuple(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        assert_eq!(
            parse_literal("{1: 'a', 1: 'b'}"),
            Ok(Value::Dict(vec![(Value::Int(1), Value::from("b"))]))
        );
    }

    #[test]
    fn safe_mode_rejects_code() {
        for src in [
            "__import__('os')",
            "1 + 2",
            "x",
            "float('inf')",
            "--1",
            "2 ** 8",
            "bytearray(b'')",
            "inf",
        ] {
            assert!(parse_literal(src).is_err(), "{src} should be rejected");
        }
    }

    #[test]
    fn malformed_payloads() {
        assert_eq!(parse_literal(""), Err(LiteralError::UnexpectedEof));
        assert!(parse_literal("[1, 2").is_err());
        assert!(parse_literal("{1: }").is_err());
        assert!(parse_literal("1 2").is_err());
        assert!(parse_literal("'a' b'b'").is_err());
    }

    #[test]
    fn trusted_arithmetic() {
        assert_eq!(eval_trusted("1 + 2 * 3"), Ok(Value::Int(7)));
        assert_eq!(eval_trusted("-7 // 2"), Ok(Value::Int(-4)));
        assert_eq!(eval_trusted("-7 % 3"), Ok(Value::Int(2)));
        assert_eq!(eval_trusted("2 ** 10"), Ok(Value::Int(1024)));
        assert_eq!(eval_trusted("-2 ** 2"), Ok(Value::Int(-4)));
        assert_eq!(eval_trusted("1 / 4"), Ok(Value::Float(0.25)));
        assert_eq!(eval_trusted("'ab' * 2"), Ok(Value::from("abab")));
        assert_eq!(eval_trusted("1 // 0"), Err(LiteralError::ZeroDivision));
    }

    #[test]
    fn trusted_repeats_nested_sequences() {
        let inner = Value::List(vec![Value::Int(2)]);
        assert_eq!(
            eval_trusted("[1, [2]] * 3"),
            Ok(Value::List(vec![
                Value::Int(1),
                inner.clone(),
                Value::Int(1),
                inner.clone(),
                Value::Int(1),
                inner,
            ]))
        );
        assert_eq!(eval_trusted("(0,) * 0"), Ok(Value::Tuple(vec![])));
        assert_eq!(eval_trusted("2 * (None,)"), Ok(Value::Tuple(vec![Value::None, Value::None])));
        assert_eq!(eval_trusted("[] * 1000000000000"), Ok(Value::List(vec![])));
        assert!(matches!(eval_trusted("[0] * 1000000000000"), Err(LiteralError::Unsupported(_))));
    }

    #[test]
    fn nesting_is_bounded() {
        let shallow = format!("{}{}", "[".repeat(100), "]".repeat(100));
        assert!(parse_literal(&shallow).is_ok());

        let deep = format!("{}{}", "[".repeat(2000), "]".repeat(2000));
        assert_eq!(parse_literal(&deep), Err(LiteralError::TooDeep(MAX_DEPTH)));
        assert_eq!(eval_trusted(&deep), Err(LiteralError::TooDeep(MAX_DEPTH)));

        let parens = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
        assert_eq!(parse_literal(&parens), Err(LiteralError::TooDeep(MAX_DEPTH)));
        let signs = format!("{}1", "-".repeat(2000));
        assert_eq!(eval_trusted(&signs), Err(LiteralError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn integer_extremes() {
        let min = Value::Int(i128::MIN);
        assert_eq!(parse_literal(&min.to_string()), Ok(min.clone()));
        assert_eq!(eval_trusted(&min.to_string()), Ok(min));
        assert_eq!(parse_literal(&i128::MAX.to_string()), Ok(Value::Int(i128::MAX)));
        assert!(matches!(
            parse_literal("170141183460469231731687303715884105728"),
            Err(LiteralError::IntegerOverflow(_))
        ));
        assert!(matches!(
            eval_trusted("-170141183460469231731687303715884105728 ** 1"),
            Err(LiteralError::IntegerOverflow(_))
        ));
        assert_eq!(eval_trusted("-3 * 2"), Ok(Value::Int(-6)));
    }

    #[test]
    fn trusted_constructors() {
        assert_eq!(eval_trusted("bytearray(b'ab')"), Ok(Value::Bytes(b"ab".to_vec())));
        assert_eq!(eval_trusted("bytes([1, 2])"), Ok(Value::Bytes(vec![1, 2])));
        assert_eq!(eval_trusted("inf"), Ok(Value::Float(f64::INFINITY)));
        assert_eq!(eval_trusted("float('-inf')"), Ok(Value::Float(f64::NEG_INFINITY)));
        assert_eq!(eval_trusted("int('ff', 16)"), Ok(Value::Int(255)));
        assert_eq!(
            eval_trusted("frozenset({1, 1, 2})"),
            Ok(Value::Set(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(
            eval_trusted("dict([('a', 1)], b=2)"),
            Ok(Value::Dict(vec![
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
            ]))
        );
        assert_eq!(
            eval_trusted("list(range(3))"),
            Ok(Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)]))
        );
        assert!(matches!(eval_trusted("float('nan')"), Ok(Value::Float(x)) if x.is_nan()));
    }

    #[test]
    fn trusted_rejects_unknown_names() {
        assert!(matches!(eval_trusted("open('x')"), Err(LiteralError::Unsupported(_))));
        assert!(matches!(eval_trusted("os"), Err(LiteralError::Unsupported(_))));
    }

    #[test]
    fn decode_selects_evaluator() {
        assert!(decode("1 + 1", false).is_err());
        assert_eq!(decode("1 + 1", true), Ok(Value::Int(2)));
    }

    /// Values whose rendering parses back to an equal value.
    fn literal_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::None),
            any::<bool>().prop_map(Value::Bool),
            any::<i128>().prop_map(Value::Int),
            any::<f64>().prop_filter("finite", |x| x.is_finite()).prop_map(Value::Float),
            ".*".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
                proptest::collection::vec(hashable(), 0..6)
                    .prop_map(|items| Value::Set(dedup(items))),
                proptest::collection::vec((any::<i32>(), inner), 0..6).prop_map(|pairs| {
                    let mut out = Vec::new();
                    for (k, v) in pairs {
                        insert_pair(&mut out, Value::from(k), v);
                    }
                    Value::Dict(out)
                }),
            ]
        })
    }

    /// Scalars that may sit in a set.
    fn hashable() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(|i| Value::Int(i128::from(i))),
            "[a-z]{0,4}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..4).prop_map(Value::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn rendered_literals_parse_back(v in literal_value()) {
            let text = v.to_string();
            prop_assert_eq!(parse_literal(&text), Ok(v.clone()));
            prop_assert_eq!(eval_trusted(&text), Ok(v));
        }
    }
}
