//! Wire protocol for driving a MicroPython / CircuitPython raw REPL.
//!
//! The device side prints one result per line, tagged with the
//! [`SENTINEL`] prefix so results can be told apart from ordinary program
//! output:
//!
//! ```text
//! _BELAYR<ref-id?>|<timestamp-ms?>|<payload>    result
//! _BELAYS                                       end of a stream
//! ```
//!
//! Payloads are interpreter literals. [`Value`] models the closed set of
//! literal kinds that cross the boundary, [`parse_literal`] decodes them
//! without evaluating anything, and [`eval_trusted`] is the opt-in evaluator
//! that accepts a wider expression language.

mod command;
mod control;
mod error;
mod lexer;
mod literal;
mod response;
mod value;

pub use command::{Shape, is_expression, wrap_expression, wrap_stream};
pub use control::{
    CTRL_ENTER_RAW, CTRL_EOT, CTRL_EXIT_RAW, CTRL_INTERRUPT, CTRL_PASTE, PASTE_ACK_SUPPORTED,
    PASTE_ACK_UNSUPPORTED, PASTE_REQUEST, PASTE_WINDOW_GRANT, RAW_BANNER, RAW_PROMPT,
    SOFT_REBOOT,
};
pub use error::{FramingError, LiteralError};
pub use literal::{MAX_DEPTH, decode, eval_trusted, parse_literal};
pub use response::{Response, ResultLine, SENTINEL, parse_line};
pub use value::Value;
