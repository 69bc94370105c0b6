//! Whole format strings: split into literal and specifier segments, decode an argument
//! buffer against them, and render the result.

use crate::arg::{ArgStatus, DecodedArg};
use crate::format_spec::{split_format_string, FormatSpec, Segment};
use chrono::NaiveDateTime;
use std::sync::Arc;

/// A parsed format string such as `"%s: %d bytes"`.
#[derive(Debug, Clone)]
pub struct FormatString {
    text: String,
    segments: Vec<Segment>,
    specs: Vec<Arc<FormatSpec>>,
}

/// Sort key for a decode attempt; higher wins.
///
/// Field order is fixed: clean decode, no leftover bytes, fewest failed arguments,
/// most arguments, latest removal date (entries still present rank as [`NaiveDateTime::MAX`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    pub ok: bool,
    pub decoded_all_data: bool,
    pub negated_errors: i64,
    pub arg_count: usize,
    pub date_removed: NaiveDateTime,
}

/// One message rendered against one candidate format string.
#[derive(Debug, Clone)]
pub struct FormattedString {
    pub text: String,
    pub args: Vec<DecodedArg>,
    /// Argument bytes no specifier consumed.
    pub remaining: Vec<u8>,
}

impl FormattedString {
    /// Every argument decoded and every byte was used.
    pub fn ok(&self) -> bool {
        self.args.iter().all(DecodedArg::ok) && self.remaining.is_empty()
    }

    pub fn score(&self, date_removed: Option<NaiveDateTime>) -> Score {
        Score {
            ok: self.ok(),
            decoded_all_data: self.remaining.is_empty(),
            negated_errors: -(self.args.iter().filter(|a| !a.ok()).count() as i64),
            arg_count: self.args.len(),
            date_removed: date_removed.unwrap_or(NaiveDateTime::MAX),
        }
    }
}

impl FormatString {
    pub fn new(text: &str) -> FormatString {
        let (segments, specs) = split_format_string(text);
        FormatString {
            text: text.to_string(),
            segments,
            specs: specs.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn specifiers(&self) -> &[Arc<FormatSpec>] {
        &self.specs
    }

    /// Decode every specifier in order from `data`.
    ///
    /// Once one argument fails, every later argument is still decoded but also marked
    /// [`ArgStatus::SKIPPED`]. Returns the arguments and the unconsumed bytes.
    pub fn decode(&self, data: &[u8]) -> (Vec<DecodedArg>, Vec<u8>) {
        let mut rest = data;
        let mut failed = false;
        let mut args = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let mut arg = spec.decode(rest);
            rest = &rest[arg.consumed()..];
            if failed {
                arg = arg.with_status(ArgStatus::SKIPPED);
            }
            failed |= !arg.ok();
            args.push(arg);
        }
        (args, rest.to_vec())
    }

    /// Decode `data` and render the message.
    ///
    /// Failed arguments render as diagnostics when `show_errors` is set; otherwise the
    /// original specifier text is left in place.
    pub fn format(&self, data: &[u8], show_errors: bool) -> FormattedString {
        let (args, remaining) = self.decode(data);
        let mut text = String::with_capacity(self.text.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Spec(i) => match args.get(*i) {
                    Some(arg) if show_errors || arg.ok() => text.push_str(&arg.format()),
                    Some(arg) => text.push_str(arg.spec.specifier()),
                    None => {}
                },
            }
        }
        FormattedString { text, args, remaining }
    }
}
