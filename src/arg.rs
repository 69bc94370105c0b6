//! Decode one argument from the packed buffer according to its [`FormatSpec`].
//!
//! Decoding never fails outright: every problem is recorded in the returned
//! [`DecodedArg`]'s status bits and error text, so that all specifiers of every colliding
//! candidate string can be attempted and scored.

use crate::format_spec::{ArgKind, Count, FormatSpec};
use crate::varint::{decode_varint, zigzag_decode, VarintRead};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Bitmask describing how decoding went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ArgStatus(u8);

impl ArgStatus {
    pub const OK: ArgStatus = ArgStatus(0);
    /// No bytes were left for this argument.
    pub const MISSING: ArgStatus = ArgStatus(1);
    /// The encoder cut the string short; still usable.
    pub const TRUNCATED: ArgStatus = ArgStatus(2);
    pub const DECODE_ERROR: ArgStatus = ArgStatus(4);
    /// An earlier argument in the same message failed.
    pub const SKIPPED: ArgStatus = ArgStatus(8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ArgStatus) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ArgStatus {
    type Output = ArgStatus;

    fn bitor(self, rhs: ArgStatus) -> ArgStatus {
        ArgStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for ArgStatus {
    fn bitor_assign(&mut self, rhs: ArgStatus) {
        self.0 |= rhs.0;
    }
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Char(char),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Signed(v) => write!(f, "{}", v),
            ArgValue::Unsigned(v) => write!(f, "{}", v),
            ArgValue::Float(v) => write!(f, "{}", v),
            ArgValue::Char(c) => write!(f, "{}", c),
            ArgValue::Str(s) => f.write_str(s),
        }
    }
}

/// Result of decoding one specifier occurrence.
#[derive(Debug, Clone)]
pub struct DecodedArg {
    pub spec: Arc<FormatSpec>,
    pub value: Option<ArgValue>,
    /// Value read for a `*` width.
    pub width: Option<i64>,
    /// Value read for a `.*` precision.
    pub precision: Option<i64>,
    /// Bytes consumed from the argument buffer, including any `*` arguments.
    pub raw: Vec<u8>,
    pub status: ArgStatus,
    pub error: Option<String>,
}

impl DecodedArg {
    /// Decoded without errors (a truncated string still counts).
    pub fn ok(&self) -> bool {
        self.status == ArgStatus::OK || self.status == ArgStatus::TRUNCATED
    }

    pub fn consumed(&self) -> usize {
        self.raw.len()
    }

    /// Copy of this argument with extra status bits set.
    pub fn with_status(mut self, status: ArgStatus) -> DecodedArg {
        self.status |= status;
        self
    }
}

/// Outcome of decoding one wire value, before width/precision are folded in.
#[derive(Debug, Clone, PartialEq)]
struct Piece {
    value: Option<ArgValue>,
    consumed: usize,
    status: ArgStatus,
    error: Option<String>,
}

impl Piece {
    fn ok(value: ArgValue, consumed: usize) -> Piece {
        Piece { value: Some(value), consumed, status: ArgStatus::OK, error: None }
    }

    fn missing() -> Piece {
        Piece { value: None, consumed: 0, status: ArgStatus::MISSING, error: None }
    }

    fn error(value: Option<ArgValue>, consumed: usize, error: String) -> Piece {
        Piece { value, consumed, status: ArgStatus::DECODE_ERROR, error: Some(error) }
    }

    fn is_ok(&self) -> bool {
        self.status == ArgStatus::OK || self.status == ArgStatus::TRUNCATED
    }
}

/// Fold `*` width/precision pieces into the main piece: statuses OR together,
/// errors join with spaces, consumed bytes add up.
fn merge(width: Option<&Piece>, precision: Option<&Piece>, main: Piece) -> Piece {
    let parts: Vec<&Piece> = width.into_iter().chain(precision).collect();
    if parts.is_empty() {
        return main;
    }
    let status = parts.iter().fold(main.status, |s, p| s | p.status);
    let errors: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.error.as_deref())
        .chain(main.error.as_deref())
        .filter(|e| !e.is_empty())
        .collect();
    Piece {
        value: main.value,
        consumed: parts.iter().map(|p| p.consumed).sum::<usize>() + main.consumed,
        status,
        error: if errors.is_empty() { None } else { Some(errors.join(" ")) },
    }
}

fn decode_signed(data: &[u8]) -> Piece {
    match decode_varint(data) {
        VarintRead::Empty => Piece::missing(),
        VarintRead::Value(v, n) => Piece::ok(ArgValue::Signed(zigzag_decode(v)), n),
        VarintRead::Unterminated(n) => {
            Piece::error(None, n, "Unterminated variable-length integer".to_string())
        }
    }
}

fn decode_unsigned(data: &[u8], size_bits: u32) -> Piece {
    let mut piece = decode_signed(data);
    if let Some(ArgValue::Signed(v)) = piece.value {
        let mask = if size_bits >= 64 { u64::MAX } else { (1u64 << size_bits) - 1 };
        piece.value = Some(ArgValue::Unsigned(v as u64 & mask));
    }
    piece
}

fn decode_char(data: &[u8]) -> Piece {
    let mut piece = decode_signed(data);
    let code = match (piece.is_ok(), &piece.value) {
        (true, Some(ArgValue::Signed(v))) => *v,
        _ => return piece,
    };
    match u32::try_from(code).ok().and_then(char::from_u32) {
        Some(c) => piece.value = Some(ArgValue::Char(c)),
        None => {
            piece.status |= ArgStatus::DECODE_ERROR;
            piece.error = Some(format!("{} is not a valid character code point", code));
        }
    }
    piece
}

fn decode_float(data: &[u8]) -> Piece {
    if data.len() < 4 {
        return Piece::missing();
    }
    Piece::ok(ArgValue::Float(f64::from(LittleEndian::read_f32(data))), 4)
}

fn decode_string(data: &[u8]) -> Piece {
    let Some(&header) = data.first() else {
        return Piece::missing();
    };
    let mut status = ArgStatus::OK;
    if header & 0x80 != 0 {
        status |= ArgStatus::TRUNCATED;
    }
    let size = usize::from(header & 0x7F);
    let end = (size + 1).min(data.len());
    let payload = &data[1..end];
    let mut error = None;
    if payload.len() < size {
        status |= ArgStatus::DECODE_ERROR;
        error = Some(format!("string needs {} bytes, {} available", size, payload.len()));
    }
    let value = match std::str::from_utf8(payload) {
        Ok(s) => s.to_string(),
        Err(e) => {
            status |= ArgStatus::DECODE_ERROR;
            error = Some(e.to_string());
            escape_bytes(payload)
        }
    };
    Piece { value: Some(ArgValue::Str(value)), consumed: end, status, error }
}

/// Quoted, escaped rendering of bytes that are not valid UTF-8.
pub(crate) fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 2);
    out.push('\'');
    for &b in data {
        match b {
            b'\'' => out.push_str("\\'"),
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}

impl FormatSpec {
    /// Decode this specifier's argument from the front of `data`.
    ///
    /// `*` width and `.*` precision arguments are read first, in that order, each as a
    /// signed varint; their bytes are sliced off before the main value is read.
    pub fn decode(self: &Arc<Self>, data: &[u8]) -> DecodedArg {
        if let Some(error) = self.error() {
            return self.finish(
                None,
                None,
                Piece::error(None, 0, error.to_string()),
                data,
            );
        }

        let mut rest = data;
        let width = (self.width() == Some(Count::Arg)).then(|| {
            let piece = decode_signed(rest);
            rest = &rest[piece.consumed..];
            piece
        });
        let precision = (self.precision() == Some(Count::Arg)).then(|| {
            let piece = decode_signed(rest);
            rest = &rest[piece.consumed..];
            piece
        });

        let main = match self.kind() {
            ArgKind::Percent => Piece { value: None, consumed: 0, status: ArgStatus::OK, error: None },
            ArgKind::String => decode_string(rest),
            ArgKind::Char => decode_char(rest),
            ArgKind::SignedInt => decode_signed(rest),
            ArgKind::UnsignedInt => decode_unsigned(rest, self.size_bits()),
            ArgKind::Float => decode_float(rest),
        };
        self.finish(width, precision, main, data)
    }

    fn finish(
        self: &Arc<Self>,
        width: Option<Piece>,
        precision: Option<Piece>,
        main: Piece,
        data: &[u8],
    ) -> DecodedArg {
        let as_int = |p: &Option<Piece>| match p.as_ref().and_then(|p| p.value.as_ref()) {
            Some(ArgValue::Signed(v)) => Some(*v),
            _ => None,
        };
        let width_value = as_int(&width);
        let precision_value = as_int(&precision);
        let merged = merge(width.as_ref(), precision.as_ref(), main);
        DecodedArg {
            spec: Arc::clone(self),
            value: merged.value,
            width: width_value,
            precision: precision_value,
            raw: data[..merged.consumed].to_vec(),
            status: merged.status,
            error: merged.error,
        }
    }
}
