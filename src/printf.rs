//! Render decoded arguments the way C99 `printf` does.
//!
//! Rendering follows the C rules rather than any host formatting library: zero precision
//! with a zero integer prints no digits, `#o` guarantees exactly one leading `0`, `inf`/`nan`
//! are never zero-padded, and `%p` is assembled by hand as `0x` plus eight uppercase hex
//! digits. `%a`/`%A` are printed as `%f`/`%F`.

use crate::arg::{ArgStatus, ArgValue, DecodedArg};
use crate::format_spec::{Count, Flags, FormatSpec};

/// Widths and precisions above this are treated as corrupt data.
pub const MAX_FIELD_WIDTH: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("field width or precision {0} is too large")]
    FieldTooLarge(i64),
    #[error("{spec} cannot format {value:?}")]
    Mismatch { spec: String, value: Option<ArgValue> },
}

/// Width, alignment and precision after `*` arguments are applied.
#[derive(Debug, Clone, Copy)]
struct Layout {
    flags: Flags,
    width: usize,
    left: bool,
    precision: Option<usize>,
}

impl Layout {
    /// Lay out `sign`, `prefix` and `body` in the field. Zero fill goes between the
    /// prefix and the body.
    fn pad(&self, sign: &str, prefix: &str, body: &str, zero_fill: bool) -> String {
        let len = sign.len() + prefix.len() + body.chars().count();
        let fill = self.width.saturating_sub(len);
        let mut out = String::with_capacity(len + fill);
        if self.left {
            out.push_str(sign);
            out.push_str(prefix);
            out.push_str(body);
            out.extend(std::iter::repeat(' ').take(fill));
        } else if zero_fill {
            out.push_str(sign);
            out.push_str(prefix);
            out.extend(std::iter::repeat('0').take(fill));
            out.push_str(body);
        } else {
            out.extend(std::iter::repeat(' ').take(fill));
            out.push_str(sign);
            out.push_str(prefix);
            out.push_str(body);
        }
        out
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        }
    }
}

fn checked_field(n: i64) -> Result<usize, RenderError> {
    match usize::try_from(n.unsigned_abs()) {
        Ok(v) if v <= MAX_FIELD_WIDTH => Ok(v),
        _ => Err(RenderError::FieldTooLarge(n)),
    }
}

impl FormatSpec {
    fn layout(&self, width: Option<i64>, precision: Option<i64>) -> Result<Layout, RenderError> {
        let flags = self.flags();
        let mut left = flags.left_align;
        let width = match (self.width(), width) {
            (Some(Count::Fixed(n)), _) => checked_field(n as i64)?,
            (Some(Count::Arg), Some(w)) => {
                // A negative `*` width means left alignment.
                left |= w < 0;
                checked_field(w)?
            }
            _ => 0,
        };
        let precision = match (self.precision(), precision) {
            (Some(Count::Fixed(n)), _) => Some(checked_field(n as i64)?),
            (Some(Count::Arg), Some(p)) if p >= 0 => Some(checked_field(p)?),
            _ => None,
        };
        Ok(Layout { flags, width, left, precision })
    }

    /// Apply this specifier to a decoded value.
    pub fn render(
        &self,
        value: Option<&ArgValue>,
        width: Option<i64>,
        precision: Option<i64>,
        truncated: bool,
    ) -> Result<String, RenderError> {
        let layout = self.layout(width, precision)?;
        let conversion = self.render_conversion();
        match (self.conversion(), value) {
            ('%', _) => Ok("%".to_string()),
            ('s', Some(ArgValue::Str(s))) => {
                let mut s = s.clone();
                if truncated {
                    s.push_str("[...]");
                }
                if let Some(p) = layout.precision {
                    s = s.chars().take(p).collect();
                }
                Ok(layout.pad("", "", &s, false))
            }
            ('c', Some(ArgValue::Char(c))) => Ok(layout.pad("", "", &c.to_string(), false)),
            ('d' | 'i', Some(ArgValue::Signed(v))) => {
                Ok(render_integer(&layout, *v < 0, v.unsigned_abs(), conversion, true))
            }
            ('p', Some(ArgValue::Unsigned(v))) => {
                Ok(layout.pad(layout.sign(false), "0x", &format!("{:08X}", v), false))
            }
            ('o' | 'x' | 'X' | 'u', Some(ArgValue::Unsigned(v))) => {
                Ok(render_integer(&layout, false, *v, conversion, false))
            }
            ('f' | 'F' | 'e' | 'E' | 'a' | 'A' | 'g' | 'G', Some(ArgValue::Float(v))) => {
                Ok(render_float(&layout, *v, conversion))
            }
            _ => Err(RenderError::Mismatch {
                spec: self.specifier().to_string(),
                value: value.cloned(),
            }),
        }
    }
}

fn render_integer(layout: &Layout, negative: bool, magnitude: u64, conversion: char, signed: bool) -> String {
    let mut digits = match conversion {
        'o' => format!("{:o}", magnitude),
        'x' => format!("{:x}", magnitude),
        'X' => format!("{:X}", magnitude),
        _ => magnitude.to_string(),
    };
    if let Some(p) = layout.precision {
        if p == 0 && magnitude == 0 {
            digits.clear();
        } else if digits.len() < p {
            digits = format!("{}{}", "0".repeat(p - digits.len()), digits);
        }
    }
    let mut prefix = "";
    if layout.flags.alternate {
        match conversion {
            'o' if !digits.starts_with('0') => digits.insert(0, '0'),
            'x' if magnitude != 0 => prefix = "0x",
            'X' if magnitude != 0 => prefix = "0X",
            _ => {}
        }
    }
    let sign = if signed { layout.sign(negative) } else { "" };
    // A precision overrides the 0 flag for integers.
    let zero_fill = layout.flags.zero_pad && layout.precision.is_none();
    layout.pad(sign, prefix, &digits, zero_fill)
}

fn render_float(layout: &Layout, value: f64, conversion: char) -> String {
    let upper = conversion.is_ascii_uppercase();
    let sign = layout.sign(value.is_sign_negative() && !value.is_nan());
    if !value.is_finite() {
        let body = match (value.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        return layout.pad(sign, "", body, false);
    }

    let magnitude = value.abs();
    let precision = layout.precision.unwrap_or(6);
    let alternate = layout.flags.alternate;
    let body = match conversion.to_ascii_lowercase() {
        'e' => exponential(magnitude, precision, alternate),
        'g' => general(magnitude, precision, alternate),
        _ => fixed(magnitude, precision, alternate),
    };
    let body = if upper { body.to_ascii_uppercase() } else { body };
    layout.pad(sign, "", &body, layout.flags.zero_pad)
}

fn fixed(value: f64, precision: usize, alternate: bool) -> String {
    let mut s = format!("{:.*}", precision, value);
    if alternate && precision == 0 {
        s.push('.');
    }
    s
}

/// Mantissa and decimal exponent of `value` rounded to `precision` fraction digits.
fn split_exponent(value: f64, precision: usize) -> (String, i32) {
    let s = format!("{:.*e}", precision, value);
    match s.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn exponential(value: f64, precision: usize, alternate: bool) -> String {
    let (mut mantissa, exp) = split_exponent(value, precision);
    if alternate && precision == 0 {
        mantissa.push('.');
    }
    format_exponent(&mantissa, exp)
}

fn format_exponent(mantissa: &str, exp: i32) -> String {
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exp.unsigned_abs())
}

fn general(value: f64, precision: usize, alternate: bool) -> String {
    let p = precision.max(1);
    let (_, exp) = split_exponent(value, p - 1);
    if exp >= -4 && (exp as i64) < p as i64 {
        let s = fixed(value, (p as i64 - 1 - exp as i64) as usize, alternate);
        if alternate {
            s
        } else {
            strip_fraction_zeros(&s).to_string()
        }
    } else {
        let (mantissa, exp) = split_exponent(value, p - 1);
        let mut mantissa = if alternate {
            mantissa
        } else {
            strip_fraction_zeros(&mantissa).to_string()
        };
        if alternate && p == 1 {
            mantissa.push('.');
        }
        format_exponent(&mantissa, exp)
    }
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

impl DecodedArg {
    /// Rendered text for this argument, or a bracketed diagnostic such as
    /// `<[%d MISSING]>` or `<[%c ERROR (-1)]>` when it did not decode cleanly.
    pub fn format(&self) -> String {
        let mut status = self.status;
        if self.ok() {
            match self.spec.render(
                self.value.as_ref(),
                self.width,
                self.precision,
                status.contains(ArgStatus::TRUNCATED),
            ) {
                Ok(text) => return text,
                Err(_) => status |= ArgStatus::DECODE_ERROR,
            }
        }

        let label = if status.contains(ArgStatus::SKIPPED) {
            "SKIPPED"
        } else if status == ArgStatus::MISSING {
            "MISSING"
        } else {
            "ERROR"
        };
        let shown = self.value.as_ref().map(ToString::to_string).unwrap_or_default();
        if shown.is_empty() {
            format!("<[{} {}]>", self.spec.specifier(), label)
        } else {
            format!("<[{} {} ({})]>", self.spec.specifier(), label, shown)
        }
    }
}
