//! Parse and validate printf conversion specifiers using PEST.
//!
//! A [`FormatSpec`] describes one `%...` occurrence. Construction from a format string never
//! fails: specifiers the host cannot honour (e.g. `%n`, `%#d`) record a validation error that
//! surfaces when the argument is decoded. [`FormatSpec::from_string`] is the strict entry
//! point for a single ad hoc specifier and rejects anything that is not exactly one.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::fmt;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
pub(crate) struct SpecParser;

#[derive(Debug, thiserror::Error)]
pub enum FormatSpecError {
    #[error("{0:?} is not a valid single format specifier")]
    NotASpecifier(String),
}

/// Closed set of argument kinds; each owns its wire decoding and rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// `%%`: no argument.
    Percent,
    /// `%s`: length-prefixed UTF-8.
    String,
    /// `%c`: signed varint holding a code point.
    Char,
    /// `%d %i`: zigzag varint.
    SignedInt,
    /// `%o %x %X %u %p`: zigzag varint masked to `size_bits`.
    UnsignedInt,
    /// `%f %F %e %E %a %A %g %G`: 4-byte little-endian f32.
    Float,
}

/// Field width or precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Fixed(usize),
    /// `*`: read from a preceding signed-varint argument.
    Arg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Hh,
    H,
    L,
    Ll,
    J,
    Z,
    T,
    LongDouble,
}

impl Length {
    fn parse(s: &str) -> Option<Length> {
        Some(match s {
            "hh" => Length::Hh,
            "h" => Length::H,
            "l" => Length::L,
            "ll" => Length::Ll,
            "j" => Length::J,
            "z" => Length::Z,
            "t" => Length::T,
            "L" => Length::LongDouble,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub left_align: bool,
    pub plus: bool,
    pub space: bool,
    pub alternate: bool,
    pub zero_pad: bool,
}

impl Flags {
    fn parse(s: &str) -> Flags {
        let mut f = Flags::default();
        for c in s.chars() {
            match c {
                '-' => f.left_align = true,
                '+' => f.plus = true,
                ' ' => f.space = true,
                '#' => f.alternate = true,
                '0' => f.zero_pad = true,
                _ => {}
            }
        }
        f
    }

    pub fn is_empty(&self) -> bool {
        *self == Flags::default()
    }
}

/// One parsed conversion specifier.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSpec {
    specifier: String,
    flags_text: String,
    flags: Flags,
    width: Option<Count>,
    precision_text: String,
    precision: Option<Count>,
    length: Option<Length>,
    conversion: char,
    size_bits: u32,
    error: Option<String>,
}

impl FormatSpec {
    /// Parse text that must be exactly one specifier, e.g. `"%08x"`.
    pub fn from_string(specifier: &str) -> Result<FormatSpec, FormatSpecError> {
        let not_a_spec = || FormatSpecError::NotASpecifier(specifier.to_string());
        let mut pairs =
            SpecParser::parse(Rule::single_spec, specifier).map_err(|_| not_a_spec())?;
        let spec = pairs
            .next()
            .and_then(|p| p.into_inner().find(|p| p.as_rule() == Rule::spec))
            .ok_or_else(not_a_spec)?;
        Ok(FormatSpec::from_pair(spec))
    }

    pub(crate) fn from_pair(pair: Pair<Rule>) -> FormatSpec {
        let specifier = pair.as_str().to_string();
        let mut flags_text = "";
        let mut width_text = "";
        let mut precision_text = "";
        let mut length_text = "";
        let mut conversion_text = "";
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::flags => flags_text = inner.as_str(),
                Rule::width => width_text = inner.as_str(),
                Rule::precision => precision_text = inner.as_str(),
                Rule::length => length_text = inner.as_str(),
                Rule::conversion => conversion_text = inner.as_str(),
                _ => {}
            }
        }

        let mut error = None;
        let width = match width_text {
            "" => None,
            "*" => Some(Count::Arg),
            digits => match digits.parse() {
                Ok(n) => Some(Count::Fixed(n)),
                Err(_) => {
                    error = Some(format!("width {} is too large", digits));
                    None
                }
            },
        };
        let precision = match precision_text {
            "" => None,
            ".*" => Some(Count::Arg),
            "." => Some(Count::Fixed(0)),
            text => match text[1..].parse() {
                Ok(n) => Some(Count::Fixed(n)),
                Err(_) => {
                    error = Some(format!("precision {} is too large", &text[1..]));
                    None
                }
            },
        };
        let conversion = conversion_text.chars().next().unwrap_or('%');

        let mut spec = FormatSpec {
            flags: Flags::parse(flags_text),
            flags_text: flags_text.to_string(),
            width,
            precision_text: precision_text.to_string(),
            precision,
            length: Length::parse(length_text),
            conversion,
            size_bits: 0,
            error: None,
            specifier,
        };
        spec.size_bits = match spec.kind() {
            ArgKind::SignedInt | ArgKind::UnsignedInt => match spec.length {
                Some(Length::Ll) | Some(Length::J) => 64,
                _ => 32,
            },
            _ => 0,
        };
        spec.error = error.or_else(|| spec.validate());
        spec
    }

    /// First rule the specifier breaks, if any.
    fn validate(&self) -> Option<String> {
        let t = self.conversion;
        let f = &self.flags;
        if t == 'n' {
            return Some("Unsupported conversion specifier n".to_string());
        }
        if t == '%' {
            if !f.is_empty() || self.width.is_some() || self.precision.is_some() || self.length.is_some() {
                return Some("%% does not support flags, width, precision, or length".to_string());
            }
            return None;
        }
        if f.alternate && !"oxXfFeEaAgG".contains(t) {
            return Some(format!("%{} does not support the # flag", t));
        }
        if f.zero_pad && "csp".contains(t) {
            return Some(format!("%{} does not support the 0 flag", t));
        }
        if (f.plus || f.space) && "cs".contains(t) {
            return Some(format!("%{} does not support the + or space flags", t));
        }
        if t == 'c' && self.precision.is_some() {
            return Some("%c does not support precision".to_string());
        }
        if t == 'p' && (self.length.is_some() || self.precision.is_some()) {
            return Some("%p does not support length or precision".to_string());
        }
        None
    }

    pub fn kind(&self) -> ArgKind {
        match self.conversion {
            '%' => ArgKind::Percent,
            's' => ArgKind::String,
            'c' => ArgKind::Char,
            'o' | 'x' | 'X' | 'u' | 'p' => ArgKind::UnsignedInt,
            'f' | 'F' | 'e' | 'E' | 'a' | 'A' | 'g' | 'G' => ArgKind::Float,
            // 'd', 'i'; 'n' always carries an error and never decodes.
            _ => ArgKind::SignedInt,
        }
    }

    /// Original text, e.g. `%-08.3lld`.
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn width(&self) -> Option<Count> {
        self.width
    }

    pub fn precision(&self) -> Option<Count> {
        self.precision
    }

    pub fn length(&self) -> Option<Length> {
        self.length
    }

    pub fn conversion(&self) -> char {
        self.conversion
    }

    /// 32 or 64 for integer conversions, 0 otherwise.
    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Verb actually rendered: `a`/`A` print as `f`/`F`, `p` as `X`.
    pub fn render_conversion(&self) -> char {
        match self.conversion {
            'a' => 'f',
            'A' => 'F',
            'p' => 'X',
            c => c,
        }
    }

    /// Host-renderable pattern: the specifier without its length modifier and
    /// with the conversion remapped.
    pub fn compatible(&self) -> String {
        let width = match self.width {
            Some(Count::Fixed(n)) => n.to_string(),
            Some(Count::Arg) => "*".to_string(),
            None => String::new(),
        };
        format!(
            "%{}{}{}{}",
            self.flags_text,
            width,
            self.precision_text,
            self.render_conversion()
        )
    }
}

impl fmt::Display for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.specifier)
    }
}

/// One piece of a split format string.
#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Literal(String),
    Spec(usize),
}

/// Split a whole format string into literal text and specifiers.
pub(crate) fn split_format_string(format: &str) -> (Vec<Segment>, Vec<FormatSpec>) {
    let mut segments = Vec::new();
    let mut specs = Vec::new();
    let pairs = match SpecParser::parse(Rule::format_string, format) {
        Ok(p) => p,
        // Every input matches `(spec | literal)*`; keep the text verbatim regardless.
        Err(_) => {
            segments.push(Segment::Literal(format.to_string()));
            return (segments, specs);
        }
    };
    for pair in pairs.flatten() {
        match pair.as_rule() {
            Rule::spec => {
                segments.push(Segment::Spec(specs.len()));
                specs.push(FormatSpec::from_pair(pair));
            }
            Rule::literal => segments.push(Segment::Literal(pair.as_str().to_string())),
            _ => {}
        }
    }
    (segments, specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_parts() {
        let spec = FormatSpec::from_string("%-08.3lld").expect("spec");
        assert!(spec.flags().left_align);
        assert!(spec.flags().zero_pad);
        assert_eq!(spec.width(), Some(Count::Fixed(8)));
        assert_eq!(spec.precision(), Some(Count::Fixed(3)));
        assert_eq!(spec.length(), Some(Length::Ll));
        assert_eq!(spec.conversion(), 'd');
        assert_eq!(spec.size_bits(), 64);
        assert_eq!(spec.compatible(), "%-08.3d");
    }

    #[test]
    fn star_width_and_precision() {
        let spec = FormatSpec::from_string("%*.*f").expect("spec");
        assert_eq!(spec.width(), Some(Count::Arg));
        assert_eq!(spec.precision(), Some(Count::Arg));
        assert_eq!(spec.error(), None);
    }

    #[test]
    fn rejects_non_specifiers() {
        assert!(FormatSpec::from_string("%").is_err());
        assert!(FormatSpec::from_string("%y").is_err());
        assert!(FormatSpec::from_string("%d%d").is_err());
        assert!(FormatSpec::from_string("x%d").is_err());
    }

    #[test]
    fn split_keeps_stray_percent_as_text() {
        let (segments, specs) = split_format_string("100%, %s and %y%%");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].specifier(), "%s");
        assert_eq!(specs[1].specifier(), "%%");
        let text: Vec<String> = segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.clone(),
                Segment::Spec(i) => format!("[{}]", i),
            })
            .collect();
        assert_eq!(text.concat(), "100%, [0] and %y[1]");
    }
}
