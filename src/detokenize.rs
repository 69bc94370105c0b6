//! Resolve tokenized records against a token database.
//!
//! A record is a 4-byte little-endian token followed by packed arguments. Every candidate
//! string sharing the token is decoded and rendered; candidates are ranked by
//! [`FormattedString::score`] and the best one wins. Rendered text is then rescanned for
//! nested messages (`$#XXXXXXXX` or `$` + Base64), each of which spends one level of the
//! recursion budget.

use crate::arg::escape_bytes;
use crate::database::{TokenDatabase, DEFAULT_DOMAIN};
use crate::encode::{prefixed_base64, NESTED_PREFIX};
use crate::format_string::{FormatString, FormattedString};
use crate::nested::{NestedMessageParser, BASE64_ALPHABET};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use regex::{Captures, Regex};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Nesting levels expanded when no budget is given.
pub const DEFAULT_RECURSION: usize = 9;

/// `$#` + 8 uppercase hex digits, or `$` + padded standard Base64.
static NESTED_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$#(?P<hex>[0-9A-F]{8})|\$(?P<base64>(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{3}=|[A-Za-z0-9+/]{2}==)?)",
    )
    .expect("nested token pattern is valid")
});

#[derive(Debug, Clone)]
pub struct DetokenizerOptions {
    /// Render failed arguments and tokens as bracketed diagnostics.
    pub show_errors: bool,
    /// Nesting levels expanded by [`Detokenizer::detokenize`].
    pub recursion: usize,
    /// Treat records shorter than 4 bytes as a zero-extended token.
    pub zero_extend_short_tokens: bool,
    /// Domain tokens are looked up in.
    pub domain: String,
}

impl Default for DetokenizerOptions {
    fn default() -> Self {
        DetokenizerOptions {
            show_errors: false,
            recursion: DEFAULT_RECURSION,
            zero_extend_short_tokens: true,
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }
}

/// All decode attempts for one record, best first.
#[derive(Debug, Clone)]
pub struct DetokenizedResult {
    token: Option<u32>,
    encoded: Vec<u8>,
    show_errors: bool,
    pub successes: Vec<FormattedString>,
    pub failures: Vec<FormattedString>,
}

impl DetokenizedResult {
    /// `None` for an empty record.
    pub fn token(&self) -> Option<u32> {
        self.token
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// At least one candidate decoded cleanly.
    pub fn ok(&self) -> bool {
        !self.successes.is_empty()
    }

    /// More than one candidate decoded cleanly.
    pub fn is_ambiguous(&self) -> bool {
        self.successes.len() > 1
    }

    /// Successes then failures, each in score order.
    pub fn matches(&self) -> impl Iterator<Item = &FormattedString> {
        self.successes.iter().chain(&self.failures)
    }

    pub fn best(&self) -> Option<&FormattedString> {
        self.matches().next()
    }

    /// Why detokenization is not clean; empty when exactly one candidate succeeded.
    pub fn error_message(&self) -> String {
        if self.successes.len() == 1 {
            return String::new();
        }
        let count = self.successes.len() + self.failures.len();
        match (self.token, count) {
            (None, _) => "missing token".to_string(),
            (Some(token), 0) => format!("unknown token {:08x}", token),
            (Some(_), 1) => match self.best() {
                Some(best) => format!("decoding failed for {:?}", best.text),
                None => String::new(),
            },
            (Some(_), n) => format!("{} matches", n),
        }
    }
}

impl fmt::Display for DetokenizedResult {
    /// Best candidate's text. Without any candidate: a diagnostic when errors are shown,
    /// otherwise the record as `$` + Base64 so it can be decoded again later.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(best) = self.best() {
            return f.write_str(&best.text);
        }
        if self.show_errors {
            write!(
                f,
                "<[ERROR: {}|{}]>",
                self.error_message(),
                escape_bytes(&self.encoded)
            )
        } else {
            f.write_str(&prefixed_base64(&self.encoded, NESTED_PREFIX))
        }
    }
}

/// Resolves records against one immutable database snapshot.
#[derive(Clone)]
pub struct Detokenizer {
    database: Arc<dyn TokenDatabase + Send + Sync>,
    options: DetokenizerOptions,
}

impl fmt::Debug for Detokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detokenizer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Detokenizer {
    pub fn new(database: impl TokenDatabase + Send + Sync + 'static) -> Self {
        Detokenizer::with_options(database, DetokenizerOptions::default())
    }

    pub fn with_options(
        database: impl TokenDatabase + Send + Sync + 'static,
        options: DetokenizerOptions,
    ) -> Self {
        Detokenizer { database: Arc::new(database), options }
    }

    pub fn options(&self) -> &DetokenizerOptions {
        &self.options
    }

    /// Decode one record using the configured recursion budget.
    pub fn detokenize(&self, data: &[u8]) -> DetokenizedResult {
        self.detokenize_with_recursion(data, self.options.recursion)
    }

    /// Decode one record, expanding nested messages up to `recursion` levels deep.
    pub fn detokenize_with_recursion(&self, data: &[u8], recursion: usize) -> DetokenizedResult {
        let token = self.token_of(data);
        let mut result = DetokenizedResult {
            token,
            encoded: data.to_vec(),
            show_errors: self.options.show_errors,
            successes: Vec::new(),
            failures: Vec::new(),
        };
        let Some(token) = token else {
            return result;
        };

        let args = data.get(4..).unwrap_or(&[]);
        let entries = self.database.lookup(&self.options.domain, token);
        if entries.is_empty() {
            debug!(token = format_args!("{:08x}", token), "unknown token");
        }
        let mut attempts: Vec<_> = entries
            .iter()
            .map(|entry| {
                let mut formatted =
                    FormatString::new(&entry.string).format(args, self.options.show_errors);
                formatted.text = self.detokenize_text(&formatted.text, recursion);
                (formatted.score(entry.date_removed), formatted)
            })
            .collect();
        // Stable sort keeps database order among equal scores.
        attempts.sort_by(|a, b| b.0.cmp(&a.0));
        for (score, formatted) in attempts {
            if score.ok {
                result.successes.push(formatted);
            } else {
                result.failures.push(formatted);
            }
        }
        result
    }

    fn token_of(&self, data: &[u8]) -> Option<u32> {
        match data.len() {
            0 => None,
            n if n >= 4 => Some(LittleEndian::read_u32(data)),
            n if self.options.zero_extend_short_tokens => {
                let mut padded = [0u8; 4];
                padded[..n].copy_from_slice(data);
                Some(u32::from_le_bytes(padded))
            }
            _ => None,
        }
    }

    /// Replace nested `$#XXXXXXXX` and `$` + Base64 messages in `text`.
    ///
    /// Each replacement is itself expanded with one level less; at zero the text is
    /// returned untouched. Messages that do not decode cleanly are left as they are.
    pub fn detokenize_text(&self, text: &str, recursion: usize) -> String {
        if recursion == 0 || !text.contains('$') {
            return text.to_string();
        }
        NESTED_TOKEN
            .replace_all(text, |caps: &Captures<'_>| {
                let original = &caps[0];
                let record = if let Some(hex) = caps.name("hex") {
                    u32::from_str_radix(hex.as_str(), 16).ok().map(|t| t.to_le_bytes().to_vec())
                } else {
                    caps.name("base64")
                        .and_then(|b| STANDARD.decode(b.as_str()).ok())
                        .filter(|bytes| bytes.len() >= 4)
                };
                match record {
                    Some(record) => self.expand(&record, recursion - 1, original),
                    None => original.to_string(),
                }
            })
            .into_owned()
    }

    fn expand(&self, record: &[u8], recursion: usize, original: &str) -> String {
        let result = self.detokenize_with_recursion(record, recursion);
        match result.successes.first() {
            Some(best) => best.text.clone(),
            None => original.to_string(),
        }
    }

    /// Rewrite one `prefix` + Base64 span found in a stream, or return it unchanged.
    pub(crate) fn rewrite_base64_message(&self, message: &[u8], recursion: usize) -> Vec<u8> {
        let decoded = match STANDARD.decode(message.get(1..).unwrap_or(&[])) {
            Ok(bytes) if bytes.len() >= 4 => bytes,
            _ => return message.to_vec(),
        };
        let result = self.detokenize_with_recursion(&decoded, recursion);
        match result.successes.first() {
            Some(best) => best.text.clone().into_bytes(),
            None => message.to_vec(),
        }
    }

    /// Replace every `prefix` + Base64 message in `data` with its text.
    pub fn detokenize_base64(&self, data: &[u8], prefix: u8, recursion: usize) -> Vec<u8> {
        NestedMessageParser::new(prefix, BASE64_ALPHABET).transform(
            data,
            |message| self.rewrite_base64_message(message, recursion),
            true,
        )
    }

    /// [`Detokenizer::detokenize_base64`] over text, with an ASCII `prefix`.
    pub fn detokenize_base64_str(&self, text: &str, prefix: u8, recursion: usize) -> String {
        debug_assert!(prefix.is_ascii(), "message prefix must be ASCII");
        String::from_utf8_lossy(&self.detokenize_base64(text.as_bytes(), prefix, recursion))
            .into_owned()
    }

    /// Rewrite a live stream: read `reader` until EOF, writing and flushing `writer` as
    /// soon as output is available.
    pub fn detokenize_base64_live<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        prefix: u8,
        recursion: usize,
    ) -> io::Result<()> {
        rewrite_stream(reader, writer, prefix, |message| {
            self.rewrite_base64_message(message, recursion)
        })
    }

    /// Rewrite `data` into the file at `path`.
    pub fn detokenize_base64_to_file(
        &self,
        data: &[u8],
        path: impl AsRef<Path>,
        prefix: u8,
        recursion: usize,
    ) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.detokenize_base64(data, prefix, recursion))?;
        file.flush()
    }
}

/// Pump `reader` through a parser into `writer`, flushing after every read.
pub(crate) fn rewrite_stream<R, W, F>(reader: R, mut writer: W, prefix: u8, mut rewrite: F) -> io::Result<()>
where
    R: Read,
    W: Write,
    F: FnMut(&[u8]) -> Vec<u8>,
{
    let mut parser = NestedMessageParser::new(prefix, BASE64_ALPHABET);
    let mut reader = BufReader::new(reader);
    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            break;
        }
        let out = parser.transform(chunk, &mut rewrite, false);
        let n = chunk.len();
        reader.consume(n);
        writer.write_all(&out)?;
        writer.flush()?;
    }
    writer.write_all(&parser.transform(&[], &mut rewrite, true))?;
    writer.flush()
}
