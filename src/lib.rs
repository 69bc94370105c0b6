//! # tokdetok: Detokenizer for Tokenized Log Records
//!
//! Devices that tokenize their log strings send a 32-bit token in place of each printf-style
//! format string, followed by the packed arguments. This crate turns those records back
//! into text using a token database.
//!
//! ## Record format
//!
//! - **Token**: 4 bytes, little-endian (shorter records are zero-extended)
//! - **Integers** (`%d %i %u %o %x %X %c %p`): zigzag varint, at most 10 bytes
//! - **Floats** (`%f %e %g %a` and uppercase): 4-byte little-endian IEEE-754 single
//! - **Strings** (`%s`): one length byte (top bit = truncated) then the bytes
//!
//! ## Pieces
//!
//! - [`FormatSpec`]: one `%[flags][width][.precision][length]type` conversion, parsed
//!   with a PEST grammar, that decodes and renders its argument
//! - [`FormatString`]: a format string split into literals and conversions
//! - [`Detokenizer`]: database lookup, collision scoring, nested `$#XXXXXXXX` / `$` + Base64
//!   resolution
//! - [`NestedMessageParser`]: streaming scanner for prefixed messages in free-form output
//! - [`AutoUpdatingDetokenizer`]: reloads CSV databases when their files change
//!
//! ## Example
//!
//! ```
//! use tokdetok::{Database, Detokenizer, TokenizedStringEntry};
//!
//! let db = Database::from_entries([TokenizedStringEntry::new(0xCDAB, "%02d %s %c%%")]);
//! let detok = Detokenizer::new(db);
//! let result = detok.detokenize(b"\xab\xcd\x00\x00\x02\x03Two\x66");
//! assert_eq!(result.to_string(), "01 Two 3%");
//! ```
//!
//! ## Usage
//!
//! See `src/bin/detokenize.rs` for a command-line filter and `tests/detokenize.rs` for more
//! examples.

pub mod arg;
pub mod auto_update;
pub mod database;
pub mod detokenize;
pub mod encode;
pub mod format_spec;
pub mod format_string;
pub mod nested;
pub mod printf;
pub mod varint;

pub use arg::{ArgStatus, ArgValue, DecodedArg};
pub use auto_update::{
    AutoUpdatingDetokenizer, AutoUpdatingDetokenizerBuilder, FileSystemObserver,
    ModificationObserver, PollerHandle, ReloadEvent, DEFAULT_MIN_POLL_PERIOD,
};
pub use database::{
    parse_csv_database, CsvDatabaseLoader, Database, DatabaseError, DatabaseLoader,
    DatabaseSource, DomainSelector, TokenDatabase, TokenizedStringEntry, DEFAULT_DOMAIN,
};
pub use detokenize::{DetokenizedResult, Detokenizer, DetokenizerOptions, DEFAULT_RECURSION};
pub use encode::{encode_token_and_args, hash_65599, prefixed_base64, EncodeArg, NESTED_PREFIX};
pub use format_spec::{ArgKind, FormatSpec, FormatSpecError};
pub use format_string::{FormatString, FormattedString, Score};
pub use nested::NestedMessageParser;
pub use printf::RenderError;
