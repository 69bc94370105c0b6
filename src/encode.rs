//! Encoder-side helpers: token hashing, argument packing and prefixed Base64.
//!
//! These mirror what the device writes so host tools and tests can build records.

use crate::varint::encode_signed;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Prefix marking a nested or Base64-encoded tokenized message in text.
pub const NESTED_PREFIX: char = '$';

const HASH_CONSTANT: u32 = 65599;

/// Longest string payload; the length byte's top bit is the truncation flag.
pub const MAX_STRING_ARG: usize = 0x7F;

/// Token for a format string: the length-seeded x65599 polynomial hash.
pub fn hash_65599(string: &str) -> u32 {
    let mut hash = string.len() as u32;
    let mut coefficient = HASH_CONSTANT;
    for byte in string.bytes() {
        hash = hash.wrapping_add(coefficient.wrapping_mul(u32::from(byte)));
        coefficient = coefficient.wrapping_mul(HASH_CONSTANT);
    }
    hash
}

/// One argument as the device would pass it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeArg<'a> {
    Int(i64),
    Float(f32),
    Str(&'a str),
}

/// Pack a token and its arguments into a binary record.
pub fn encode_token_and_args(token: u32, args: &[EncodeArg<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.len() * 4);
    out.extend_from_slice(&token.to_le_bytes());
    for arg in args {
        match *arg {
            EncodeArg::Int(v) => encode_signed(v, &mut out),
            EncodeArg::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            EncodeArg::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > MAX_STRING_ARG {
                    out.push(0x80 | MAX_STRING_ARG as u8);
                    out.extend_from_slice(&bytes[..MAX_STRING_ARG]);
                } else {
                    out.push(bytes.len() as u8);
                    out.extend_from_slice(bytes);
                }
            }
        }
    }
    out
}

/// `prefix` followed by standard padded Base64 of `data`.
pub fn prefixed_base64(data: &[u8], prefix: char) -> String {
    let mut out = String::with_capacity(1 + data.len().div_ceil(3) * 4);
    out.push(prefix);
    STANDARD.encode_string(data, &mut out);
    out
}
