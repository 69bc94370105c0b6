//! Base-128 varints and zigzag sign folding, as written by the device-side encoder.
//!
//! Every integer argument travels as a little-endian base-128 varint (continuation bit
//! `0x80`, 7 payload bits per byte). Signed values are zigzag-encoded first so that small
//! negative numbers stay short. Unsigned values use the same wire form and are masked to
//! their declared width after decoding.

/// Longest varint accepted: 10 bytes hold 64 payload bits.
pub const MAX_VARINT_BYTES: usize = 10;

/// Outcome of reading one varint from the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintRead {
    /// Terminated varint: value and number of bytes consumed.
    Value(u64, usize),
    /// No terminating byte within the buffer or within [`MAX_VARINT_BYTES`];
    /// carries the number of bytes examined.
    Unterminated(usize),
    /// Empty buffer.
    Empty,
}

/// Read one varint from the front of `data`. Never looks past `data`.
pub fn decode_varint(data: &[u8]) -> VarintRead {
    if data.is_empty() {
        return VarintRead::Empty;
    }
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, byte) in data.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F).wrapping_shl(shift);
        if byte & 0x80 == 0 {
            return VarintRead::Value(value, i + 1);
        }
        shift += 7;
    }
    VarintRead::Unterminated(data.len().min(MAX_VARINT_BYTES))
}

/// `even -> n >> 1`, `odd -> !(n >> 1)`.
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Append `value` as a base-128 varint.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Zigzag-encode then varint-encode a signed value.
pub fn encode_signed(value: i64, out: &mut Vec<u8>) {
    encode_varint(zigzag_encode(value), out);
}
