//! Nested message scanning and the varint/zigzag codec.

use proptest::prelude::*;
use std::io::Cursor;
use tokdetok::varint::{decode_varint, encode_varint, zigzag_decode, zigzag_encode, VarintRead};
use tokdetok::nested::DEFAULT_MAX_MESSAGE_LEN;
use tokdetok::NestedMessageParser;

fn upper(message: &[u8]) -> Vec<u8> {
    let mut out = b"<".to_vec();
    out.extend(message.to_ascii_uppercase());
    out.push(b'>');
    out
}

fn transform_whole(data: &[u8]) -> Vec<u8> {
    NestedMessageParser::default().transform(data, upper, true)
}

fn transform_split(data: &[u8], at: usize) -> Vec<u8> {
    let mut parser = NestedMessageParser::default();
    let mut out = parser.transform(&data[..at], upper, false);
    out.extend(parser.transform(&data[at..], upper, true));
    out
}

#[test]
fn test_transform_only_touches_messages() {
    let out = transform_whole(b"x $ab= y $$cd\n");
    assert_eq!(out, b"x <$AB=> y <$><$CD>\n".to_vec());
}

#[test]
fn test_trailing_message_held_until_flush() {
    let mut parser = NestedMessageParser::default();
    assert_eq!(parser.transform(b"log: $abc", upper, false), b"log: ".to_vec());
    assert!(parser.in_message());
    assert_eq!(parser.transform(b"", upper, true), b"<$ABC>".to_vec());
    assert!(!parser.in_message());
}

#[test]
fn test_custom_prefix_and_alphabet() {
    let mut parser = NestedMessageParser::new(b'#', b"0123456789abcdef");
    let chunks = parser.read_messages(b"id #12af, #zz", true);
    let expected: Vec<(bool, Vec<u8>)> = vec![
        (false, b"id ".to_vec()),
        (true, b"#12af".to_vec()),
        (false, b", ".to_vec()),
        (true, b"#".to_vec()),
        (false, b"zz".to_vec()),
    ];
    assert_eq!(chunks, expected);
}

#[test]
fn test_read_messages_io_is_byte_granular() {
    let mut parser = NestedMessageParser::default();
    let chunks: Vec<(bool, Vec<u8>)> = parser
        .read_messages_io(Cursor::new(b"ab $QUJD!c$xy".to_vec()))
        .collect::<Result<_, _>>()
        .expect("read");
    let expected: Vec<(bool, Vec<u8>)> = vec![
        (false, b"a".to_vec()),
        (false, b"b".to_vec()),
        (false, b" ".to_vec()),
        (true, b"$QUJD".to_vec()),
        (false, b"!".to_vec()),
        (false, b"c".to_vec()),
        (true, b"$xy".to_vec()),
    ];
    assert_eq!(chunks, expected);
}

#[test]
fn test_chunked_and_byte_granular_agree_on_messages() {
    let data = b"pre $AAAA== mid $BBBB post";
    let chunked: Vec<Vec<u8>> = NestedMessageParser::default()
        .read_messages(data, true)
        .into_iter()
        .filter(|(m, _)| *m)
        .map(|(_, c)| c)
        .collect();
    let mut parser = NestedMessageParser::default();
    let streamed: Vec<Vec<u8>> = parser
        .read_messages_io(Cursor::new(data.to_vec()))
        .filter_map(|r| r.ok())
        .filter(|(m, _)| *m)
        .map(|(_, c)| c)
        .collect();
    assert_eq!(chunked, streamed);
    assert_eq!(chunked, vec![b"$AAAA==".to_vec(), b"$BBBB".to_vec()]);
}

#[test]
fn test_unterminated_run_is_bounded() {
    let mut data = b"$".to_vec();
    data.extend(std::iter::repeat(b'A').take(DEFAULT_MAX_MESSAGE_LEN * 2));
    let mut parser = NestedMessageParser::default();
    let chunks: Vec<(bool, Vec<u8>)> = parser
        .read_messages_io(Cursor::new(data.clone()))
        .collect::<Result<_, _>>()
        .expect("read");
    assert!(chunks[0].0);
    assert_eq!(chunks[0].1.len(), DEFAULT_MAX_MESSAGE_LEN);
    assert!(chunks[1..].iter().all(|(m, c)| !*m && c.len() == 1));
    assert_eq!(chunks.iter().map(|(_, c)| c.len()).sum::<usize>(), data.len());
    assert!(!parser.in_message());
}

#[test]
fn test_capped_message_passes_through_transform() {
    let mut parser = NestedMessageParser::default().with_max_message_len(3);
    let out = parser.transform(b"a $abcd e", upper, true);
    assert_eq!(out, b"a <$AB>cd e".to_vec());
}

#[test]
fn test_varint_limits() {
    let mut out = Vec::new();
    encode_varint(u64::MAX, &mut out);
    assert_eq!(out.len(), 10);
    assert_eq!(decode_varint(&out), VarintRead::Value(u64::MAX, 10));
    assert!(matches!(decode_varint(&[0x80; 10]), VarintRead::Unterminated(_)));
    assert_eq!(decode_varint(&[]), VarintRead::Empty);
}

#[test]
fn test_zigzag_small_values() {
    assert_eq!(zigzag_decode(0), 0);
    assert_eq!(zigzag_decode(1), -1);
    assert_eq!(zigzag_decode(2), 1);
    assert_eq!(zigzag_decode(3), -2);
    assert_eq!(zigzag_decode(u64::MAX), i64::MIN);
}

proptest! {
    #[test]
    fn prop_zigzag_involution(n in any::<i64>()) {
        prop_assert_eq!(zigzag_decode(zigzag_encode(n)), n);
    }

    #[test]
    fn prop_varint_decodes_what_it_encodes(n in any::<u64>()) {
        let mut out = Vec::new();
        encode_varint(n, &mut out);
        prop_assert_eq!(decode_varint(&out), VarintRead::Value(n, out.len()));
    }

    #[test]
    fn prop_transform_is_chunk_boundary_invariant(
        data in proptest::collection::vec(
            prop_oneof![Just(b'$'), Just(b' '), Just(b'='), Just(b'\n'), b'a'..=b'z', b'A'..=b'Z', b'0'..=b'9'],
            0..64,
        ),
        split in any::<prop::sample::Index>(),
    ) {
        let at = split.index(data.len() + 1);
        prop_assert_eq!(transform_split(&data, at), transform_whole(&data));
    }

    #[test]
    fn prop_capped_transform_is_chunk_boundary_invariant(
        data in proptest::collection::vec(
            prop_oneof![Just(b'$'), Just(b' '), b'a'..=b'f'],
            0..64,
        ),
        split in any::<prop::sample::Index>(),
    ) {
        let at = split.index(data.len() + 1);
        let whole = NestedMessageParser::default().with_max_message_len(5).transform(&data, upper, true);
        let mut parser = NestedMessageParser::default().with_max_message_len(5);
        let mut split_out = parser.transform(&data[..at], upper, false);
        split_out.extend(parser.transform(&data[at..], upper, true));
        prop_assert_eq!(split_out, whole);
    }
}
