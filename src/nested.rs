//! Find prefixed messages (e.g. `$` + Base64) embedded in free-form byte streams.
//!
//! [`NestedMessageParser`] is a two-state scanner that keeps its state between calls, so a
//! message split across reads is reassembled. One parser belongs to one stream; it is not
//! meant to be shared.

use std::collections::VecDeque;
use std::io::{self, Read};

/// Standard Base64 alphabet plus padding.
pub const BASE64_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=";

/// Longest buffered candidate, prefix included, before it is reported as is.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    Inside,
}

/// Streaming scanner for `prefix` + alphabet message spans.
#[derive(Debug, Clone)]
pub struct NestedMessageParser {
    prefix: u8,
    alphabet: [bool; 256],
    state: State,
    message: Vec<u8>,
    max_message_len: usize,
}

impl Default for NestedMessageParser {
    fn default() -> Self {
        NestedMessageParser::new(b'$', BASE64_ALPHABET)
    }
}

impl NestedMessageParser {
    pub fn new(prefix: u8, alphabet: &[u8]) -> Self {
        let mut table = [false; 256];
        for &b in alphabet {
            table[usize::from(b)] = true;
        }
        NestedMessageParser {
            prefix,
            alphabet: table,
            state: State::Outside,
            message: Vec::new(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    /// Report a candidate once it reaches `len` bytes (at least 2) and treat the rest of
    /// its run as text.
    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len.max(2);
        self
    }

    /// Scan `data`, reporting `(is_message, bytes)` spans in order.
    ///
    /// Non-message runs are reported as they end or when `data` runs out. A message is
    /// reported once a byte outside the alphabet (or another prefix) ends it, when it
    /// reaches the length cap, or at the end of `data` when `flush` is set; otherwise it
    /// stays buffered for the next call.
    fn scan<F: FnMut(bool, &[u8])>(&mut self, data: &[u8], flush: bool, mut emit: F) {
        let mut text_start = 0;
        for (i, &byte) in data.iter().enumerate() {
            match self.state {
                State::Outside => {
                    if byte == self.prefix {
                        if text_start < i {
                            emit(false, &data[text_start..i]);
                        }
                        self.message.push(byte);
                        self.state = State::Inside;
                    }
                }
                State::Inside => {
                    if byte == self.prefix {
                        emit(true, &self.message);
                        self.message.clear();
                        self.message.push(byte);
                    } else if self.alphabet[usize::from(byte)] {
                        self.message.push(byte);
                        if self.message.len() >= self.max_message_len {
                            emit(true, &self.message);
                            self.message.clear();
                            self.state = State::Outside;
                            text_start = i + 1;
                        }
                    } else {
                        emit(true, &self.message);
                        self.message.clear();
                        self.state = State::Outside;
                        text_start = i;
                    }
                }
            }
        }
        match self.state {
            State::Outside => {
                if text_start < data.len() {
                    emit(false, &data[text_start..]);
                }
            }
            State::Inside if flush => {
                emit(true, &self.message);
                self.message.clear();
                self.state = State::Outside;
            }
            State::Inside => {}
        }
    }

    /// Split `data` into message and non-message chunks.
    pub fn read_messages(&mut self, data: &[u8], flush: bool) -> Vec<(bool, Vec<u8>)> {
        let mut out = Vec::new();
        self.scan(data, flush, |is_message, chunk| out.push((is_message, chunk.to_vec())));
        out
    }

    /// Read messages from `reader` one byte at a time until EOF.
    ///
    /// Each non-message byte is yielded as soon as it is read; messages are yielded whole
    /// once they end or the reader is exhausted.
    pub fn read_messages_io<R: Read>(&mut self, reader: R) -> MessageReader<'_, R> {
        MessageReader {
            parser: self,
            bytes: reader.bytes(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Rewrite message spans with `transform`, passing everything else through unchanged.
    pub fn transform<F>(&mut self, data: &[u8], mut transform: F, flush: bool) -> Vec<u8>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let mut out = Vec::with_capacity(data.len());
        self.scan(data, flush, |is_message, chunk| {
            if is_message {
                out.extend_from_slice(&transform(chunk));
            } else {
                out.extend_from_slice(chunk);
            }
        });
        out
    }

    /// True while a candidate message is buffered.
    pub fn in_message(&self) -> bool {
        self.state == State::Inside
    }
}

/// Iterator returned by [`NestedMessageParser::read_messages_io`].
pub struct MessageReader<'p, R> {
    parser: &'p mut NestedMessageParser,
    bytes: io::Bytes<R>,
    pending: VecDeque<(bool, Vec<u8>)>,
    done: bool,
}

impl<R: Read> Iterator for MessageReader<'_, R> {
    type Item = io::Result<(bool, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if self.done {
                return None;
            }
            let pending = &mut self.pending;
            match self.bytes.next() {
                Some(Ok(byte)) => self
                    .parser
                    .scan(&[byte], false, |m, c| pending.push_back((m, c.to_vec()))),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.done = true;
                    self.parser
                        .scan(&[], true, |m, c| pending.push_back((m, c.to_vec())));
                }
            }
        }
    }
}
