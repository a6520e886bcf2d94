// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunked transfer decoding.
//!
//! Grammar accepted here: hex-sized chunks without extensions, each followed
//! by CR-LF, terminated by a zero-size chunk and an optional trailer block
//! that ends with an empty CR-LF line. The decoded bytes are the only part of
//! a request the parser copies into owned storage.

use super::cursor::ByteCursor;
use super::{ParseError, ParseResult};

/// Cumulative cap on decoded body bytes.
pub(crate) const MAX_DECODED_BODY: usize = 0x00A0_0000;

/// A chunk-size line may carry at most this many hex digits.
const MAX_SIZE_DIGITS: usize = 16;

const INITIAL_CAPACITY: usize = 1024;

/// Decoded body, stored trailer pairs, and the offset one past the final
/// CR-LF of the trailer block.
#[derive(Debug)]
pub(crate) struct DecodedBody<'buf> {
    pub data: Vec<u8>,
    pub trailers: Vec<(&'buf [u8], &'buf [u8])>,
    pub request_end: usize,
}

/// Decodes a chunked body beginning at `body_start`.
pub(crate) fn decode(raw: &[u8], body_start: usize) -> ParseResult<DecodedBody<'_>> {
    if body_start >= raw.len() {
        return Err(ParseError::InvalidFormat);
    }

    let mut cur = ByteCursor::new(raw, body_start);
    let mut data: Vec<u8> = Vec::new();
    data.try_reserve(INITIAL_CAPACITY)
        .map_err(|_| ParseError::AllocationFailure)?;

    loop {
        let size = chunk_size(&mut cur)?;
        expect_crlf(&mut cur)?;
        if size == 0 {
            break;
        }

        if data.len().saturating_add(size) > MAX_DECODED_BODY {
            return Err(ParseError::InvalidFormat);
        }

        let bytes = cur.take(size).ok_or(ParseError::InvalidFormat)?;
        data.try_reserve(size)
            .map_err(|_| ParseError::AllocationFailure)?;
        data.extend_from_slice(bytes);
        expect_crlf(&mut cur)?;
    }

    let trailers = trailer_block(raw, &mut cur)?;
    data.shrink_to_fit();

    Ok(DecodedBody {
        data,
        trailers,
        request_end: cur.pos(),
    })
}

/// Reads hex digits up to the CR ending the size line. Extensions are not
/// supported, so anything that is not a hex digit is malformed.
fn chunk_size(cur: &mut ByteCursor<'_>) -> ParseResult<usize> {
    let mut size: usize = 0;
    let mut digits = 0;

    loop {
        match cur.peek() {
            Some(b'\r') => return Ok(size),
            Some(b) => {
                digits += 1;
                if digits > MAX_SIZE_DIGITS {
                    return Err(ParseError::InvalidFormat);
                }
                let value = hex_value(b).ok_or(ParseError::InvalidFormat)?;
                size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(value))
                    .ok_or(ParseError::InvalidFormat)?;
                cur.advance(1);
            }
            None => return Err(ParseError::InvalidFormat),
        }
    }
}

fn hex_value(b: u8) -> Option<usize> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as usize),
        b'A'..=b'F' => Some((b - b'A') as usize + 10),
        b'a'..=b'f' => Some((b - b'a') as usize + 10),
        _ => None,
    }
}

fn expect_crlf(cur: &mut ByteCursor<'_>) -> ParseResult<()> {
    if cur.starts_with(b"\r\n") {
        cur.advance(2);
        Ok(())
    } else {
        Err(ParseError::InvalidFormat)
    }
}

/// Consumes the trailer block after the zero chunk: either an immediate empty
/// line, or `key: value` lines through the terminating empty line. Lines
/// without a colon keep their framing but are not stored.
fn trailer_block<'buf>(
    raw: &'buf [u8],
    cur: &mut ByteCursor<'buf>,
) -> ParseResult<Vec<(&'buf [u8], &'buf [u8])>> {
    let mut trailers = Vec::new();

    loop {
        if cur.starts_with(b"\r\n") {
            cur.advance(2);
            return Ok(trailers);
        }

        let line_start = cur.pos();
        let line_end = cur.find(b"\r\n").ok_or(ParseError::InvalidFormat)?;
        if let Some(pair) = super::request::split_header_line(&raw[line_start..line_end]) {
            trailers.push(pair);
        }
        cur.seek(line_end + 2);
    }
}
