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

//! Request line and header block parsing.

use super::cursor::find;
use super::{ParseError, ParseResult, RequestError};

/// Upper bound on accepted header lines in one request.
pub(crate) const MAX_HEADERS: usize = 100;

/// The three request-line tokens plus the offset of the header block.
#[derive(Debug)]
pub(crate) struct RequestLine<'buf> {
    pub method: &'buf [u8],
    pub path: &'buf [u8],
    pub version: &'buf [u8],
    pub headers_start: usize,
}

/// Parsed header block plus the offset of the first body byte.
#[derive(Debug)]
pub(crate) struct HeaderBlock<'buf> {
    pub headers: Vec<(&'buf [u8], &'buf [u8])>,
    pub body_start: usize,
}

/// Splits the request line on single spaces into exactly three tokens.
///
/// A missing or empty token is reported as the error for that token's
/// position; a fourth token (which a trailing or doubled space produces) is a
/// structural failure. No method or path characters are validated here; the
/// application handler decides which methods it honors.
pub(crate) fn request_line(raw: &[u8]) -> Result<RequestLine<'_>, RequestError<'_>> {
    let line_end = find(raw, b"\r\n", 0).ok_or(ParseError::InvalidFormat)?;
    let line = &raw[..line_end];
    let headers_start = line_end + 2;

    let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    if tokens.len() > 3 {
        // a doubled or trailing space splits into extra (possibly empty)
        // tokens; a rejection can still echo the version when the third
        // token produced one
        return Err(RequestError {
            kind: ParseError::InvalidFormat,
            version: tokens.get(2).copied().filter(|t| !t.is_empty()),
        });
    }

    let token = |index: usize, missing: ParseError| {
        tokens
            .get(index)
            .copied()
            .filter(|t| !t.is_empty())
            .ok_or(missing)
    };
    let method = token(0, ParseError::InvalidMethod)?;
    let path = token(1, ParseError::InvalidPath)?;
    let version = token(2, ParseError::InvalidProtocol)?;

    Ok(RequestLine {
        method,
        path,
        version,
        headers_start,
    })
}

/// Collects `key: value` pairs up to the end-of-headers marker.
///
/// The marker search starts two bytes early so that a request without any
/// headers (`…HTTP/1.1\r\n\r\n`) finds the marker straddling the request
/// line's CR-LF. A line without a colon ends collection; everything gathered
/// so far stands and the parse succeeds.
pub(crate) fn headers(raw: &[u8], headers_start: usize) -> ParseResult<HeaderBlock<'_>> {
    let marker = find(raw, b"\r\n\r\n", headers_start.saturating_sub(2))
        .ok_or(ParseError::InvalidFormat)?;
    let body_start = marker + 4;
    let region_end = marker.max(headers_start);

    let mut headers = Vec::with_capacity(16);
    let mut pos = headers_start;

    while pos < region_end {
        // in-bounds: the marker itself terminates the last line
        let line_end = find(raw, b"\r\n", pos).unwrap_or(region_end);
        let Some(header) = split_header_line(&raw[pos..line_end]) else {
            break;
        };

        if headers.len() == MAX_HEADERS {
            return Err(ParseError::InvalidFormat);
        }
        headers.push(header);
        pos = line_end + 2;
    }

    Ok(HeaderBlock {
        headers,
        body_start,
    })
}

/// Splits one header line at the first colon. The key is taken verbatim; the
/// value skips leading spaces (0x20 only) and is not trimmed on the right.
pub(crate) fn split_header_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    let key = &line[..colon];
    let value = &line[colon + 1..];
    let skip = value.iter().take_while(|&&b| b == b' ').count();
    Some((key, &value[skip..]))
}

#[cfg(test)]
mod test {
    use super::{headers, request_line, split_header_line};
    use crate::parser::ParseError;

    #[test]
    fn request_line_splits_three_tokens() {
        let line = request_line(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(b"GET", line.method);
        assert_eq!(b"/index.html", line.path);
        assert_eq!(b"HTTP/1.1", line.version);
        assert_eq!(26, line.headers_start);
    }

    #[test]
    fn request_line_without_crlf_is_malformed() {
        let err = request_line(b"GET / HTTP/1.1").unwrap_err();
        assert_eq!(ParseError::InvalidFormat, err.kind);
    }

    #[test]
    fn request_line_missing_version_is_invalid_protocol() {
        let err = request_line(b"GET /\r\n\r\n").unwrap_err();
        assert_eq!(ParseError::InvalidProtocol, err.kind);
    }

    #[test]
    fn request_line_missing_path_is_invalid_path() {
        let err = request_line(b"GET\r\n\r\n").unwrap_err();
        assert_eq!(ParseError::InvalidPath, err.kind);
    }

    #[test]
    fn request_line_empty_line_is_invalid_method() {
        let err = request_line(b"\r\n\r\n").unwrap_err();
        assert_eq!(ParseError::InvalidMethod, err.kind);
    }

    #[test]
    fn request_line_trailing_space_is_malformed() {
        let err = request_line(b"GET / HTTP/1.1 \r\n\r\n").unwrap_err();
        assert_eq!(ParseError::InvalidFormat, err.kind);
        // the version still surfaced for the error response
        assert_eq!(Some(b"HTTP/1.1" as &[u8]), err.version);
    }

    #[test]
    fn request_line_doubled_space_is_malformed() {
        let err = request_line(b"GET  / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(ParseError::InvalidFormat, err.kind);
    }

    #[test]
    fn headers_preserve_order_and_duplicates() {
        let raw = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n";
        let block = headers(raw, 16).unwrap();
        let pairs: Vec<_> = block
            .headers
            .iter()
            .map(|&(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(
            vec![
                (b"A".to_vec(), b"1".to_vec()),
                (b"B".to_vec(), b"2".to_vec()),
                (b"A".to_vec(), b"3".to_vec()),
            ],
            pairs
        );
        assert_eq!(raw.len(), block.body_start);
    }

    #[test]
    fn empty_header_block_finds_straddled_marker() {
        let raw = b"PUT / HTTP/1.1\r\n\r\n";
        let block = headers(raw, 16).unwrap();
        assert!(block.headers.is_empty());
        assert_eq!(18, block.body_start);
    }

    #[test]
    fn missing_end_of_headers_marker_is_malformed() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert_eq!(Err(ParseError::InvalidFormat), headers(raw, 16).map(|_| ()));
    }

    #[test]
    fn line_without_colon_stops_collection() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nnot a header\r\nIgnored: yes\r\n\r\n";
        let block = headers(raw, 16).unwrap();
        assert_eq!(1, block.headers.len());
        assert_eq!((b"Host" as &[u8], b"x" as &[u8]), block.headers[0]);
        assert_eq!(raw.len(), block.body_start);
    }

    #[test]
    fn header_value_skips_leading_spaces_only() {
        assert_eq!(
            Some((b"Key" as &[u8], b"value  " as &[u8])),
            split_header_line(b"Key:    value  ")
        );
        assert_eq!(
            Some((b"Key" as &[u8], b"\tvalue" as &[u8])),
            split_header_line(b"Key: \tvalue")
        );
    }

    #[test]
    fn header_key_is_not_trimmed() {
        assert_eq!(
            Some((b" Key " as &[u8], b"v" as &[u8])),
            split_header_line(b" Key : v")
        );
    }
}
