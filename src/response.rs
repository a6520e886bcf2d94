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

//! Response assembly and partial-write-safe emission.
//!
//! Every response closes the connection, so `Connection: close` and an exact
//! `Content-Length` are invariant. The protocol version is echoed only for an
//! exact `HTTP/1.0` request; everything else is answered as `HTTP/1.1`.

use std::fmt::Write as _;
use std::io::{ErrorKind, Write};

use crate::parser::{ParseError, RequestError};

/// Maps a parse failure to the status code of the error response.
pub fn parse_error_status(kind: ParseError) -> u16 {
    match kind {
        ParseError::InvalidMethod => 405,
        ParseError::InvalidProtocol => 505,
        ParseError::UnsupportedTransferEncoding => 501,
        ParseError::AllocationFailure => 500,
        ParseError::EmptyRequest
        | ParseError::InvalidPath
        | ParseError::InvalidFormat
        | ParseError::OutOfBounds => 400,
    }
}

/// Reason phrase for every status this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

/// Serializes the status line and headers for a response of `content_length`
/// body bytes, up to and including the blank line.
pub fn serialize_head(
    version: Option<&[u8]>,
    status: u16,
    content_type: Option<&str>,
    content_length: u64,
) -> Vec<u8> {
    let version = match version {
        Some(b"HTTP/1.0") => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let mut head = String::with_capacity(128);
    let _ = write!(
        head,
        "{version} {status} {reason}\r\nConnection: close\r\n",
        reason = reason_phrase(status)
    );
    if let Some(content_type) = content_type {
        let _ = write!(head, "Content-Type: {content_type}\r\n");
    }
    let _ = write!(head, "Content-Length: {content_length}\r\n\r\n");

    head.into_bytes()
}

/// Sends a complete response. Returns false when the connection was gone
/// before all bytes were written.
pub fn send_response(
    stream: &mut impl Write,
    version: Option<&[u8]>,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> bool {
    let mut bytes = serialize_head(version, status, content_type, body.len() as u64);
    bytes.extend_from_slice(body);
    send_all(stream, &bytes)
}

/// Sends the error response for a rejected request: mapped status, no body.
pub fn send_parse_error(stream: &mut impl Write, error: &RequestError<'_>) {
    let status = parse_error_status(error.kind);
    let head = serialize_head(error.version, status, None, 0);
    send_all(stream, &head);
}

/// Writes all of `bytes`, looping over partial writes. A zero-length write or
/// any error besides an interrupt means the peer is gone; the remainder is
/// abandoned silently and false is returned.
pub fn send_all(stream: &mut impl Write, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return false,
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(_) => return false,
        }
    }

    true
}
