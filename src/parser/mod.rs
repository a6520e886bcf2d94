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

//! Zero-copy HTTP/1.x request parsing.
//!
//! [`parse`] consumes the bytes one `read` produced for a connection and
//! returns a [`RequestView`] borrowing from that buffer. The view owns only
//! its header and trailer arrays and, for chunked transfers, the decoded body
//! bytes; everything else is a sub-slice of the receive buffer, which must
//! outlive the view. The buffer is never written to; every field is an
//! explicit span of the received bytes.
//!
//! Parsing runs in stages (request line, headers, body framing, chunked
//! decoding) and stops at the first failing stage.

mod chunked;
mod cursor;
mod request;

use thiserror::Error;

/// Represents possible failures while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The receive buffer held no bytes, or only whitespace.
    #[error("request is empty")]
    EmptyRequest,
    /// The request line carries no method token.
    #[error("missing or empty method token")]
    InvalidMethod,
    /// The request line carries no path token.
    #[error("missing or empty path token")]
    InvalidPath,
    /// The request line carries no protocol version token.
    #[error("missing or empty protocol version token")]
    InvalidProtocol,
    /// Structural malformation: a missing CR-LF, excess request-line tokens,
    /// too many headers, or bad chunked framing.
    #[error("malformed request")]
    InvalidFormat,
    /// A declared body length runs past the received bytes.
    #[error("body runs past the received bytes")]
    OutOfBounds,
    /// Growing the decoded-body buffer failed.
    #[error("body buffer allocation failed")]
    AllocationFailure,
    /// A `Transfer-Encoding` other than `chunked` was requested.
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
}

/// Result whose Err variant is `ParseError`.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// A rejected request: the failure kind plus the protocol version token when
/// the request line got far enough to produce one, so that the error response
/// can echo `HTTP/1.0` to a 1.0 client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestError<'buf> {
    /// Why the request was rejected.
    pub kind: ParseError,
    /// The version token, if one was parsed before the failure.
    pub version: Option<&'buf [u8]>,
}

impl From<ParseError> for RequestError<'_> {
    fn from(kind: ParseError) -> Self {
        RequestError {
            kind,
            version: None,
        }
    }
}

/// Body of a parsed request. Ownership is explicit in the type: `Borrowed`
/// bodies live inside the receive buffer, `Owned` storage exists only when a
/// chunked transfer was decoded.
#[derive(Debug, PartialEq, Eq)]
pub enum Body<'buf> {
    /// No body framing headers were present.
    Empty,
    /// `Content-Length` framing: a sub-slice of the receive buffer.
    Borrowed(&'buf [u8]),
    /// Decoded chunked transfer.
    Owned(Vec<u8>),
}

impl Body<'_> {
    /// The body bytes; empty when there is no body.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Borrowed(bytes) => bytes,
            Body::Owned(bytes) => bytes,
        }
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// True when the body holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// True when the body lives in owned storage (decoded chunked transfer).
    pub fn is_owned(&self) -> bool {
        matches!(self, Body::Owned(_))
    }
}

/// Structured view over one request's receive buffer.
///
/// All boundary offsets index into [`raw`](Self::raw) and satisfy
/// `headers_start <= body_start <= request_end <= raw.len()`. Dropping the
/// view releases its owned allocations; the receive buffer stays with the
/// caller.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestView<'buf> {
    /// The received bytes this view borrows from.
    pub raw: &'buf [u8],
    /// Method token, e.g. `GET`.
    pub method: &'buf [u8],
    /// Request target, e.g. `/index.html`.
    pub path: &'buf [u8],
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: &'buf [u8],
    /// Header pairs in received order, duplicates preserved.
    pub headers: Vec<(&'buf [u8], &'buf [u8])>,
    /// Trailer pairs from a chunked body; empty otherwise.
    pub trailers: Vec<(&'buf [u8], &'buf [u8])>,
    /// The request body.
    pub body: Body<'buf>,
    /// Offset of the request line.
    pub request_start: usize,
    /// Offset of the first header byte.
    pub headers_start: usize,
    /// Offset of the first body byte.
    pub body_start: usize,
    /// Offset one past the last byte belonging to the request.
    pub request_end: usize,
    /// Whether `Transfer-Encoding: chunked` framed the body.
    pub is_chunked: bool,
}

impl<'buf> RequestView<'buf> {
    /// Value of the last header whose key equals `name` byte-exactly.
    ///
    /// Names are case-sensitive and duplicates resolve to the last
    /// occurrence, the same rule the body-framing scan applies to
    /// `Content-Length` and `Transfer-Encoding`.
    pub fn header(&self, name: &[u8]) -> Option<&'buf [u8]> {
        self.headers
            .iter()
            .rev()
            .find(|&&(key, _)| key == name)
            .map(|&(_, value)| value)
    }
}

/// Parses the bytes of one request.
///
/// # Example
/// ```
/// # use preforkd::parser::{parse, Body};
/// let view = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
/// assert_eq!(b"GET", view.method);
/// assert_eq!(b"/", view.path);
/// assert_eq!(Body::Empty, view.body);
/// ```
pub fn parse(raw: &[u8]) -> Result<RequestView<'_>, RequestError<'_>> {
    if raw
        .iter()
        .all(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
    {
        return Err(ParseError::EmptyRequest.into());
    }

    let line = request::request_line(raw)?;
    let version = line.version;
    let reject = |kind: ParseError| RequestError {
        kind,
        version: Some(version),
    };

    let block = request::headers(raw, line.headers_start).map_err(reject)?;

    let mut view = RequestView {
        raw,
        method: line.method,
        path: line.path,
        version,
        headers: block.headers,
        trailers: Vec::new(),
        body: Body::Empty,
        request_start: 0,
        headers_start: line.headers_start,
        body_start: block.body_start,
        request_end: block.body_start,
        is_chunked: false,
    };

    // body framing: chunked transfer takes precedence over Content-Length
    match view.header(b"Transfer-Encoding") {
        Some(b"chunked") => {
            view.is_chunked = true;
            let decoded = chunked::decode(raw, view.body_start).map_err(reject)?;
            view.trailers = decoded.trailers;
            view.request_end = decoded.request_end;
            view.body = Body::Owned(decoded.data);
        }
        Some(_) => return Err(reject(ParseError::UnsupportedTransferEncoding)),
        None => {
            if let Some(value) = view.header(b"Content-Length") {
                let length = ascii_to_usize(value);
                let end = view
                    .body_start
                    .checked_add(length)
                    .filter(|&end| end <= raw.len())
                    .ok_or_else(|| reject(ParseError::OutOfBounds))?;
                view.body = Body::Borrowed(&raw[view.body_start..end]);
                view.request_end = end;
            }
        }
    }

    Ok(view)
}

/// Length parse in the manner of `atoi`: leading decimal digits, anything
/// else ends the number, no digits at all is zero.
fn ascii_to_usize(value: &[u8]) -> usize {
    let mut n: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add(usize::from(b - b'0'));
    }
    n
}
