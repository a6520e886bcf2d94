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

//! Path-safe static file serving.
//!
//! The handler a worker invokes for every successfully parsed request. A URL
//! path is percent-decoded, normalized segment by segment, joined under the
//! document root, and resolved with `realpath`; the resolved path must still
//! be under the (resolved) root before anything is opened. File contents are
//! streamed in fixed-size slices with partial-write-safe sends.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::info;

use crate::parser::RequestView;
use crate::response;

const INDEX_FILE: &str = "/index.html";
const STREAM_BUFFER_SIZE: usize = 8192;

/// Serves files from a document root. One instance per worker.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// Creates a handler rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StaticFiles { root: root.into() }
    }

    /// Answers one parsed request and logs the outcome. Only `GET` is
    /// honored; everything else is 405 with an empty body.
    pub fn handle(&self, stream: &mut impl Write, request: &RequestView<'_>) {
        let version = Some(request.version);

        if request.method != b"GET" {
            response::send_response(stream, version, 405, None, &[]);
            log_request(request, 405, 0);
            return;
        }

        let Ok(url) = std::str::from_utf8(request.path) else {
            response::send_response(stream, version, 400, None, &[]);
            log_request(request, 400, 0);
            return;
        };

        match self.resolve(url) {
            Ok(path) => {
                let (status, sent) = self.send_file(stream, version, &path);
                log_request(request, status, sent);
            }
            Err(status) => {
                response::send_response(stream, version, status, None, &[]);
                log_request(request, status, 0);
            }
        }
    }

    /// Resolves a URL path to a file under the root, or the error status to
    /// answer with.
    fn resolve(&self, url: &str) -> Result<PathBuf, u16> {
        let url = if url == "/" { INDEX_FILE } else { url };
        if !url.starts_with('/') {
            return Err(400);
        }

        let decoded = percent_decode(url).ok_or(400u16)?;
        let normalized = normalize(&decoded).ok_or(403u16)?;

        let root = fs::canonicalize(&self.root).map_err(|e| status_for_io(&e))?;
        let resolved = fs::canonicalize(root.join(normalized.trim_start_matches('/')))
            .map_err(|e| status_for_io(&e))?;

        if !resolved.starts_with(&root) {
            return Err(403);
        }

        Ok(resolved)
    }

    /// Streams a resolved file. Returns the status answered and the body
    /// bytes that went out.
    fn send_file(
        &self,
        stream: &mut impl Write,
        version: Option<&[u8]>,
        path: &Path,
    ) -> (u16, u64) {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                let status = status_for_io(&err);
                response::send_response(stream, version, status, None, &[]);
                return (status, 0);
            }
        };

        if !metadata.is_file() {
            response::send_response(stream, version, 403, None, &[]);
            return (403, 0);
        }

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                let status = status_for_io(&err);
                response::send_response(stream, version, status, None, &[]);
                return (status, 0);
            }
        };

        let length = metadata.len();
        let head = response::serialize_head(version, 200, Some(mime_type(path)), length);
        if !response::send_all(stream, &head) {
            return (200, 0);
        }

        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut sent = 0u64;
        while sent < length {
            let read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            if !response::send_all(stream, &buffer[..read]) {
                break;
            }
            sent += read as u64;
        }

        (200, sent)
    }
}

/// Decodes `%XX` escapes. Rejects backslashes, control bytes (raw or
/// decoded), dangling escapes, and anything that is not UTF-8 afterwards.
fn percent_decode(url: &str) -> Option<String> {
    let bytes = url.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\\' || b < 0x20 || b == 0x7f {
            return None;
        }

        if b == b'%' {
            let hi = hex_digit(*bytes.get(i + 1)?)?;
            let lo = hex_digit(*bytes.get(i + 2)?)?;
            decoded.push(hi << 4 | lo);
            i += 3;
        } else {
            decoded.push(b);
            i += 1;
        }
    }

    if decoded.iter().any(|&b| b < 0x20 || b == 0x7f) {
        return None;
    }

    String::from_utf8(decoded).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Normalizes path segments with a stack: `.` is dropped, `..` pops, and a
/// pop with nothing left means the path tried to climb out of the root.
fn normalize(path: &str) -> Option<String> {
    let mut stack: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            segment => stack.push(segment),
        }
    }

    let mut normalized = String::with_capacity(path.len());
    for segment in &stack {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }

    Some(normalized)
}

/// Maps filesystem errors to status codes.
fn status_for_io(err: &io::Error) -> u16 {
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOENT | Errno::ENOTDIR) => 404,
        Some(Errno::EACCES | Errno::EPERM) => 403,
        Some(Errno::EINVAL) => 400,
        Some(Errno::ENAMETOOLONG) => 414,
        _ => match err.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::PermissionDenied => 403,
            _ => 500,
        },
    }
}

/// MIME type by file extension; binary fallback otherwise.
fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn log_request(request: &RequestView<'_>, status: u16, bytes: u64) {
    info!(
        method = %String::from_utf8_lossy(request.method),
        path = %String::from_utf8_lossy(request.path),
        status,
        bytes,
        "request"
    );
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::{mime_type, normalize, percent_decode, StaticFiles};
    use crate::parser::parse;

    fn docroot() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();
        fs::write(dir.path().join("notes.txt"), "some notes").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a b.txt"), "spaced").unwrap();
        dir
    }

    fn respond(handler: &StaticFiles, raw: &[u8]) -> String {
        let mut out = Vec::new();
        let view = parse(raw).unwrap();
        handler.handle(&mut out, &view);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn root_serves_the_index_file() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Content-Type: text/html\r\n"));
        assert!(reply.contains("Content-Length: 17\r\n"));
        assert!(reply.ends_with("<html>home</html>"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"GET /nope.html HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(reply.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn non_get_methods_are_rejected() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"PUT / HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(reply.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn directories_are_forbidden() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"GET /sub HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn traversal_cannot_escape_the_root() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        for path in [
            "/../etc/passwd",
            "/../../etc/passwd",
            "/sub/../../../etc/passwd",
            "/%2e%2e/etc/passwd",
        ] {
            let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
            let reply = respond(&handler, raw.as_bytes());
            assert!(
                reply.starts_with("HTTP/1.1 403 Forbidden\r\n"),
                "{path} answered {reply}"
            );
        }
    }

    #[test]
    fn dotdot_inside_the_root_still_resolves() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"GET /sub/../notes.txt HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("some notes"));
    }

    #[test]
    fn percent_encoded_paths_resolve_after_decoding() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        let reply = respond(&handler, b"GET /sub/a%20b.txt HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("spaced"));
    }

    #[test]
    fn bad_escapes_and_backslashes_are_bad_requests() {
        let dir = docroot();
        let handler = StaticFiles::new(dir.path());
        for path in ["/a%2", "/a%zz", "/a\\b", "/%00"] {
            let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
            let reply = respond(&handler, raw.as_bytes());
            assert!(
                reply.starts_with("HTTP/1.1 400 Bad Request\r\n"),
                "{path} answered {reply}"
            );
        }
    }

    #[test]
    fn percent_decode_rejects_decoded_control_bytes() {
        assert_eq!(None, percent_decode("/%00"));
        assert_eq!(None, percent_decode("/%1f"));
        assert_eq!(Some("/a b".to_string()), percent_decode("/a%20b"));
        assert_eq!(Some("/ab".to_string()), percent_decode("/ab"));
    }

    #[test]
    fn normalize_resolves_dots_with_a_segment_stack() {
        assert_eq!(Some("/a/c".to_string()), normalize("/a/b/../c"));
        assert_eq!(Some("/a".to_string()), normalize("/./a/."));
        assert_eq!(Some("/".to_string()), normalize("/a/.."));
        assert_eq!(Some("/".to_string()), normalize("/"));
        assert_eq!(None, normalize("/.."));
        assert_eq!(None, normalize("/a/../../b"));
    }

    #[test]
    fn mime_types_follow_the_extension() {
        use std::path::Path;
        assert_eq!("text/html", mime_type(Path::new("a/index.html")));
        assert_eq!("text/html", mime_type(Path::new("a.htm")));
        assert_eq!("text/css", mime_type(Path::new("style.css")));
        assert_eq!("application/javascript", mime_type(Path::new("app.js")));
        assert_eq!("image/png", mime_type(Path::new("i.png")));
        assert_eq!("image/jpeg", mime_type(Path::new("i.jpeg")));
        assert_eq!("application/json", mime_type(Path::new("d.json")));
        assert_eq!("text/plain", mime_type(Path::new("notes.txt")));
        assert_eq!("application/octet-stream", mime_type(Path::new("noext")));
        assert_eq!("application/octet-stream", mime_type(Path::new("a.rs")));
    }
}
