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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! preforkd is a pre-forked, event-driven HTTP/1.x origin server.
//!
//! A master process opens one non-blocking listening socket, forks N worker
//! processes that inherit it, and supervises them (reaping exited workers and
//! forking replacements). Each worker runs a single-threaded readiness loop,
//! accepts connections, reads one buffer's worth of request bytes, parses
//! them zero-copy, and answers with a static file before closing the
//! connection. There is no keep-alive, no TLS, and no HTTP/2; every
//! connection carries exactly one request.

pub mod parser;
pub mod response;
pub mod server;
pub mod static_files;
pub mod worker;
