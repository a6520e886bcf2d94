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

//! Worker event loop.
//!
//! Each forked worker runs this loop alone on one thread: a readiness set
//! over the shared listener plus every connection it has accepted. Workers
//! share nothing with their siblings; the kernel arbitrates which worker's
//! accept wins a new connection.
//!
//! Connections are one-shot. A readable client gets a single read into a
//! fixed buffer, one parse, one response, and the socket is closed; requests
//! that do not fit the buffer fail in the parser and are answered with an
//! error. There is deliberately no keep-alive and no second read.

use std::io::{ErrorKind, Read};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use slab::Slab;
use tracing::{debug, warn};

use crate::parser;
use crate::response;
use crate::server::Server;
use crate::static_files::StaticFiles;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 64;

/// One request must fit in a single receive buffer.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

static WORKER_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn worker_on_signal(_sig: libc::c_int) {
    // async-signal-safe: a single atomic store
    WORKER_RUNNING.store(false, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let terminate = SigAction::new(
        SigHandler::Handler(worker_on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the termination handler only performs an atomic store; a peer
    // reset raises SIGPIPE mid-send and must not kill the process
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &terminate);
        let _ = sigaction(Signal::SIGINT, &terminate);
        let _ = sigaction(Signal::SIGPIPE, &ignore);
    }
}

/// Runs the event loop over the server's inherited listener until a
/// termination signal clears the running flag. In-flight connections are
/// closed when the loop exits.
pub fn run(server: &Server) {
    install_signal_handlers();
    WORKER_RUNNING.store(true, Ordering::Relaxed);

    let Some(fd) = server.listener_fd() else {
        return;
    };

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            warn!(%err, "could not create readiness set");
            return;
        }
    };

    // SAFETY: the fd is a live listening socket owned by the server state;
    // it is released (not closed) below, so the wrapper never double-closes
    let mut listener = unsafe { TcpListener::from_raw_fd(fd) };
    if let Err(err) = poll
        .registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
    {
        warn!(%err, "could not register listener");
        let _ = listener.into_raw_fd();
        return;
    }

    let handler = StaticFiles::new(server.config().doc_root.clone());
    let mut connections: Slab<TcpStream> = Slab::new();
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    while WORKER_RUNNING.load(Ordering::Relaxed) {
        if let Err(err) = poll.poll(&mut events, None) {
            // a signal interrupting the wait is a normal wake
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            warn!(%err, "readiness wait failed");
            break;
        }

        for event in events.iter() {
            let token = event.token();

            if event.is_error() || event.is_read_closed() {
                if token != LISTENER_TOKEN {
                    close_connection(poll.registry(), &mut connections, token);
                }
                continue;
            }

            if token == LISTENER_TOKEN {
                accept_all(poll.registry(), &mut listener, &mut connections);
            } else if event.is_readable() {
                handle_connection(poll.registry(), &mut connections, token, &handler);
            }
        }
    }

    let _ = poll.registry().deregister(&mut listener);
    // the listener outlives this worker's loop; only release our handle
    let _ = listener.into_raw_fd();
}

/// Accepts every pending connection. mio's accept applies
/// `SOCK_NONBLOCK | SOCK_CLOEXEC` atomically; registering for readable
/// interest also delivers peer-hangup readiness on this platform.
fn accept_all(registry: &Registry, listener: &mut TcpListener, connections: &mut Slab<TcpStream>) {
    loop {
        match listener.accept() {
            Ok((mut stream, _)) => {
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                match registry.register(&mut stream, token, Interest::READABLE) {
                    Ok(()) => {
                        entry.insert(stream);
                    }
                    Err(err) => warn!(%err, "could not register connection"),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(%err, "accept failed");
                return;
            }
        }
    }
}

/// One-shot client handling: a single read, one parse, one response, close.
fn handle_connection(
    registry: &Registry,
    connections: &mut Slab<TcpStream>,
    token: Token,
    handler: &StaticFiles,
) {
    let Some(stream) = connections.get_mut(token.0) else {
        return;
    };

    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let received = match stream.read(&mut buffer) {
        Ok(0) => {
            close_connection(registry, connections, token);
            return;
        }
        Ok(n) => n,
        // spurious wakeup or interrupted read: the registration stands and
        // the next readiness event retries
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            return;
        }
        Err(err) => {
            debug!(%err, "read failed");
            close_connection(registry, connections, token);
            return;
        }
    };

    match parser::parse(&buffer[..received]) {
        Ok(request) => handler.handle(stream, &request),
        Err(error) => {
            debug!(kind = ?error.kind, "rejecting request");
            response::send_parse_error(stream, &error);
        }
    }

    close_connection(registry, connections, token);
}

fn close_connection(registry: &Registry, connections: &mut Slab<TcpStream>, token: Token) {
    if connections.contains(token.0) {
        let mut stream = connections.remove(token.0);
        let _ = registry.deregister(&mut stream);
    }
}
