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

//! Master supervisor.
//!
//! The master builds the listening socket, forks the worker set which
//! inherits it, and then does nothing but reap: every ~200 ms it drains all
//! exited children and forks a replacement into each vacated slot. A
//! termination signal flips one atomic flag; the loop then broadcasts
//! SIGTERM, waits for every worker, and closes the listener so the port frees
//! up immediately.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, socket, sockopt::ReuseAddr, AddressFamily, Backlog,
    SockFlag, SockProtocol, SockType, SockaddrIn,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::{info, warn};

use crate::worker;

/// Hard ceiling on the worker table.
pub const MAX_WORKERS: usize = 32;

const REAP_INTERVAL: Duration = Duration::from_millis(200);

static MASTER_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn master_on_signal(_sig: libc::c_int) {
    // async-signal-safe: a single atomic store
    MASTER_RUNNING.store(false, Ordering::Relaxed);
}

/// Installs the SIGINT/SIGTERM handlers that stop [`Server::master_loop`].
pub fn install_master_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(master_on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

/// Failures that abort server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Creating, configuring, binding, or listening on the socket failed.
    #[error("listener setup failed: {0}")]
    ListenerSetup(Errno),
    /// An operation required the listener before `setup_listener` ran.
    #[error("no listening socket; call setup_listener first")]
    NoListener,
    /// Forking the initial worker set failed.
    #[error("spawning workers failed: {0}")]
    SpawnWorkers(Errno),
}

/// Immutable socket and supervision configuration. No CLI or environment
/// surface exists; deployments change the defaults here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address family of the listening socket.
    pub family: AddressFamily,
    /// Socket type.
    pub sock_type: SockType,
    /// Transport protocol.
    pub protocol: SockProtocol,
    /// IPv4 interface to bind.
    pub interface: Ipv4Addr,
    /// TCP port to bind. Port 0 lets the kernel pick (used by tests).
    pub port: u16,
    /// Listen backlog.
    pub backlog: i32,
    /// Worker processes to keep alive; clamped to [`MAX_WORKERS`].
    pub worker_count: usize,
    /// Document root served by the workers.
    pub doc_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            family: AddressFamily::Inet,
            sock_type: SockType::Stream,
            protocol: SockProtocol::Tcp,
            interface: Ipv4Addr::UNSPECIFIED,
            port: 8080,
            backlog: 128,
            worker_count: 4,
            doc_root: PathBuf::from("./www"),
        }
    }
}

/// One slot in the worker table. Slots are stable: a worker that dies is
/// replaced by a fresh fork recorded under the same slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    /// Slot index.
    pub slot: usize,
    /// Live worker pid, or None while the slot awaits a respawn.
    pub pid: Option<Pid>,
}

/// Supervisor state: configuration, the shared listener, and the worker
/// table. Created by the master before forking; workers only ever read it.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    listener: Option<OwnedFd>,
    bound: Option<SocketAddrV4>,
    workers: Vec<WorkerSlot>,
}

impl Server {
    /// Initializes supervisor state. Opens no sockets.
    pub fn create(config: ServerConfig) -> Self {
        let count = config.worker_count.min(MAX_WORKERS);
        let workers = (0..count).map(|slot| WorkerSlot { slot, pid: None }).collect();

        Server {
            config,
            listener: None,
            bound: None,
            workers,
        }
    }

    /// The configuration this server was created with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Raw listening descriptor shared with the workers.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// The address the listener actually bound (resolves port 0).
    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.bound
    }

    /// Current worker table.
    pub fn workers(&self) -> &[WorkerSlot] {
        &self.workers
    }

    /// Creates the listening socket: non-blocking, address reuse, bound to
    /// the configured interface and port, listening with the configured
    /// backlog. Must run in the master before [`Self::spawn_workers`].
    pub fn setup_listener(&mut self) -> Result<(), ServerError> {
        let fd = socket(
            self.config.family,
            self.config.sock_type,
            SockFlag::empty(),
            self.config.protocol,
        )
        .map_err(ServerError::ListenerSetup)?;

        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(ServerError::ListenerSetup)?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(ServerError::ListenerSetup)?;

        setsockopt(&fd, ReuseAddr, &true).map_err(ServerError::ListenerSetup)?;

        let requested = SockaddrIn::from(SocketAddrV4::new(
            self.config.interface,
            self.config.port,
        ));
        bind(fd.as_raw_fd(), &requested).map_err(ServerError::ListenerSetup)?;

        let backlog = Backlog::new(self.config.backlog).map_err(ServerError::ListenerSetup)?;
        listen(&fd, backlog).map_err(ServerError::ListenerSetup)?;

        let bound: SockaddrIn = getsockname(fd.as_raw_fd()).map_err(ServerError::ListenerSetup)?;
        self.bound = Some(SocketAddrV4::new(Ipv4Addr::from(bound.ip()), bound.port()));
        self.listener = Some(fd);

        Ok(())
    }

    /// Forks the initial worker set. Each child runs the worker event loop
    /// over the inherited listener and never returns.
    pub fn spawn_workers(&mut self) -> Result<(), ServerError> {
        if self.listener.is_none() {
            return Err(ServerError::NoListener);
        }

        for index in 0..self.workers.len() {
            let pid = self.fork_worker().map_err(ServerError::SpawnWorkers)?;
            self.workers[index].pid = Some(pid);
        }

        Ok(())
    }

    fn fork_worker(&self) -> Result<Pid, Errno> {
        // SAFETY: the child touches no inherited locks; it runs the
        // single-threaded worker loop and leaves through _exit
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                worker::run(self);
                unsafe { libc::_exit(0) }
            }
        }
    }

    /// Supervises until a termination signal clears the running flag: reaps
    /// every exited worker and refills vacated slots, then sleeps one reap
    /// interval.
    pub fn master_loop(&mut self) {
        while MASTER_RUNNING.load(Ordering::Relaxed) {
            self.reap_exited();
            self.refill_slots();
            thread::sleep(REAP_INTERVAL);
        }
    }

    /// Drains all children that have exited since the last tick.
    fn reap_exited(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { break };
                    if let Some(slot) = clear_slot(&mut self.workers, pid) {
                        warn!(slot, %pid, "worker exited");
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    warn!(%err, "reaping workers failed");
                    break;
                }
            }
        }
    }

    /// Forks a replacement into every empty slot. Best-effort: a failed fork
    /// leaves the slot empty for the next tick.
    fn refill_slots(&mut self) {
        for index in 0..self.workers.len() {
            if self.workers[index].pid.is_some() {
                continue;
            }

            match self.fork_worker() {
                Ok(pid) => {
                    info!(slot = index, %pid, "respawned worker");
                    self.workers[index].pid = Some(pid);
                }
                Err(err) => warn!(slot = index, %err, "respawn failed"),
            }
        }
    }

    /// Stops supervising: signals every live worker, waits for each one
    /// (restarting only on EINTR), then closes the listener. Closing last
    /// releases the bound port the moment the last worker is gone.
    pub fn shutdown(&mut self) {
        MASTER_RUNNING.store(false, Ordering::Relaxed);

        for worker in &self.workers {
            if let Some(pid) = worker.pid {
                if let Err(err) = kill(pid, Signal::SIGTERM) {
                    warn!(%pid, %err, "signaling worker failed");
                }
            }
        }

        for worker in &mut self.workers {
            let Some(pid) = worker.pid.take() else {
                continue;
            };
            loop {
                match waitpid(pid, None) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        warn!(%pid, %err, "waiting for worker failed");
                        break;
                    }
                }
            }
        }

        self.listener = None;
        info!("listener closed");
    }
}

/// Clears the table entry holding `pid`. Returns the slot index it occupied.
fn clear_slot(workers: &mut [WorkerSlot], pid: Pid) -> Option<usize> {
    let index = workers.iter().position(|w| w.pid == Some(pid))?;
    workers[index].pid = None;
    Some(index)
}
