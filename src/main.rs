//! Server entry point: set up the listener, fork the workers, supervise.

use std::process::ExitCode;

use tracing::{error, info};

use preforkd::server::{self, Server, ServerConfig};

fn main() -> ExitCode {
    tracing_subscriber::fmt().init();
    server::install_master_signal_handlers();

    let mut server = Server::create(ServerConfig::default());

    if let Err(err) = server.setup_listener() {
        error!(%err, "startup failed");
        return ExitCode::FAILURE;
    }

    if let Err(err) = server.spawn_workers() {
        error!(%err, "startup failed");
        return ExitCode::FAILURE;
    }

    if let Some(addr) = server.bound_addr() {
        info!(%addr, workers = server.workers().len(), "serving");
    }

    server.master_loop();
    server.shutdown();

    ExitCode::SUCCESS
}
