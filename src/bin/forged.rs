//! forged - the compile-and-execute daemon.
//!
//! Usage: `forged [port]` (default 3040). Binds all interfaces, creates the
//! working directories next to the current directory, and serves until
//! killed. Log verbosity follows `RUST_LOG`; output goes to the service's
//! log directory when it is writable, to stderr otherwise.

use std::fs::File;
use std::process::exit;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use forgewire::reactor::EventLoop;
use forgewire::server::{TcpServer, DEFAULT_PORT};
use forgewire::service::{register_service, ServiceConfig};

fn main() {
    let port = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("usage: forged [port]");
                exit(2);
            }
        },
        None => DEFAULT_PORT,
    };

    let config = ServiceConfig::default();
    if let Err(err) = config.ensure_directories() {
        eprintln!("forged: failed to create working directories: {err}");
        exit(1);
    }
    init_tracing(&config);

    let event_loop = EventLoop::new().unwrap_or_else(|err| {
        eprintln!("forged: fatal: event loop initialization failed: {err}");
        exit(1);
    });
    let server = TcpServer::new(&event_loop, port, "forged").unwrap_or_else(|err| {
        eprintln!("forged: fatal: cannot bind port {port}: {err}");
        exit(1);
    });

    register_service(&server, config);
    server.start();
    tracing::info!(port = server.local_port(), "forged ready");

    event_loop.run();
}

fn init_tracing(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match File::create(config.log_dir.join("forged.log")) {
        Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
        Err(_) => builder.with_writer(std::io::stderr).init(),
    }
}
