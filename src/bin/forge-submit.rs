//! forge-submit - submit one source file and print the result.
//!
//! Usage: `forge-submit <host:port> <file>`. Sends the file under the
//! `compile-execute` tag, waits for the response, prints the combined
//! program output (or the error report) and exits non-zero on failure.

use std::path::Path;
use std::process::exit;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use forgewire::client::Client;
use forgewire::protocol::tags;

enum Response {
    Output(Vec<u8>),
    Error(String),
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (addr, file) = match (args.next(), args.next()) {
        (Some(addr), Some(file)) => (addr, file),
        _ => {
            eprintln!("usage: forge-submit <host:port> <file>");
            exit(2);
        }
    };

    let (tx, rx) = mpsc::channel::<Response>();
    let tx = Arc::new(Mutex::new(tx));

    let client = {
        let on_output = Arc::clone(&tx);
        let on_error = Arc::clone(&tx);
        Client::builder()
            .handle(tags::COMPILE_EXECUTE, move |payload| {
                let _ = on_output.lock().send(Response::Output(payload.to_vec()));
            })
            .handle(tags::ERROR_INFORMATION, move |payload| {
                let message = String::from_utf8_lossy(payload).into_owned();
                let _ = on_error.lock().send(Response::Error(message));
            })
            .on_error(|message| eprintln!("forge-submit: transport error: {message}"))
            .connect(addr.as_str())
    };
    let client = match client {
        Ok(client) => client,
        Err(err) => {
            eprintln!("forge-submit: cannot connect to {addr}: {err}");
            exit(1);
        }
    };

    if let Err(err) = client.send_source(tags::COMPILE_EXECUTE, Path::new(&file)) {
        eprintln!("forge-submit: failed to send {file}: {err}");
        exit(1);
    }

    match rx.recv_timeout(Duration::from_secs(120)) {
        Ok(Response::Output(payload)) => {
            // Payload: <filename>\0<combined output>
            let output = match payload.iter().position(|&b| b == 0) {
                Some(nul) => &payload[nul + 1..],
                None => &payload[..],
            };
            print!("{}", String::from_utf8_lossy(output));
            client.disconnect();
        }
        Ok(Response::Error(message)) => {
            eprintln!("forge-submit: server reported an error:\n{message}");
            client.disconnect();
            exit(1);
        }
        Err(_) => {
            eprintln!("forge-submit: timed out waiting for a response");
            client.disconnect();
            exit(1);
        }
    }
}
