//! Relay Example - Interactive broadcast chat
//!
//! Run one host and any number of clients. Every line a client types is
//! relayed by the host to all other connected clients.
//!
//! ## Architecture
//!
//! - The event loop runs on its own thread
//! - In client mode the main thread reads lines from stdin and sends them
//!   through a [`ServerHandle`]
//! - `/exit` disconnects the client
//!
//! # Usage
//!
//! ```bash
//! cargo run --example relay -- host
//! cargo run --example relay -- client --address 127.0.0.1
//! ```

use clap::{Parser, ValueEnum};
use config::Config;
use relaycomm::{Mode, Server, ServerConfig, ServerHandle};
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for relaycomm crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("relaycomm={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Host,
    Client,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Broadcast relay", long_about = None)]
struct Args {
    /// Run as the relay host or as a client of one
    #[arg(value_enum, default_value_t = ModeArg::Client)]
    mode: ModeArg,

    /// Host address to connect to (client mode)
    #[arg(short, long)]
    address: Option<Ipv4Addr>,

    /// Port to listen on (host) or connect to (client)
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut server_config = match ServerConfig::from_config(&config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(address) = args.address {
        server_config.address = u32::from(address);
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }

    let mode = match args.mode {
        ModeArg::Host => Mode::Host,
        ModeArg::Client => Mode::Client,
    };

    let mut server = match Server::connect(mode, server_config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Failed to connect/create server: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = server.local_addr() {
        eprintln!("{mode:?} running on {addr}");
    }

    let handle = server.handle();
    let event_loop = thread::spawn(move || {
        let result = server.run();
        server.disconnect();
        result
    });

    if mode == Mode::Client {
        input_loop(&handle);
    }

    match event_loop.join() {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!("Event loop panicked");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Input Loop
// ============================================================================

fn input_loop(handle: &ServerHandle) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        if handle.is_shutdown() {
            break;
        }

        let Ok(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input == "/exit" {
            handle.shutdown();
            return;
        }

        if let Err(err) = handle.send(input) {
            eprintln!("ERROR: Didn't send: {err}");
        }
    }

    // stdin closed
    handle.shutdown();
}
