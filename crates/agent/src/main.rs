//! Terminal container agent.
//!
//! A long-running broker that a terminal front-end uses to discover
//! container environments (the host session, podman, toolbox, distrobox)
//! and to spawn interactive processes inside them over shared PTYs. Serves
//! exactly one client over a socket inherited from the parent; its lifetime
//! is bounded by that socket.

use std::os::fd::{FromRawFd, OwnedFd};

use clap::Parser;
use color_eyre::{Report, Result};

mod agent;
mod container;
mod envdetect;
mod error;
mod fdmap;
mod podman;
mod process;
mod provider;
mod pty;
mod run_context;
mod util;

/// Terminal container agent; speaks D-Bus over an inherited socketpair.
#[derive(Parser)]
#[command(name = "boxterm-agent")]
struct Cli {
    /// The socketpair to communicate over
    #[clap(long = "socket-fd", value_name = "FD")]
    socket_fd: i32,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr so they never mix with the IPC socket.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

#[allow(unsafe_code)]
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    if cli.socket_fd <= 2 {
        eprintln!("usage: boxterm-agent --socket-fd=FD");
        eprintln!();
        eprintln!("socket-fd must be set to a FD > 2");
        std::process::exit(1);
    }

    // SAFETY: the descriptor was handed to us by our parent for exclusive
    // use; nothing else in this process refers to it.
    let socket = unsafe { OwnedFd::from_raw_fd(cli.socket_fd) };

    // Single-threaded cooperative scheduling: every handler, subprocess
    // wait and debounce timer is a task on this one loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let exit_code = runtime.block_on(agent::run(socket))?;
    std::process::exit(exit_code)
}
