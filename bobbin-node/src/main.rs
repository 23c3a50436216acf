//! The bobbin process.
//!
//! Binds the local UDP endpoint, brings up the layer stack for the
//! configured milestone, and runs until SIGINT/SIGTERM, at which point it
//! stops packet processing and flushes the output log.

#![warn(clippy::pedantic)]

mod config;
mod modes;
mod output;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bobbin_core::host::{HostId, HostTable};
use bobbin_link::FairLossLink;

use crate::config::Milestone;
use crate::output::OutputLog;

/// Marker error for startup failures. Use `error_stack::Report<StartupError>`
/// with context attachments for details.
#[derive(Debug)]
struct StartupError;

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bobbin-node failed to start")
    }
}

impl std::error::Error for StartupError {}

/// Run one bobbin process
#[derive(Parser, Debug)]
#[command(name = "bobbin-node")]
#[command(about = "Reliable broadcast and lattice agreement over UDP")]
struct Args {
    /// Id of this process in the hosts file
    #[arg(long)]
    id: u16,

    /// Path to the hosts file (`<id> <ip-or-hostname> <port>` per line)
    #[arg(long)]
    hosts: PathBuf,

    /// Path to the output file
    #[arg(long)]
    output: PathBuf,

    /// Path to the milestone config file
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Report<StartupError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let pid = std::process::id();
    info!(pid, id = args.id, "starting");
    info!("stop with `kill -SIGINT {pid}` or `kill -SIGTERM {pid}`");

    let hosts = HostTable::load(&args.hosts)
        .change_context(StartupError)
        .attach_printable_lazy(|| format!("hosts file: {}", args.hosts.display()))?;
    for host in hosts.iter() {
        debug!(id = %host.id, addr = %host.addr, "resolved host");
    }

    let local = HostId(args.id);
    let local_addr = hosts
        .addr_of(local)
        .ok_or_else(|| Report::new(StartupError))
        .attach_printable_lazy(|| format!("id {} is not in the hosts file", args.id))?;

    let config_path = args
        .config
        .ok_or_else(|| Report::new(StartupError))
        .attach_printable("a milestone config file is required")?;
    let milestone = Milestone::load(&config_path)
        .change_context(StartupError)
        .attach_printable_lazy(|| format!("config file: {}", config_path.display()))?;
    debug!(?milestone, "milestone loaded");

    let output = Arc::new(
        OutputLog::create(&args.output)
            .change_context(StartupError)
            .attach_printable_lazy(|| format!("output file: {}", args.output.display()))?,
    );

    let link = FairLossLink::bind(local_addr)
        .await
        .change_context(StartupError)
        .attach_printable_lazy(|| format!("binding {local_addr}"))?;
    info!(addr = %local_addr, n = hosts.len(), majority = hosts.majority(), "endpoint bound");

    let cancel = CancellationToken::new();
    let driver = tokio::spawn(modes::run(
        milestone,
        link,
        local,
        hosts,
        Arc::clone(&output),
        cancel.clone(),
    ));

    wait_for_shutdown().await;
    info!("stopping packet processing");
    cancel.cancel();

    // Give the stack a moment to observe the cancellation, then flush
    // whatever made it into the log.
    if tokio::time::timeout(Duration::from_secs(2), driver)
        .await
        .is_err()
    {
        warn!("stack did not stop in time, flushing anyway");
    }
    info!("writing output");
    output
        .flush()
        .change_context(StartupError)
        .attach_printable("flushing output file")?;

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
