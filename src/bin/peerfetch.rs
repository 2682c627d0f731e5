//! Fetch artifacts from the shared store, asking the peer for missing ones.
//!
//! Prints the batch result as JSON on stdout. Exits with status 1 when any
//! artifact was not delivered and 2 when the batch could not start.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use peerfetch::intake::{merge_names, read_name_list};
use peerfetch::{
    BatchPlan, FetchConfig, FsDelivery, Orchestrator, SessionEventKind, SharedStore,
    WebSocketNotifier,
};

#[derive(Parser, Debug)]
#[command(name = "peerfetch", version, about)]
struct Args {
    /// Shared store directory to look for artifacts in
    #[arg(long)]
    store: PathBuf,

    /// Existing directory to deliver artifacts into
    #[arg(long)]
    dest: PathBuf,

    /// Peer WebSocket endpoint (overrides the config file)
    #[arg(long)]
    peer: Option<String>,

    /// File with one artifact name per line
    #[arg(long)]
    list: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Artifact names
    names: Vec<String>,
}

impl Args {
    fn fetch_config(&self) -> anyhow::Result<FetchConfig> {
        let mut config = match &self.config {
            Some(path) => FetchConfig::from_json_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => FetchConfig::default(),
        };
        if let Some(peer) = &self.peer {
            config.peer_url = peer.clone();
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        config.validate()?;
        Ok(config)
    }

    fn names(&self) -> anyhow::Result<Vec<String>> {
        let listed = match &self.list {
            Some(path) => read_name_list(path)
                .with_context(|| format!("reading name list {}", path.display()))?,
            None => Vec::new(),
        };
        Ok(merge_names([self.names.clone(), listed]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.fetch_config()?;
    let names = args.names()?;

    let plan = match BatchPlan::from_names(&args.dest, &names) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!(error = %e, "Batch not started");
            return Ok(ExitCode::from(2));
        }
    };

    let store = SharedStore::new(&args.store);
    tracing::info!(
        store = %store.root().display(),
        peer = %config.peer_url,
        artifacts = plan.len(),
        "Fetching"
    );

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(WebSocketNotifier::new(config.peer_url.clone())),
        Arc::new(FsDelivery::new()),
        config,
        shutdown.clone(),
    );

    let mut handle = orchestrator.spawn_batch(plan)?;

    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event.kind {
                    SessionEventKind::Entered(state) => {
                        tracing::debug!(artifact = %event.artifact, state = %state, "Session state")
                    }
                    SessionEventKind::SignalFailed(error) => {
                        tracing::warn!(artifact = %event.artifact, error = %error, "Peer not reached")
                    }
                    SessionEventKind::Finished(outcome) => {
                        tracing::info!(artifact = %event.artifact, outcome = outcome.label(), "Done")
                    }
                    SessionEventKind::Cancelled => {
                        tracing::info!(artifact = %event.artifact, "Cancelled")
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling outstanding fetches");
            shutdown.cancel();
        }
    });

    let result = handle.wait().await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.is_fully_delivered() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
