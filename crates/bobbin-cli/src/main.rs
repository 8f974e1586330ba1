//! bobbin - run a worker against an in-process queue service.
//!
//! 例:
//! ```text
//! bobbin --tube jobs --ignore-default \
//!     --job '{"type":"reverse","payload":{"words":"success yo"}}' \
//!     --job '["stalker",{"type":"sleep","payload":{"millis":1500,"touch_every":500}}]'
//! ```
//!
//! Jobs are put on the first tube, the worker runs until every one of them is
//! settled (or until Ctrl-C), and the final status is printed as JSON.

mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bobbin_core::domain::{DEFAULT_TUBE, WorkerEvent};
use bobbin_core::impls::InMemoryServer;
use bobbin_core::ports::QueueClient;
use bobbin_core::{WorkerBuilder, WorkerConfig};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{Reverse, ReverseHandler, Sleep, SleepHandler};

const PUT_TTR: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "bobbin")]
#[command(about = "Job worker for tube-based work queues", long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker label used in logs
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Tube to watch (repeatable)
    #[arg(long = "tube")]
    tubes: Vec<String>,

    /// Reservation timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop watching the default tube
    #[arg(long)]
    ignore_default: bool,

    /// JSON job body to put before starting (repeatable)
    #[arg(long = "job")]
    jobs: Vec<String>,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    let Some(path) = path else {
        return Ok(WorkerConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

fn apply_overrides(mut config: WorkerConfig, args: &Args) -> WorkerConfig {
    if let Some(id) = &args.id {
        config.id = id.clone();
    }
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.tubes.is_empty() {
        config.tubes = args.tubes.clone();
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if args.ignore_default {
        config.ignore_default = true;
    }
    config
}

/// A job is done with once it reached a terminal event, or once the command
/// that would have settled it failed.
fn settles(event: &WorkerEvent) -> bool {
    match event {
        WorkerEvent::Warning(w) => {
            w.job_id.is_some() && matches!(w.operation, "delete" | "bury" | "release")
        }
        other => other.is_terminal(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = apply_overrides(load_config(args.config.as_deref())?, &args);
    let server = InMemoryServer::with_addr(config.target());

    let producer = server.client();
    producer.connect().await?;
    let tube = config.tubes.first().map_or(DEFAULT_TUBE, String::as_str);
    producer.use_tube(tube).await?;
    for body in &args.jobs {
        let id = producer
            .put(0, Duration::ZERO, PUT_TTR, body.clone().into_bytes())
            .await?;
        info!(job_id = %id, %tube, "job put");
    }

    let engine = WorkerBuilder::new(config)
        .register::<Reverse, _>(ReverseHandler)?
        .register::<Sleep, _>(SleepHandler)?
        .build(Arc::new(server.client()))?;

    engine.events().on(|event| match event {
        WorkerEvent::Warning(w) => warn!(%w, "warning"),
        WorkerEvent::Error { code, message } => warn!(%code, %message, "error"),
        other => info!(event = other.name(), job_id = ?other.job_id().map(|id| id.get()), "event"),
    });
    let mut events = engine.events().channel();

    info!(types = ?engine.registry().registered_types(), "registered job types");
    engine.start(&[]).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut remaining = args.jobs.len();
    while remaining > 0 || args.jobs.is_empty() {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Some(WorkerEvent::Stopped) | None => break,
                Some(event) if settles(&event) => remaining = remaining.saturating_sub(1),
                Some(_) => {}
            },
        }
    }

    engine.stop().await;
    producer.quit().await?;

    println!("{}", serde_json::to_string_pretty(&engine.status())?);
    Ok(())
}
