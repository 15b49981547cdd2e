//! `workerctl` — spawn one worker, optionally call a method on it, terminate it.
//!
//! Demonstrates the public API end to end: `ProcessManager::spawn`, a request
//! over the control channel, and `ProcessManager::terminate`.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use worker_ipc::cli::Args;
use worker_ipc::process::SpawnOptions;
use worker_ipc::{ProcessManager, WorkerId};

mod logging_init {
    pub use worker_ipc::logging::ColorizedFormatter;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let detailed_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_filter(log_level);

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(logging_init::ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    info!("starting workerctl");

    let worker_id = WorkerId::new(args.worker_id.clone())
        .map_err(|e| anyhow::anyhow!("invalid worker id: {e}"))?;

    let manager = Arc::new(ProcessManager::new(args.namespace.clone(), args.data_dir.clone()));

    let mut opts = SpawnOptions::new(args.program.clone());
    for arg in &args.program_args {
        opts = opts.arg(arg.clone());
    }
    if args.data_channel {
        opts = opts.with_data_channel();
    }
    if args.no_restart {
        let mut policy = opts.restart_policy.clone();
        policy.enabled = false;
        opts = opts.with_restart_policy(policy);
    }

    let handle = manager.spawn(worker_id.clone(), opts).await?;
    info!(worker = %worker_id, pid = handle.pid(), "worker spawned and handshaken");

    if let Some(method) = &args.call {
        let params = match &args.params {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        match handle.request(method, params, Some(args.timeout)).await {
            Ok(result) => info!(%method, %result, "call succeeded"),
            Err(e) => error!(%method, "call failed: {e}"),
        }
    }

    manager.terminate(&worker_id).await?;
    info!(worker = %worker_id, "worker terminated");

    Ok(())
}
