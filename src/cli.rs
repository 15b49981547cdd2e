//! Command-line argument parsing for the `workerctl` demo binary.
//!
//! `workerctl` is a thin demonstration of this crate's public API: spawn one
//! worker, optionally send it a request, then terminate it. It exists to give
//! reviewers and integration tests a runnable entry point, not as a product
//! surface in its own right.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Spawn and drive a single supervised worker process.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the worker program to spawn.
    pub program: PathBuf,

    /// Arguments passed to the worker program.
    #[arg(last = true)]
    pub program_args: Vec<String>,

    /// Identifier this worker is registered under.
    #[arg(short = 'n', long, default_value = "worker-1")]
    pub worker_id: String,

    /// Namespace prefixing the `<NS>_MODULE_NAME`/`<NS>_DATA_PATH` env vars.
    #[arg(long, default_value = "WORKERCTL")]
    pub namespace: String,

    /// Directory for generated data-channel socket files.
    #[arg(long, default_value = "/tmp")]
    pub data_dir: PathBuf,

    /// Enable the optional data channel (length-prefixed UDS) for this worker.
    #[arg(long)]
    pub data_channel: bool,

    /// Method to call once the worker's handshake completes.
    #[arg(long)]
    pub call: Option<String>,

    /// JSON params for `--call` (defaults to `null`).
    #[arg(long)]
    pub params: Option<String>,

    /// How long to wait for `--call`'s response before giving up.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub timeout: Duration,

    /// Disable restart-on-crash for this worker.
    #[arg(long)]
    pub no_restart: bool,

    /// Increase diagnostic log verbosity on stderr (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parses a human-readable duration like `"500ms"`, `"5s"`, `"2m"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        _ => return Err(format!("invalid duration unit: {unit}")),
    })
}
