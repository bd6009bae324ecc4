//! Spool stdin to an object store
//!
//! Reads newline-delimited records on stdin (JSON objects, or plain text
//! wrapped as `{"message": line}`), spools them through rotating staging
//! files and uploads the finished files. Stops on EOF or Ctrl-C, uploading
//! whatever is still staged.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SPOOL_CONFIG | - | TOML config file (also accepted as first argument) |
//! | SPOOL_BATCH_SIZE | 256 | Records per delivered batch |
//! | SPOOL_FLUSH_MS | 1000 | Deliver a partial batch after this long |
//! | RUST_LOG | info | Log filter |
//! | SPOOL_LOG_FORMAT | text | `text` or `json` |
//! | AWS_ACCESS_KEY_ID | - | S3 credentials when not in the config |
//! | AWS_SECRET_ACCESS_KEY | - | S3 credentials when not in the config |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use bytes::Bytes;
use object_spool::observability::{init_tracing, LogConfig};
use object_spool::spool::{ConfigError, Event, OutputConfig, OutputError, SpoolOutput};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_BATCH_SIZE: usize = 256;
const DEFAULT_FLUSH_MS: u64 = 1000;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> Result<OutputConfig, ConfigError> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SPOOL_CONFIG").ok())
        .map(PathBuf::from);

    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            OutputConfig::from_file(&path)
        }
        None => {
            warn!("No configuration file given, using defaults");
            let config = OutputConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Hand the batch to the spool on a blocking thread
async fn deliver(output: &Arc<SpoolOutput>, batch: &mut Vec<(Event, Bytes)>) -> Result<(), OutputError> {
    if batch.is_empty() {
        return Ok(());
    }
    let records = std::mem::take(batch);
    let output = output.clone();
    match tokio::task::spawn_blocking(move || output.deliver(&records)).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Delivery task failed");
            Err(OutputError::Closed)
        }
    }
}

fn record(line: &str) -> (Event, Bytes) {
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    (Event::from_line(line), Bytes::from(encoded))
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing(&LogConfig::from_env()) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let output = match tokio::task::spawn_blocking(move || SpoolOutput::start(config)).await {
        Ok(Ok(output)) => Arc::new(output),
        Ok(Err(e)) => {
            error!(error = %e, "Failed to start spool");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "Startup task failed");
            return ExitCode::FAILURE;
        }
    };

    let batch_size = env_or("SPOOL_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1);
    let mut flush_tick =
        tokio::time::interval(Duration::from_millis(env_or("SPOOL_FLUSH_MS", DEFAULT_FLUSH_MS).max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch: Vec<(Event, Bytes)> = Vec::with_capacity(batch_size);
    let mut records: u64 = 0;
    let mut exit = ExitCode::SUCCESS;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let result = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    batch.push(record(&line));
                    records += 1;
                    if batch.len() >= batch_size {
                        deliver(&output, &mut batch).await
                    } else {
                        Ok(())
                    }
                }
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    exit = ExitCode::FAILURE;
                    break;
                }
            },
            _ = flush_tick.tick() => deliver(&output, &mut batch).await,
            _ = &mut shutdown => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        };

        if let Err(e) = result {
            error!(error = %e, disk_full = e.is_disk_full(), "Delivery failed, shutting down");
            exit = ExitCode::FAILURE;
            batch.clear();
            break;
        }
    }

    if let Err(e) = deliver(&output, &mut batch).await {
        error!(error = %e, "Final delivery failed");
        exit = ExitCode::FAILURE;
    }

    let stopping = output.clone();
    if tokio::task::spawn_blocking(move || stopping.stop()).await.is_err() {
        error!("Shutdown task failed");
        exit = ExitCode::FAILURE;
    }
    info!(records, stats = ?output.uploader_stats(), "Spool finished");
    exit
}
