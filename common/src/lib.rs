//! Building blocks of `rmirror`, a one-way periodic directory mirror
//!
//! - [`mod@sync`]: one reconciliation pass bringing a replica tree in line with a source tree
//! - [`filecmp`]: content comparison of two files through streamed SHA-256 digests
//! - [`schedule`]: the periodic driver running passes at a fixed interval
//! - [`events`]: what a pass did, reported through an [`events::EventSink`]
//! - [`run`]: runtime and logging setup shared by the binaries

use anyhow::Context;
use tracing_subscriber::prelude::*;

pub mod config;
pub mod events;
pub mod filecmp;
pub mod preserve;
pub mod rm;
pub mod schedule;
pub mod sync;
pub mod throttle;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, TracingConfig};
pub use rm::rm;
pub use sync::sync;

fn env_filter(default: &str) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default))
        .with_context(|| format!("invalid log filter {default:?}"))
}

/// Installs the process-wide subscriber: a console layer on stderr unless `quiet` and a plain
/// text layer appending to the configured log file.
fn init_tracing(output: &OutputConfig, tracing: &TracingConfig) -> anyhow::Result<()> {
    let level = output.level();
    let console_layer = if output.quiet {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(env_filter(level)?),
        )
    };
    let file_layer = match &tracing.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path:?}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(env_filter(level)?),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install the tracing subscriber")?;
    Ok(())
}

/// Sets up logging and a tokio runtime, then drives `func` to completion on it.
///
/// Returns `None` if setup failed or `func` returned an error, which is logged. The summary
/// is printed to stdout when requested or when running verbose.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_tracing(&output, &tracing) {
        eprintln!("{error:#}");
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {:#}", &error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.verbose > 0 || output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}
