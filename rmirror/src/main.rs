use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use common::events::{EventSink, TracingSink};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rmirror",
    version,
    about = "Keep a replica directory identical to a source directory",
    long_about = "`rmirror` periodically mirrors a source directory into a replica directory.

On every pass missing and outdated files are copied from the source, and files and directories
that no longer exist in the source are deleted from the replica. The source is never modified.
Every action is logged to the console and appended to the log file.

EXAMPLE:
    # Mirror once a minute until interrupted with Ctrl-C
    rmirror /data/source /backup/replica --interval 60 --log sync.log

    # Run a single pass and print a summary
    rmirror /data/source /backup/replica --once --summary

Note: Like `rsync --delete`, anything in the replica that is not in the source is removed."
)]
struct Args {
    // Synchronization options
    /// How empty directories of the source are mirrored
    ///
    /// `preserve` (default) keeps empty source directories as empty replica directories.
    /// `legacy` removes every empty replica directory except the replica root, so empty
    /// source directories never survive a pass.
    #[arg(
        long,
        value_enum,
        default_value_t = common::sync::EmptyDirPolicy::Preserve,
        value_name = "POLICY",
        help_heading = "Synchronization options"
    )]
    empty_dirs: common::sync::EmptyDirPolicy,

    /// Abort a pass on its first error
    ///
    /// By default a failure affecting one file or directory is logged and the pass goes on
    /// with the rest of the tree.
    #[arg(short = 'e', long = "fail-early", help_heading = "Synchronization options")]
    fail_early: bool,

    // Scheduling
    /// Time between the end of one pass and the start of the next
    ///
    /// A plain number is taken as seconds, otherwise a human readable duration is expected,
    /// e.g. "500ms", "30s", "5min".
    #[arg(
        long,
        default_value = "60",
        value_name = "DURATION",
        value_parser = parse_interval,
        help_heading = "Scheduling"
    )]
    interval: std::time::Duration,

    /// Run a single pass and exit
    #[arg(long, conflicts_with = "max_passes", help_heading = "Scheduling")]
    once: bool,

    /// Exit after this many passes instead of running until interrupted
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..),
        help_heading = "Scheduling"
    )]
    max_passes: Option<u64>,

    // Progress & output
    /// Log file, appended to on every run
    #[arg(
        long,
        default_value = "sync.log",
        value_name = "PATH",
        help_heading = "Progress & output"
    )]
    log: std::path::PathBuf,

    /// Verbose level (implies "summary"): -v DEBUG / -vv TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't log to the console (the log file is still written)
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance")]
    max_open_files: Option<usize>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Directory to mirror, only ever read
    #[arg()]
    source: std::path::PathBuf,

    /// Directory kept identical to the source, created if missing
    #[arg()]
    replica: std::path::PathBuf,
}

fn parse_interval(value: &str) -> Result<std::time::Duration, String> {
    let interval = match value.parse::<u64>() {
        Ok(seconds) => std::time::Duration::from_secs(seconds),
        Err(_) => humantime::parse_duration(value).map_err(|err| err.to_string())?,
    };
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

#[instrument]
async fn async_main(args: Args) -> Result<common::sync::Summary> {
    let token = CancellationToken::new();
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for Ctrl-C: {:#}", &error);
                return;
            }
            tracing::info!("interrupted, exiting after the current pass");
            token.cancel();
        })
    };
    let settings = common::sync::Settings {
        empty_dirs: args.empty_dirs,
        fail_early: args.fail_early,
        max_open_files: args.max_open_files,
    };
    let schedule = common::schedule::Schedule {
        interval: args.interval,
        max_passes: if args.once {
            Some(1)
        } else {
            args.max_passes
        },
    };
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let report = common::schedule::run_periodically(&schedule, &token, || {
        let source = args.source.clone();
        let replica = args.replica.clone();
        let sink = sink.clone();
        async move {
            let summary = common::sync(&source, &replica, &settings, sink).await?;
            if summary.errors > 0 {
                tracing::warn!("pass finished with {} error(s)", summary.errors);
            }
            Ok::<_, common::sync::Error>(summary)
        }
    })
    .await;
    ctrl_c.abort();
    if report.failed_passes > 0 || report.summary.errors > 0 {
        let message = format!(
            "rmirror encountered errors: {} of {} pass(es) failed, {} entry error(s)",
            report.failed_passes, report.passes, report.summary.errors
        );
        if args.summary {
            return Err(anyhow!("{}\n\n{}", message, &report.summary));
        }
        return Err(anyhow!("{}", message));
    }
    Ok(report.summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        log_file: Some(args.log.clone()),
    };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
