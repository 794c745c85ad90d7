//! Configuration types for runtime and output settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Don't log to the console
    pub quiet: bool,
    /// Verbosity level: 0=INFO, 1=DEBUG, 2=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    #[must_use]
    pub fn level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Where log records go besides the console
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Log file, appended to and never truncated
    pub log_file: Option<std::path::PathBuf>,
}
