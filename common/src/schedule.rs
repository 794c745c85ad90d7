//! Periodic driver running synchronization passes one after another

use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Copy, Clone, Debug)]
pub struct Schedule {
    /// Pause between the end of one pass and the start of the next.
    pub interval: std::time::Duration,
    /// Stop after this many passes, run until cancelled when unset.
    pub max_passes: Option<u64>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_passes: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Report<T> {
    pub passes: u64,
    pub failed_passes: u64,
    /// Sum of the summaries of all passes that completed.
    pub summary: T,
}

/// Runs `pass` until `token` is cancelled or `schedule.max_passes` passes have run.
///
/// Passes never overlap. A failed pass is logged and the loop goes on with the next one.
/// Cancellation is observed before a pass starts and while waiting for the next interval, a
/// running pass is always allowed to finish.
#[instrument(skip(token, pass))]
pub async fn run_periodically<T, E, F, Fut>(
    schedule: &Schedule,
    token: &CancellationToken,
    mut pass: F,
) -> Report<T>
where
    T: std::ops::Add<Output = T> + Default,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut report = Report::<T>::default();
    loop {
        if token.is_cancelled() {
            tracing::info!("cancelled, no further passes");
            break;
        }
        tracing::info!("Starting synchronization");
        let result = pass().await;
        report.passes += 1;
        let last = schedule
            .max_passes
            .is_some_and(|max_passes| report.passes >= max_passes);
        match result {
            Ok(summary) => {
                report.summary = std::mem::take(&mut report.summary) + summary;
                if last {
                    tracing::info!("Synchronization complete.");
                } else {
                    tracing::info!("Synchronization complete. Waiting for next interval.");
                }
            }
            Err(error) => {
                tracing::error!("synchronization failed: {:#}", &error);
                report.failed_passes += 1;
                if !last {
                    tracing::info!("Waiting for next interval.");
                }
            }
        }
        if last {
            tracing::debug!("reached {} passes, stopping", report.passes);
            break;
        }
        tokio::select! {
            () = token.cancelled() => {
                tracing::info!("cancelled while waiting for the next pass");
                break;
            }
            () = tokio::time::sleep(schedule.interval) => {}
        }
    }
    report
}
