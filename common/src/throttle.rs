//! Bounds the number of files a pass keeps open at once

use tracing::instrument;

/// Used when the open files limit of the process cannot be read.
const FALLBACK_MAX_OPEN_FILES: usize = 256;

/// Number of open-file permits matching 80% of the soft `RLIMIT_NOFILE`.
///
/// A permit covers up to two descriptors (a source and a replica file during a copy), so the
/// budget is halved.
#[must_use]
pub fn default_max_open_files() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => {
            let soft = usize::try_from(soft).unwrap_or(usize::MAX);
            (soft / 5 * 4 / 2).max(1)
        }
        Err(error) => {
            tracing::warn!(
                "cannot read the open files limit: {}, using {}",
                error,
                FALLBACK_MAX_OPEN_FILES
            );
            FALLBACK_MAX_OPEN_FILES
        }
    }
}

#[derive(Debug)]
pub struct OpenFileLimit {
    sem: Option<tokio::sync::Semaphore>,
}

/// Holds one open-file permit until dropped.
#[derive(Debug)]
pub struct OpenFileGuard<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

impl OpenFileLimit {
    /// `0` disables the limit.
    #[must_use]
    pub fn new(max_open_files: usize) -> Self {
        let sem = (max_open_files > 0).then(|| {
            tokio::sync::Semaphore::new(max_open_files.min(tokio::sync::Semaphore::MAX_PERMITS))
        });
        Self { sem }
    }

    /// `None` means no limit.
    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.sem
            .as_ref()
            .map(tokio::sync::Semaphore::available_permits)
    }

    #[instrument(skip(self))]
    pub async fn permit(&self) -> OpenFileGuard<'_> {
        let permit = match &self.sem {
            // the semaphore is never closed
            Some(sem) => sem.acquire().await.ok(),
            None => None,
        };
        OpenFileGuard { _permit: permit }
    }
}
