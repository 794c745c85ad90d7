use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use tracing::instrument;

use crate::events::{Event, EventSink};

/// Error type for remove operations that preserves the summary of what was removed before the
/// failure.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub files_removed: usize,
    pub directories_removed: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_removed: self.files_removed + other.files_removed,
            directories_removed: self.directories_removed + other.directories_removed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files removed: {}\n\
            directories removed: {}\n",
            self.files_removed, self.directories_removed
        )
    }
}

/// Removes the replica entry at `path` together with everything below it.
///
/// Anything that is not a directory (including a symlink to one) is removed as a single file.
/// Every removed entry is reported to `sink`.
#[instrument(skip(sink))]
#[async_recursion]
pub async fn rm(sink: &Arc<dyn EventSink>, path: &std::path::Path) -> Result<Summary, Error> {
    tracing::debug!("reading metadata");
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &path))
        .map_err(|err| Error::new(err, Default::default()))?;
    if !metadata.is_dir() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", &path))
            .map_err(|err| Error::new(err, Default::default()))?;
        sink.emit(Event::FileDeleted(path.to_owned()));
        return Ok(Summary {
            files_removed: 1,
            ..Default::default()
        });
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &path))
        .map_err(|err| Error::new(err, Default::default()))?;
    let mut join_set = tokio::task::JoinSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))
        .map_err(|err| Error::new(err, Default::default()))?
    {
        let entry_path = entry.path();
        let sink = sink.clone();
        let do_rm = || async move { rm(&sink, &entry_path).await };
        join_set.spawn(do_rm());
    }
    drop(entries);
    let mut rm_summary = Summary::default();
    let mut success = true;
    while let Some(res) = join_set.join_next().await {
        match res.map_err(|err| Error::new(err.into(), rm_summary))? {
            Ok(summary) => rm_summary = rm_summary + summary,
            Err(error) => {
                tracing::error!("remove: {:?} failed with: {:#}", path, &error);
                rm_summary = rm_summary + error.summary;
                success = false;
            }
        }
    }
    if !success {
        return Err(Error::new(
            anyhow!("remove: {:?} failed!", &path),
            rm_summary,
        ));
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", &path))
        .map_err(|err| Error::new(err, rm_summary))?;
    sink.emit(Event::DirectoryRemoved(path.to_owned()));
    rm_summary.directories_removed += 1;
    Ok(rm_summary)
}
