//! One-way reconciliation of a replica tree with a source tree
//!
//! A pass runs in two phases:
//!
//! 1. **Propagate** walks the source top-down, creating missing replica directories and
//!    copying files that are missing from the replica or whose content differs.
//! 2. **Prune** walks the replica bottom-up, deleting files that no longer exist in the source
//!    and removing directories left empty. Which empty directories are eligible for removal is
//!    decided by [`EmptyDirPolicy`].
//!
//! Entries are correlated by their path relative to the tree roots. Failures affecting a
//! single entry are reported to the [`EventSink`] and counted in [`Summary::errors`]; the rest
//! of the pass goes on unless [`Settings::fail_early`] is set. Conditions that make the whole
//! pass meaningless (missing source, unusable replica root, nested roots) fail with [`Error`].

use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use tracing::instrument;

use crate::events::{Event, EventSink, FailureKind};
use crate::filecmp;
use crate::preserve;
use crate::rm;
use crate::throttle;

/// Error type for a pass that could not run to completion.
///
/// Preserves the summary of work done before the failure.
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

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    CreateDir,
    Copy,
    SetTimes,
    Remove,
    RemoveDir,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Operation::CreateDir => "create directory",
            Operation::Copy => "copy",
            Operation::SetTimes => "set timestamps",
            Operation::Remove => "remove",
            Operation::RemoveDir => "remove directory",
        };
        write!(f, "{name}")
    }
}

/// Failure confined to a single entry of the pass.
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("cannot compare content of {path:?}: {source:#}")]
    ContentRead {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("{op} failed for {path:?}: {source:#}")]
    Mutation {
        op: Operation,
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("cannot traverse {path:?}: {source:#}")]
    Traversal {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl EntryError {
    fn mutation(op: Operation, path: &std::path::Path, source: impl Into<anyhow::Error>) -> Self {
        EntryError::Mutation {
            op,
            path: path.to_owned(),
            source: source.into(),
        }
    }

    fn traversal(path: &std::path::Path, source: impl Into<anyhow::Error>) -> Self {
        EntryError::Traversal {
            path: path.to_owned(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            EntryError::ContentRead { .. } => FailureKind::ContentRead,
            EntryError::Mutation { .. } => FailureKind::Mutation,
            EntryError::Traversal { .. } => FailureKind::Traversal,
        }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            EntryError::ContentRead { path, .. }
            | EntryError::Mutation { path, .. }
            | EntryError::Traversal { path, .. } => path,
        }
    }
}

impl From<&EntryError> for Event {
    fn from(error: &EntryError) -> Self {
        Event::Failed {
            kind: error.kind(),
            path: error.path().to_owned(),
            message: error.to_string(),
        }
    }
}

/// Which replica directories the prune phase may remove once they are empty.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EmptyDirPolicy {
    /// Only directories without a counterpart directory in the source; empty source
    /// directories are mirrored as empty directories.
    #[default]
    Preserve,
    /// Every empty directory except the replica root, regardless of the source. An empty
    /// source directory is created and removed again within the same pass.
    Legacy,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Settings {
    pub empty_dirs: EmptyDirPolicy,
    /// Abort the pass on the first per-entry failure instead of carrying on.
    pub fail_early: bool,
    /// Files (or file pairs during a copy) open at once, 0 means no limit. When unset a share
    /// of the process open files limit is used, see [`throttle::default_max_open_files`].
    pub max_open_files: Option<usize>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
    pub entries_skipped: usize,
    pub errors: usize,
    pub rm_summary: rm::Summary,
}

impl Summary {
    /// True when the pass changed nothing in the replica.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.files_copied == 0
            && self.files_updated == 0
            && self.directories_created == 0
            && self.rm_summary == rm::Summary::default()
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_updated: self.files_updated + other.files_updated,
            files_unchanged: self.files_unchanged + other.files_unchanged,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            entries_skipped: self.entries_skipped + other.entries_skipped,
            errors: self.errors + other.errors,
            rm_summary: self.rm_summary + other.rm_summary,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files updated: {}\n\
            files unchanged: {}\n\
            directories created: {}\n\
            directories unchanged: {}\n\
            entries skipped: {}\n\
            {}\
            errors: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_updated,
            self.files_unchanged,
            self.directories_created,
            self.directories_unchanged,
            self.entries_skipped,
            &self.rm_summary,
            self.errors,
        )
    }
}

/// State shared by every task of one pass.
#[derive(Debug)]
struct Pass {
    settings: Settings,
    sink: Arc<dyn EventSink>,
    open_files: throttle::OpenFileLimit,
}

impl Pass {
    /// Reports a per-entry failure. Returns the error to propagate when the pass must stop.
    fn fail(&self, error: EntryError, summary: &mut Summary) -> Result<(), Error> {
        self.sink.emit(Event::from(&error));
        summary.errors += 1;
        if self.settings.fail_early {
            return Err(Error::new(error.into(), *summary));
        }
        Ok(())
    }

    /// Merges results of child tasks, stopping at the first error in fail-early mode.
    async fn join(
        &self,
        mut join_set: tokio::task::JoinSet<Result<Summary, Error>>,
        summary: &mut Summary,
    ) -> Result<(), Error> {
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(child_summary)) => *summary = *summary + child_summary,
                Ok(Err(error)) => {
                    *summary = *summary + error.summary;
                    return Err(Error::new(error.source, *summary));
                }
                Err(error) => {
                    return Err(Error::new(
                        anyhow::Error::from(error).context("sync task failed"),
                        *summary,
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Resolves `path` through its nearest existing ancestor so that paths which do not exist yet
/// can be compared with canonical ones.
async fn resolve(path: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    let mut existing = path.to_owned();
    let mut missing = vec![];
    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(canonical) => {
                return Ok(missing
                    .into_iter()
                    .rev()
                    .fold(canonical, |resolved, name: std::ffi::OsString| {
                        resolved.join(name)
                    }));
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let name = existing
                    .file_name()
                    .with_context(|| format!("cannot resolve path {path:?}"))?
                    .to_owned();
                missing.push(name);
                existing.pop();
                if existing.as_os_str().is_empty() {
                    existing = std::path::PathBuf::from(".");
                }
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot resolve path {path:?}"));
            }
        }
    }
}

#[instrument]
async fn check_roots(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<()> {
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("source {src:?} is not accessible"))?;
    if !src_metadata.is_dir() {
        return Err(anyhow!("source {:?} is not a directory", src));
    }
    let src_resolved = resolve(src).await?;
    let dst_resolved = resolve(dst).await?;
    if src_resolved == dst_resolved {
        return Err(anyhow!(
            "source {:?} and replica {:?} are the same directory",
            src,
            dst
        ));
    }
    if dst_resolved.starts_with(&src_resolved) {
        return Err(anyhow!(
            "replica {:?} must not be located inside source {:?}",
            dst,
            src
        ));
    }
    if src_resolved.starts_with(&dst_resolved) {
        return Err(anyhow!(
            "source {:?} must not be located inside replica {:?}",
            src,
            dst
        ));
    }
    Ok(())
}

#[instrument(skip(pass))]
async fn ensure_replica_root(pass: &Pass, dst: &std::path::Path) -> anyhow::Result<Summary> {
    match tokio::fs::metadata(dst).await {
        Ok(metadata) if metadata.is_dir() => Ok(Summary {
            directories_unchanged: 1,
            ..Default::default()
        }),
        Ok(_) => Err(anyhow!("replica {:?} exists and is not a directory", dst)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dst)
                .await
                .with_context(|| format!("cannot create replica directory {dst:?}"))?;
            pass.sink.emit(Event::DirectoryCreated(dst.to_owned()));
            Ok(Summary {
                directories_created: 1,
                ..Default::default()
            })
        }
        Err(error) => Err(error).with_context(|| format!("replica {dst:?} is not accessible")),
    }
}

/// Brings the tree at `dst` into correspondence with the tree at `src`.
///
/// The source is only ever read. The replica root itself is created when missing and is never
/// removed.
#[instrument(skip(sink))]
pub async fn sync(
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
    sink: Arc<dyn EventSink>,
) -> Result<Summary, Error> {
    check_roots(src, dst)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    let max_open_files = settings
        .max_open_files
        .unwrap_or_else(throttle::default_max_open_files);
    tracing::debug!("open files limit: {}", max_open_files);
    let pass = Arc::new(Pass {
        settings: *settings,
        sink,
        open_files: throttle::OpenFileLimit::new(max_open_files),
    });
    let mut summary = ensure_replica_root(&pass, dst)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    tracing::debug!("propagate source entries into the replica");
    let propagated = propagate(&pass, src, dst)
        .await
        .map_err(|err| Error::new(err.source, summary + err.summary))?;
    summary = summary + propagated;
    tracing::debug!("prune replica entries missing from the source");
    let pruned = prune(&pass, src, dst, true)
        .await
        .map_err(|err| Error::new(err.source, summary + err.summary))?;
    summary = summary + pruned;
    Ok(summary)
}

/// Makes sure `dst` is a directory, replacing a non-directory entry if needed.
#[instrument(skip(pass))]
async fn ensure_dir(pass: &Pass, dst: &std::path::Path) -> Result<Summary, EntryError> {
    let mut summary = Summary::default();
    match tokio::fs::symlink_metadata(dst).await {
        Ok(metadata) if metadata.is_dir() => {
            tracing::debug!("'dst' is a directory, leaving it as is");
            summary.directories_unchanged += 1;
            return Ok(summary);
        }
        Ok(_) => {
            tracing::info!("'dst' is not a directory, removing and creating a new one");
            summary.rm_summary = rm::rm(&pass.sink, dst)
                .await
                .map_err(|err| EntryError::mutation(Operation::Remove, dst, err))?;
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(EntryError::traversal(dst, error)),
    }
    tokio::fs::create_dir_all(dst)
        .await
        .map_err(|err| EntryError::mutation(Operation::CreateDir, dst, err))?;
    pass.sink.emit(Event::DirectoryCreated(dst.to_owned()));
    summary.directories_created += 1;
    Ok(summary)
}

/// Copies `src` over `dst` unless `dst` already holds identical content.
#[instrument(skip(pass))]
async fn sync_file(
    pass: &Pass,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<Summary, EntryError> {
    let mut summary = Summary::default();
    let updated = match tokio::fs::symlink_metadata(dst).await {
        Ok(metadata) if metadata.is_file() => {
            let equal = {
                let _open_file_guard = pass.open_files.permit().await;
                filecmp::content_equal(src, dst).await.map_err(|err| {
                    EntryError::ContentRead {
                        path: err.path.clone(),
                        source: err.into(),
                    }
                })?
            };
            if equal {
                tracing::debug!("file is identical, skipping");
                summary.files_unchanged += 1;
                return Ok(summary);
            }
            tracing::debug!("file is different, overwriting");
            true
        }
        Ok(_) => {
            // copying onto a symlink would write through it, outside of the replica
            tracing::info!("'dst' is not a regular file, removing it");
            summary.rm_summary = rm::rm(&pass.sink, dst)
                .await
                .map_err(|err| EntryError::mutation(Operation::Remove, dst, err))?;
            false
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
        Err(error) => return Err(EntryError::traversal(dst, error)),
    };
    let bytes = {
        let _open_file_guard = pass.open_files.permit().await;
        tokio::fs::copy(src, dst)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", &src, &dst))
            .map_err(|err| EntryError::mutation(Operation::Copy, dst, err))?
    };
    let src_metadata = tokio::fs::metadata(src)
        .await
        .map_err(|err| EntryError::traversal(src, err))?;
    preserve::set_file_times(&src_metadata, dst)
        .await
        .map_err(|err| EntryError::mutation(Operation::SetTimes, dst, err))?;
    // the file counts as copied only once its timestamps are set as well
    pass.sink.emit(Event::FileCopied {
        path: dst.to_owned(),
        updated,
    });
    summary.bytes_copied += bytes;
    if updated {
        summary.files_updated += 1;
    } else {
        summary.files_copied += 1;
    }
    Ok(summary)
}

async fn propagate_dir(
    pass: Arc<Pass>,
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    match ensure_dir(&pass, &dst).await {
        Ok(dir_summary) => summary = summary + dir_summary,
        Err(error) => {
            // nothing below this directory can be mirrored
            pass.fail(error, &mut summary)?;
            return Ok(summary);
        }
    }
    let children = propagate(&pass, &src, &dst)
        .await
        .map_err(|err| Error::new(err.source, summary + err.summary))?;
    Ok(summary + children)
}

async fn propagate_file(
    pass: Arc<Pass>,
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    match sync_file(&pass, &src, &dst).await {
        Ok(file_summary) => summary = summary + file_summary,
        Err(error) => pass.fail(error, &mut summary)?,
    }
    Ok(summary)
}

/// Phase 1: mirrors the contents of source directory `src` into the existing replica
/// directory `dst`.
#[instrument(skip(pass))]
#[async_recursion]
async fn propagate(
    pass: &Arc<Pass>,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    let open_file_guard = pass.open_files.permit().await;
    let mut entries = match tokio::fs::read_dir(src).await {
        Ok(entries) => entries,
        Err(error) => {
            pass.fail(EntryError::traversal(src, error), &mut summary)?;
            return Ok(summary);
        }
    };
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                pass.fail(EntryError::traversal(src, error), &mut summary)?;
                break;
            }
        };
        let entry_path = entry.path();
        let entry_name = entry.file_name();
        let dst_path = dst.join(&entry_name);
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(error) => {
                pass.fail(EntryError::traversal(&entry_path, error), &mut summary)?;
                continue;
            }
        };
        if file_type.is_dir() {
            join_set.spawn(propagate_dir(pass.clone(), entry_path, dst_path));
        } else if file_type.is_file() {
            join_set.spawn(propagate_file(pass.clone(), entry_path, dst_path));
        } else {
            tracing::debug!("skipping {:?}: {:?}", &entry_path, file_type);
            summary.entries_skipped += 1;
        }
    }
    // ReadDir holds a file descriptor, release it before waiting on the children
    drop(entries);
    drop(open_file_guard);
    pass.join(join_set, &mut summary).await?;
    Ok(summary)
}

/// Whether the source still has a non-directory entry at `src`.
async fn source_has_file(src: &std::path::Path) -> Result<bool, std::io::Error> {
    match tokio::fs::symlink_metadata(src).await {
        Ok(metadata) => Ok(!metadata.is_dir()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

async fn source_has_dir(src: &std::path::Path) -> Result<bool, std::io::Error> {
    match tokio::fs::symlink_metadata(src).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

async fn is_empty_dir(path: &std::path::Path) -> Result<bool, std::io::Error> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

/// Phase 2: removes everything below replica directory `dst` that has no counterpart under
/// source directory `src`, children first, then `dst` itself if it ended up empty.
#[instrument(skip(pass))]
#[async_recursion]
async fn prune(
    pass: &Arc<Pass>,
    src: &std::path::Path,
    dst: &std::path::Path,
    is_root: bool,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    let open_file_guard = pass.open_files.permit().await;
    let mut entries = match tokio::fs::read_dir(dst).await {
        Ok(entries) => entries,
        Err(error) => {
            pass.fail(EntryError::traversal(dst, error), &mut summary)?;
            return Ok(summary);
        }
    };
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                pass.fail(EntryError::traversal(dst, error), &mut summary)?;
                break;
            }
        };
        let entry_path = entry.path();
        let src_path = src.join(entry.file_name());
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(error) => {
                pass.fail(EntryError::traversal(&entry_path, error), &mut summary)?;
                continue;
            }
        };
        if file_type.is_dir() {
            let pass = pass.clone();
            let do_prune = || async move { prune(&pass, &src_path, &entry_path, false).await };
            join_set.spawn(do_prune());
            continue;
        }
        match source_has_file(&src_path).await {
            Ok(true) => {}
            Ok(false) => match tokio::fs::remove_file(&entry_path).await {
                Ok(()) => {
                    pass.sink.emit(Event::FileDeleted(entry_path));
                    summary.rm_summary.files_removed += 1;
                }
                Err(error) => pass.fail(
                    EntryError::mutation(Operation::Remove, &entry_path, error),
                    &mut summary,
                )?,
            },
            // keep the replica entry when the source cannot be inspected
            Err(error) => pass.fail(EntryError::traversal(&src_path, error), &mut summary)?,
        }
    }
    drop(entries);
    drop(open_file_guard);
    pass.join(join_set, &mut summary).await?;
    if is_root {
        return Ok(summary);
    }
    if pass.settings.empty_dirs == EmptyDirPolicy::Preserve {
        match source_has_dir(src).await {
            Ok(false) => {}
            Ok(true) => return Ok(summary),
            Err(error) => {
                pass.fail(EntryError::traversal(src, error), &mut summary)?;
                return Ok(summary);
            }
        }
    }
    let is_empty = {
        let _open_file_guard = pass.open_files.permit().await;
        is_empty_dir(dst).await
    };
    match is_empty {
        Ok(true) => {}
        Ok(false) => return Ok(summary),
        Err(error) => {
            pass.fail(EntryError::traversal(dst, error), &mut summary)?;
            return Ok(summary);
        }
    }
    match tokio::fs::remove_dir(dst).await {
        Ok(()) => {
            pass.sink.emit(Event::DirectoryRemoved(dst.to_owned()));
            summary.rm_summary.directories_removed += 1;
        }
        Err(error) => pass.fail(
            EntryError::mutation(Operation::RemoveDir, dst, error),
            &mut summary,
        )?,
    }
    Ok(summary)
}
