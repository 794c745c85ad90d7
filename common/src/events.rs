//! Observable output of a synchronization pass
//!
//! Every action taken on the replica, and every per-entry failure, is reported to an
//! [`EventSink`] handed to [`crate::sync::sync`]. The binary logs events through
//! [`TracingSink`]; tests record them with [`RecordingSink`].

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// a file could not be hashed
    ContentRead,
    /// create, copy, set-times or remove failed
    Mutation,
    /// a directory could not be listed or an entry could not be inspected
    Traversal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            FailureKind::ContentRead => "content read error",
            FailureKind::Mutation => "filesystem mutation error",
            FailureKind::Traversal => "traversal error",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    DirectoryCreated(std::path::PathBuf),
    FileCopied {
        path: std::path::PathBuf,
        /// an existing replica file with different content was overwritten
        updated: bool,
    },
    FileDeleted(std::path::PathBuf),
    DirectoryRemoved(std::path::PathBuf),
    Failed {
        kind: FailureKind,
        path: std::path::PathBuf,
        message: String,
    },
}

impl Event {
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Event::DirectoryCreated(path)
            | Event::FileCopied { path, .. }
            | Event::FileDeleted(path)
            | Event::DirectoryRemoved(path)
            | Event::Failed { path, .. } => path,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Event::DirectoryCreated(path) => write!(f, "Directory created: {}", path.display()),
            Event::FileCopied { path, .. } => {
                write!(f, "File copied or updated: {}", path.display())
            }
            Event::FileDeleted(path) => write!(f, "File deleted: {}", path.display()),
            Event::DirectoryRemoved(path) => write!(f, "Directory removed: {}", path.display()),
            Event::Failed { kind, message, .. } => write!(f, "{kind}: {message}"),
        }
    }
}

pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: Event);
}

/// Forwards events to the installed `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::Failed { .. } => tracing::error!("{}", &event),
            _ => tracing::info!("{}", &event),
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all events recorded so far and clears the buffer.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.lock())
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        tracing::debug!("recorded: {}", &event);
        self.lock().push(event);
    }
}
