//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::scanner::DirectoryRule;

/// Whether watchers stop after the initial lines or keep following the file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Mode {
    Snapshot,
    #[default]
    Follow,
}

/// Something to tail: a single file, or every file a directory rule matches.
#[derive(Clone, Debug)]
pub enum Source {
    File(PathBuf),
    Directory(DirectoryRule),
}

/// Settings for a [`Tailor`](crate::Tailor) or a snapshot run.
#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Number of trailing lines emitted for each file before following it.
    pub line_count: usize,
    /// Delay between two polls of a followed file, and between directory rescans.
    pub poll_interval: Duration,
    pub mode: Mode,
    /// Sources registered when the tailor starts. More can be added later.
    pub sources: Vec<Source>,
    /// Capacity of the line channel. Watchers wait when it is full.
    pub channel_capacity: usize,
    /// Consecutive failed polls tolerated before a watcher gives up.
    pub retry_budget: u32,
    /// How long a deleted file may stay missing before its watcher closes.
    pub deletion_grace: Duration,
    /// Upper bound on waiting for watchers to acknowledge cancellation.
    pub shutdown_grace: Duration,
    /// Concurrent reads performed by the snapshot aggregator.
    pub snapshot_workers: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig {
            line_count: 10,
            poll_interval: Duration::from_secs(1),
            mode: Mode::Follow,
            sources: Vec::new(),
            channel_capacity: 1024,
            retry_budget: 3,
            deletion_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
            snapshot_workers: 8,
        }
    }
}

impl TailConfig {
    /// Sets [`line_count`](Self::line_count).
    pub fn with_line_count(mut self, n: usize) -> Self {
        self.line_count = n;
        self
    }

    /// Sets [`poll_interval`](Self::poll_interval).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets [`mode`](Self::mode).
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Adds a file to [`sources`](Self::sources).
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::File(path.into()));
        self
    }

    /// Adds a directory rule to [`sources`](Self::sources).
    pub fn with_directory(mut self, rule: DirectoryRule) -> Self {
        self.sources.push(Source::Directory(rule));
        self
    }

    /// Checks the settings that would otherwise stall or spin the engine.
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be non-zero".into()));
        }
        if self.retry_budget == 0 {
            return Err(Error::Config("retry_budget must be non-zero".into()));
        }
        if self.snapshot_workers == 0 {
            return Err(Error::Config("snapshot_workers must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.sources.iter().filter_map(|source| match source {
            Source::File(path) => Some(path),
            Source::Directory(_) => None,
        })
    }
}
