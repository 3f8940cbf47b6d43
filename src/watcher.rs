//! Per-file polling state machine.
//!
//! A [`FileWatcher`] owns the read position of one file. It seeds its output
//! with the tail of the file, then polls on a fixed interval and emits lines
//! as they are appended, starting over from the top whenever the file shrinks
//! or is replaced (`tail -F`).

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::metadata;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::{read_last_lines, read_new_lines, Partial};
use crate::config::{Mode, TailConfig};
use crate::error::{Error, ErrorEvent};
use crate::tailor::FileLine;

/// Identity of the file behind a path, used to notice replacement.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    /// Returns `None` on platforms without a stable device/inode pair, in
    /// which case only a shrinking size reveals a rotation.
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;

        Some(FileId {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

/// Where a watcher starts reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Seed {
    /// Emit the last `n` lines, then follow from there.
    LastLines(usize),
    /// Emit the whole file. Used for files created after the watch began.
    Beginning,
}

/// Phases of a file watcher. Every watcher ends in `Closed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatcherState {
    /// Registered, nothing read yet.
    Init,
    /// Reading the seed lines.
    Priming,
    /// Sleeping until the next poll.
    Idle,
    /// Polling for appended lines.
    Reading,
    /// The file shrank or was replaced; read it again from the top.
    Rotated,
    Closed,
}

/// Read position and polling parameters of a single file.
#[derive(Clone, Debug)]
pub struct WatchState {
    pub path: PathBuf,
    /// Bytes already consumed; always at a line boundary while following.
    pub offset: u64,
    pub size: u64,
    pub identity: Option<FileId>,
    pub poll_interval: Duration,
    pub mode: Mode,
}

/// Where a watcher delivers what it reads.
#[derive(Clone, Debug)]
pub(crate) struct Sinks {
    pub lines: mpsc::Sender<FileLine>,
    pub errors: mpsc::UnboundedSender<ErrorEvent>,
}

pub(crate) struct FileWatcher {
    state: WatchState,
    phase: WatcherState,
    seed: Seed,
    primed: bool,
    retry_budget: u32,
    deletion_grace: Duration,
    failures: u32,
    missing_since: Option<Instant>,
    sinks: Sinks,
    cancel: CancellationToken,
}

impl FileWatcher {
    pub fn new(
        path: PathBuf,
        seed: Seed,
        config: &TailConfig,
        sinks: Sinks,
        cancel: CancellationToken,
    ) -> Self {
        FileWatcher {
            state: WatchState {
                path,
                offset: 0,
                size: 0,
                identity: None,
                poll_interval: config.poll_interval,
                mode: config.mode,
            },
            phase: WatcherState::Init,
            seed,
            primed: false,
            retry_budget: config.retry_budget,
            deletion_grace: config.deletion_grace,
            failures: 0,
            missing_since: None,
            sinks,
            cancel,
        }
    }

    fn path(&self) -> &Path {
        &self.state.path
    }

    /// Drives the state machine until it reaches `Closed`.
    pub async fn run(mut self) -> WatchState {
        debug!(path = %self.path().display(), seed = ?self.seed, "watcher started");

        while self.phase != WatcherState::Closed {
            let next = if self.cancel.is_cancelled() {
                WatcherState::Closed
            } else {
                match self.phase {
                    WatcherState::Init => WatcherState::Priming,
                    WatcherState::Priming => self.prime().await,
                    WatcherState::Idle => self.idle().await,
                    WatcherState::Reading => self.poll().await,
                    WatcherState::Rotated => self.rotate().await,
                    WatcherState::Closed => unreachable!(),
                }
            };
            trace!(
                path = %self.path().display(),
                from = ?self.phase,
                to = ?next,
                offset = self.state.offset,
                "transition"
            );
            self.phase = next;
        }

        debug!(path = %self.path().display(), offset = self.state.offset, "watcher stopped");
        self.state
    }

    async fn prime(&mut self) -> WatcherState {
        let path = self.state.path.clone();

        let meta = match metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => return self.priming_failed(Error::from_io(&path, e)),
        };

        let partial = match self.state.mode {
            Mode::Snapshot => Partial::Include,
            Mode::Follow => Partial::Hold,
        };
        let res = match (self.seed, self.state.mode) {
            (Seed::LastLines(n), _) => read_last_lines(&path, n, partial).await,
            (Seed::Beginning, Mode::Snapshot) => read_last_lines(&path, usize::MAX, partial).await,
            (Seed::Beginning, Mode::Follow) => read_new_lines(&path, 0).await,
        };
        let chunk = match res {
            Ok(chunk) => chunk,
            Err(e) => return self.priming_failed(e),
        };

        self.primed = true;
        self.failures = 0;
        self.state.identity = FileId::of(&meta);
        self.state.offset = chunk.offset;
        self.state.size = meta.len().max(chunk.offset);

        if !self.emit(chunk.lines).await {
            return WatcherState::Closed;
        }

        match self.state.mode {
            Mode::Snapshot => WatcherState::Closed,
            Mode::Follow => WatcherState::Idle,
        }
    }

    fn priming_failed(&mut self, error: Error) -> WatcherState {
        if error.is_not_found() {
            // A path that does not exist at registration is not retried.
            self.report(error, true);
            return WatcherState::Closed;
        }
        self.fail(error)
    }

    async fn idle(&mut self) -> WatcherState {
        tokio::select! {
            _ = self.cancel.cancelled() => WatcherState::Closed,
            _ = tokio::time::sleep(self.state.poll_interval) => {
                if self.primed {
                    WatcherState::Reading
                } else {
                    WatcherState::Priming
                }
            }
        }
    }

    async fn poll(&mut self) -> WatcherState {
        let path = self.state.path.clone();

        let meta = match metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                let error = Error::from_io(&path, e);
                return if error.is_not_found() {
                    self.missing(error)
                } else {
                    self.fail(error)
                };
            }
        };

        let reappeared = self.missing_since.take().is_some();
        if reappeared {
            // Inode numbers get reused, so a recreated file is always new.
            debug!(path = %path.display(), "file reappeared");
        }

        let identity = FileId::of(&meta);
        let replaced = identity.is_some()
            && self.state.identity.is_some()
            && identity != self.state.identity;
        if reappeared || replaced || meta.len() < self.state.offset {
            return WatcherState::Rotated;
        }

        self.state.size = meta.len();
        if meta.len() == self.state.offset {
            self.failures = 0;
            return WatcherState::Idle;
        }

        match read_new_lines(&path, self.state.offset).await {
            Ok(chunk) => {
                self.failures = 0;
                self.state.offset = chunk.offset;
                self.state.size = self.state.size.max(chunk.offset);
                if !self.emit(chunk.lines).await {
                    return WatcherState::Closed;
                }
                WatcherState::Idle
            }
            // Gone between stat and open, the next tick sees the deletion.
            Err(e) if e.is_not_found() => WatcherState::Idle,
            Err(e) => self.fail(e),
        }
    }

    async fn rotate(&mut self) -> WatcherState {
        let path = self.state.path.clone();

        let meta = match metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return WatcherState::Idle,
            Err(e) => return self.fail(Error::from_io(&path, e)),
        };

        debug!(
            path = %path.display(),
            old_offset = self.state.offset,
            size = meta.len(),
            "file rotated"
        );
        self.state.offset = 0;
        self.state.identity = FileId::of(&meta);
        self.state.size = meta.len();

        match read_new_lines(&path, 0).await {
            Ok(chunk) => {
                self.failures = 0;
                self.state.offset = chunk.offset;
                self.state.size = self.state.size.max(chunk.offset);
                if !self.emit(chunk.lines).await {
                    return WatcherState::Closed;
                }
                WatcherState::Idle
            }
            Err(e) if e.is_not_found() => WatcherState::Idle,
            Err(e) => self.fail(e),
        }
    }

    /// The file is gone; wait for a replacement until the grace period ends.
    fn missing(&mut self, error: Error) -> WatcherState {
        let since = match self.missing_since {
            Some(since) => since,
            None => {
                self.report(error, false);
                let now = Instant::now();
                self.missing_since = Some(now);
                return WatcherState::Idle;
            }
        };

        if since.elapsed() >= self.deletion_grace {
            self.report(Error::NotFound(self.state.path.clone()), true);
            WatcherState::Closed
        } else {
            WatcherState::Idle
        }
    }

    fn fail(&mut self, error: Error) -> WatcherState {
        self.failures += 1;
        if self.failures >= self.retry_budget {
            self.report(error, true);
            WatcherState::Closed
        } else {
            self.report(error, false);
            WatcherState::Idle
        }
    }

    fn report(&self, error: Error, fatal: bool) {
        warn!(path = %self.path().display(), fatal, "{}", error);
        let _ = self.sinks.errors.send(ErrorEvent {
            origin: self.state.path.clone(),
            error,
            fatal,
        });
    }

    /// Returns `false` if the watcher should stop instead of continuing.
    async fn emit(&self, lines: Vec<String>) -> bool {
        for text in lines {
            let line = FileLine {
                origin: self.state.path.clone(),
                text,
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                res = self.sinks.lines.send(line) => {
                    if res.is_err() {
                        // Nobody is reading anymore.
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        lines: mpsc::Receiver<FileLine>,
        errors: mpsc::UnboundedReceiver<ErrorEvent>,
        cancel: CancellationToken,
        handle: JoinHandle<WatchState>,
    }

    fn spawn(path: &Path, seed: Seed, config: TailConfig) -> Harness {
        let (lines_tx, lines) = mpsc::channel(16);
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sinks = Sinks {
            lines: lines_tx,
            errors: errors_tx,
        };
        let watcher = FileWatcher::new(path.to_path_buf(), seed, &config, sinks, cancel.clone());

        Harness {
            lines,
            errors,
            cancel,
            handle: tokio::spawn(watcher.run()),
        }
    }

    fn follow() -> TailConfig {
        TailConfig::default().with_poll_interval(Duration::from_millis(20))
    }

    async fn next_text(rx: &mut mpsc::Receiver<FileLine>) -> String {
        timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap().text
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_closes_after_priming() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "x\ny\nz").unwrap();

        let config = follow().with_mode(Mode::Snapshot);
        let mut h = spawn(&path, Seed::LastLines(10), config);

        assert_eq!(next_text(&mut h.lines).await, "x");
        assert_eq!(next_text(&mut h.lines).await, "y");
        assert_eq!(next_text(&mut h.lines).await, "z");

        let state = timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert_eq!(state.offset, 5);
        assert!(h.lines.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_follow_emits_appended_line_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "x\ny\nz\n").unwrap();

        let mut h = spawn(&path, Seed::LastLines(10), follow());
        for expected in ["x", "y", "z"] {
            assert_eq!(next_text(&mut h.lines).await, expected);
        }

        append(&path, "w\n");
        let line = timeout(TIMEOUT, h.lines.recv()).await.unwrap().unwrap();
        assert_eq!(line.text, "w");
        assert_eq!(line.origin, path);

        // Nothing else shows up: no duplicates of the seeded lines.
        assert!(timeout(Duration::from_millis(150), h.lines.recv()).await.is_err());
        h.cancel.cancel();
        let state = timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert_eq!(state.offset, 8);
        assert!(state.offset <= state.size);
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_top() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "old line one\nold line two\n").unwrap();

        let mut h = spawn(&path, Seed::LastLines(0), follow());
        // Let the watcher prime at the end of the file.
        tokio::time::sleep(Duration::from_millis(60)).await;

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(next_text(&mut h.lines).await, "new");
        assert!(timeout(Duration::from_millis(150), h.lines.recv()).await.is_err());
        h.cancel.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replacement_detected_by_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "aaaa\n").unwrap();

        let mut h = spawn(&path, Seed::LastLines(10), follow());
        assert_eq!(next_text(&mut h.lines).await, "aaaa");

        // Same size, different file.
        let rotated = dir.path().join("a.log.1");
        let replacement = dir.path().join("a.log.new");
        std::fs::write(&replacement, "bbbb\n").unwrap();
        std::fs::rename(&path, &rotated).unwrap();
        std::fs::rename(&replacement, &path).unwrap();

        assert_eq!(next_text(&mut h.lines).await, "bbbb");
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_at_registration_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.log");

        let mut h = spawn(&path, Seed::LastLines(10), follow());
        let event = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(event.fatal);
        assert!(event.error.is_not_found());
        assert_eq!(event.origin, path);

        timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deleted_file_closes_after_grace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "x\n").unwrap();

        let config = TailConfig {
            deletion_grace: Duration::from_millis(100),
            ..follow()
        };
        let mut h = spawn(&path, Seed::LastLines(10), config);
        assert_eq!(next_text(&mut h.lines).await, "x");

        std::fs::remove_file(&path).unwrap();

        let first = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(!first.fatal);
        let second = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(second.fatal);

        timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recreated_file_is_read_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "before\n").unwrap();

        let mut h = spawn(&path, Seed::LastLines(10), follow());
        assert_eq!(next_text(&mut h.lines).await, "before");

        std::fs::remove_file(&path).unwrap();
        let event = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(!event.fatal);

        std::fs::write(&path, "after one\nafter two\n").unwrap();
        assert_eq!(next_text(&mut h.lines).await, "after one");
        assert_eq!(next_text(&mut h.lines).await, "after two");
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failures_escalate_after_retry_budget() {
        let dir = tempdir().unwrap();
        // Opens fine but every read fails, on every filesystem.
        let path = dir.path().join("not-a-file");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("entry"), "x\n").unwrap();

        let config = TailConfig {
            retry_budget: 3,
            ..follow()
        };
        let mut h = spawn(&path, Seed::LastLines(10), config);

        for _ in 0..2 {
            let event = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
            assert!(!event.fatal);
            assert!(matches!(event.error, Error::Io { .. }));
        }
        let event = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(event.fatal);
        assert_eq!(event.origin, path);

        timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(h.errors.recv().await.is_none());
        assert!(h.lines.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permission_denied_is_retried() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.log");
        std::fs::write(&path, "secret\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::File::open(&path).is_ok() {
            // Permission bits do not apply to this user (root).
            return;
        }

        let config = TailConfig {
            retry_budget: 100,
            ..follow()
        };
        let mut h = spawn(&path, Seed::LastLines(10), config);

        let event = timeout(TIMEOUT, h.errors.recv()).await.unwrap().unwrap();
        assert!(!event.fatal);
        assert!(matches!(event.error, Error::PermissionDenied(ref p) if p == &path));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(next_text(&mut h.lines).await, "secret");
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_poll() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "x\n").unwrap();

        let config = TailConfig::default().with_poll_interval(Duration::from_secs(3600));
        let mut h = spawn(&path, Seed::LastLines(10), config);
        assert_eq!(next_text(&mut h.lines).await, "x");

        h.cancel.cancel();
        timeout(Duration::from_millis(500), h.handle).await.unwrap().unwrap();
    }
}
