//! Everything related to multiplexing many watchers into one line stream.

use std::collections::{HashMap, HashSet};
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;
use std::time::Duration;

use futures_util::future::FutureExt;
use futures_util::stream::Stream as FuturesStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{Mode, Source, TailConfig};
use crate::error::{Error, ErrorEvent};
use crate::scanner::{absolutify, collect, DirectoryRule, DirectoryWatch};
use crate::watcher::{FileWatcher, Seed, Sinks};

/// A single line read from a watched file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileLine {
    /// The file the line was read from.
    pub origin: PathBuf,
    /// The line, without its line terminator.
    pub text: String,
}

impl FileLine {
    pub fn origin(&self) -> &Path {
        self.origin.as_path()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_inner(self) -> (PathBuf, String) {
        let FileLine { origin, text } = self;

        (origin, text)
    }
}

/// The merged stream of lines from every watcher of a [`Tailor`].
///
/// Lines of one file arrive in file order. Lines of different files are
/// interleaved as they are read. The stream ends once the tailor has no
/// watcher left and can get no new one.
#[derive(Debug)]
pub struct FileLines {
    rx: mpsc::Receiver<FileLine>,
}

impl FileLines {
    pub async fn next_line(&mut self) -> Option<FileLine> {
        self.rx.recv().await
    }
}

impl FuturesStream for FileLines {
    type Item = FileLine;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Failures reported by watchers, separate from the lines.
#[derive(Debug)]
pub struct ErrorEvents {
    rx: mpsc::UnboundedReceiver<ErrorEvent>,
}

impl ErrorEvents {
    pub async fn next_error(&mut self) -> Option<ErrorEvent> {
        self.rx.recv().await
    }
}

impl FuturesStream for ErrorEvents {
    type Item = ErrorEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Receiving ends of a [`Tailor`].
#[derive(Debug)]
pub struct Output {
    pub lines: FileLines,
    pub errors: ErrorEvents,
}

#[derive(Debug)]
enum Command {
    AddFile { path: PathBuf, seed: Seed },
    AddDirectory(DirectoryRule),
    RemoveFile(PathBuf),
}

/// Handle to a running set of file watchers.
///
/// All watchers are owned by a coordinator task; the handle only sends it
/// requests, so it is cheap to clone. The line stream ends when every handle
/// has been dropped (or the tailor was cancelled) and the last watcher has
/// stopped.
///
/// ```no_run
/// use muxtail::{Tailor, TailConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), muxtail::Error> {
///     let (tailor, mut output) = Tailor::new(TailConfig::default())?;
///     tailor.add_file("some/file.log")?;
///     tailor.add_recursive_directory("/var/log/app", |rel| {
///         rel.extension().map_or(false, |ext| ext == "log")
///     })?;
///
///     while let Some(line) = output.lines.next_line().await {
///         println!("({}) {}", line.origin().display(), line.text());
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Tailor {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    line_count: usize,
}

impl Tailor {
    /// Starts the coordinator and registers `config.sources`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: TailConfig) -> Result<(Tailor, Output), Error> {
        config.validate()?;

        let (lines_tx, lines_rx) = mpsc::channel(config.channel_capacity);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tailor = Tailor {
            commands: commands_tx,
            cancel: cancel.clone(),
            line_count: config.line_count,
        };

        let sources = config.sources.clone();
        let sinks = Sinks {
            lines: lines_tx,
            errors: errors_tx,
        };
        tokio::spawn(Coordinator::new(config, sinks, commands_rx, cancel).run());

        for source in sources {
            match source {
                Source::File(path) => {
                    tailor.add_file(path)?;
                }
                Source::Directory(rule) => tailor.add_directory(rule)?,
            }
        }

        let output = Output {
            lines: FileLines { rx: lines_rx },
            errors: ErrorEvents { rx: errors_rx },
        };

        Ok((tailor, output))
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Starts following `path`, unless it is already followed.
    ///
    /// Returns the normalized path, which is what each [`FileLine::origin`]
    /// from this file will hold.
    pub fn add_file(&self, path: impl Into<PathBuf>) -> Result<PathBuf, Error> {
        let path = path.into();
        let path = absolutify(&path, true).map_err(|e| Error::from_io(&path, e))?;

        if path.is_dir() {
            let source = io::Error::new(io::ErrorKind::InvalidInput, "path is a directory");
            return Err(Error::Io { path, source });
        }

        self.send(Command::AddFile {
            path: path.clone(),
            seed: Seed::LastLines(self.line_count),
        })?;

        Ok(path)
    }

    /// Follows every file under `root` (recursively) accepted by `filter`,
    /// including files created later on.
    pub fn add_recursive_directory<F>(
        &self,
        root: impl Into<PathBuf>,
        filter: F,
    ) -> Result<(), Error>
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.add_directory(DirectoryRule::new(root, true, filter))
    }

    pub fn add_directory(&self, mut rule: DirectoryRule) -> Result<(), Error> {
        rule.root = absolutify(&rule.root, false).map_err(|e| Error::from_io(&rule.root, e))?;
        if !rule.root.is_dir() {
            return Err(Error::NotFound(rule.root));
        }

        self.send(Command::AddDirectory(rule))
    }

    /// Stops following `path`. No line read after this call is emitted.
    pub fn remove_file(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let path = path.into();
        let path = absolutify(&path, true).map_err(|e| Error::from_io(&path, e))?;

        self.send(Command::RemoveFile(path))
    }

    /// Cancels the tailor once `token` is cancelled.
    pub fn close_on_cancellation(&self, token: CancellationToken) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Stops every watcher. The line stream ends once they all stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct WatcherHandle {
    id: u64,
    cancel: CancellationToken,
}

enum TaskExit {
    Watcher {
        path: PathBuf,
        id: u64,
        panicked: bool,
    },
    Directory {
        root: PathBuf,
        result: Result<(), Error>,
    },
}

/// Sole owner of the watch set; every mutation happens on its task.
struct Coordinator {
    config: TailConfig,
    sinks: Sinks,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Files found by directory watches, with the seed to start them with.
    discovered_tx: mpsc::UnboundedSender<(PathBuf, Seed)>,
    discovered: mpsc::UnboundedReceiver<(PathBuf, Seed)>,
    watchers: HashMap<PathBuf, WatcherHandle>,
    /// Watched paths a directory watch found again while their watcher ran.
    deferred: HashSet<PathBuf>,
    directories: HashSet<PathBuf>,
    tasks: JoinSet<TaskExit>,
    next_id: u64,
    cancel: CancellationToken,
}

impl Coordinator {
    fn new(
        config: TailConfig,
        sinks: Sinks,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        let (discovered_tx, discovered) = mpsc::unbounded_channel();

        Coordinator {
            config,
            sinks,
            commands,
            discovered_tx,
            discovered,
            watchers: HashMap::new(),
            deferred: HashSet::new(),
            directories: HashSet::new(),
            tasks: JoinSet::new(),
            next_id: 0,
            cancel,
        }
    }

    async fn run(mut self) {
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => commands_open = false,
                },
                Some((path, seed)) = self.discovered.recv() => self.discover(path, seed),
                Some(res) = self.tasks.join_next() => self.reap(res),
            }

            if !commands_open && self.tasks.is_empty() {
                // A directory watch may have queued files right before exiting.
                while let Ok((path, seed)) = self.discovered.try_recv() {
                    self.discover(path, seed);
                }
                if self.tasks.is_empty() {
                    debug!("all watchers finished");
                    return;
                }
            }
        }

        self.shutdown().await;
    }

    fn handle(&mut self, command: Command) {
        trace!(?command, "command");
        match command {
            Command::AddFile { path, seed } => self.register(path, seed),
            Command::AddDirectory(rule) => self.watch_directory(rule),
            Command::RemoveFile(path) => {
                self.deferred.remove(&path);
                if let Some(handle) = self.watchers.remove(&path) {
                    debug!(path = %path.display(), "removing watcher");
                    handle.cancel.cancel();
                }
            }
        }
    }

    /// Registers a file found by a directory watch.
    fn discover(&mut self, path: PathBuf, seed: Seed) {
        if self.watchers.contains_key(&path) {
            // The running watcher may be about to give up on a deleted file.
            trace!(path = %path.display(), "rediscovered while watched");
            self.deferred.insert(path);
            return;
        }

        self.register(path, seed);
    }

    fn register(&mut self, path: PathBuf, seed: Seed) {
        if self.watchers.contains_key(&path) {
            trace!(path = %path.display(), "already watched");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        let cancel = self.cancel.child_token();

        let sinks = self.sinks.clone();
        let watcher = FileWatcher::new(path.clone(), seed, &self.config, sinks, cancel.clone());
        let task_path = path.clone();
        self.tasks.spawn(async move {
            let panicked = AssertUnwindSafe(watcher.run()).catch_unwind().await.is_err();
            TaskExit::Watcher {
                path: task_path,
                id,
                panicked,
            }
        });

        self.watchers.insert(path, WatcherHandle { id, cancel });
    }

    fn watch_directory(&mut self, rule: DirectoryRule) {
        if !self.directories.insert(rule.root.clone()) {
            trace!(root = %rule.root.display(), "directory already watched");
            return;
        }

        let root = rule.root.clone();
        let seed = Seed::LastLines(self.config.line_count);
        let mode = self.config.mode;
        let poll_interval = self.config.poll_interval;
        let discovered = self.discovered_tx.clone();
        let errors = self.sinks.errors.clone();
        let cancel = self.cancel.child_token();

        self.tasks.spawn(async move {
            let watch = run_directory(rule, seed, mode, poll_interval, discovered, errors, cancel);
            let result = match AssertUnwindSafe(watch).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::Panicked(root.clone())),
            };
            TaskExit::Directory { root, result }
        });
    }

    fn reap(&mut self, res: Result<TaskExit, JoinError>) {
        match res {
            Ok(TaskExit::Watcher { path, id, panicked }) => {
                // The path may have been removed and added again meanwhile.
                if self.watchers.get(&path).map(|handle| handle.id) != Some(id) {
                    return;
                }
                self.watchers.remove(&path);
                let rediscovered = self.deferred.remove(&path);

                if panicked {
                    let error = Error::Panicked(path.clone());
                    warn!(path = %path.display(), fatal = true, "{}", error);
                    let _ = self.sinks.errors.send(ErrorEvent {
                        origin: path,
                        error,
                        fatal: true,
                    });
                } else if rediscovered && !self.cancel.is_cancelled() && path.is_file() {
                    debug!(path = %path.display(), "following rediscovered file");
                    self.register(path, Seed::Beginning);
                }
            }
            Ok(TaskExit::Directory { root, result }) => {
                self.directories.remove(&root);
                if let Err(error) = result {
                    self.directory_failed(root, error);
                }
            }
            // Panics are caught inside the tasks; only aborts end up here.
            Err(e) => warn!("task failed: {}", e),
        }
    }

    /// Closes every watcher under `root` and reports the failure once.
    fn directory_failed(&mut self, root: PathBuf, error: Error) {
        warn!(root = %root.display(), fatal = true, "{}", error);

        self.deferred.retain(|path| !path.starts_with(&root));
        self.watchers.retain(|path, handle| {
            let inside = path.starts_with(&root);
            if inside {
                handle.cancel.cancel();
            }
            !inside
        });

        let _ = self.sinks.errors.send(ErrorEvent {
            origin: root,
            error,
            fatal: true,
        });
    }

    async fn shutdown(mut self) {
        debug!(watchers = self.watchers.len(), "cancelling tailor");
        self.commands.close();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "aborting tasks that missed the shutdown grace"
            );
            self.tasks.shutdown().await;
        }
    }
}

async fn run_directory(
    rule: DirectoryRule,
    seed: Seed,
    mode: Mode,
    poll_interval: Duration,
    discovered: mpsc::UnboundedSender<(PathBuf, Seed)>,
    errors: mpsc::UnboundedSender<ErrorEvent>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let scan_rule = rule.clone();
    let initial = match tokio::task::spawn_blocking(move || collect(&scan_rule)).await {
        Ok(Ok(initial)) => initial,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::DirectoryGone(rule.root));
        }
        Ok(Err(e)) => return Err(Error::from_io(&rule.root, e)),
        Err(e) => {
            let source = io::Error::new(io::ErrorKind::Other, e);
            return Err(Error::Io { path: rule.root, source });
        }
    };

    debug!(root = %rule.root.display(), files = initial.len(), "initial directory scan");
    for path in &initial {
        let _ = discovered.send((path.clone(), seed));
    }

    if mode == Mode::Snapshot {
        return Ok(());
    }

    let root = rule.root.clone();
    let watch = DirectoryWatch::new(rule, poll_interval, initial.into_iter().collect());
    watch
        .run(
            cancel,
            |path| {
                let _ = discovered.send((path, Seed::Beginning));
            },
            |error| {
                let _ = errors.send(ErrorEvent {
                    origin: root.clone(),
                    error,
                    fatal: false,
                });
            },
        )
        .await
}
