//! Everything related to finding files under a directory: the initial walk,
//! and watching the tree for files created afterwards.

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::Error;

/// Decides inclusion from a path relative to the rule's root.
pub type Filter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Which files under a directory should be tailed.
#[derive(Clone)]
pub struct DirectoryRule {
    pub root: PathBuf,
    pub recursive: bool,
    pub filter: Filter,
}

impl Debug for DirectoryRule {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DirectoryRule")
            .field("root", &self.root)
            .field("recursive", &self.recursive)
            .finish_non_exhaustive()
    }
}

impl DirectoryRule {
    pub fn new<F>(root: impl Into<PathBuf>, recursive: bool, filter: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        DirectoryRule {
            root: root.into(),
            recursive,
            filter: Arc::new(filter),
        }
    }

    /// Every file in the whole tree under `root`.
    pub fn all(root: impl Into<PathBuf>) -> Self {
        Self::new(root, true, |_| true)
    }

    /// Whether `path` is in scope for this rule and passes its filter.
    pub fn matches(&self, path: &Path) -> bool {
        let relative = match path.strip_prefix(&self.root) {
            Ok(relative) => relative,
            Err(_) => return false,
        };
        if !self.recursive && relative.components().count() != 1 {
            return false;
        }

        (self.filter)(relative)
    }
}

/// Lazy, depth-first walk over the files a [`DirectoryRule`] selects.
///
/// Entries of each directory are visited in lexical order. Symlinks to files
/// are yielded, symlinked directories are not descended into.
pub struct Scan {
    rule: DirectoryRule,
    walk: walkdir::IntoIter,
}

/// Starts walking `rule.root`. Fails if the root itself cannot be listed.
pub fn scan(rule: &DirectoryRule) -> io::Result<Scan> {
    fs::read_dir(&rule.root)?;

    let mut walk = WalkDir::new(&rule.root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    if !rule.recursive {
        walk = walk.max_depth(1);
    }

    Ok(Scan {
        rule: rule.clone(),
        walk: walk.into_iter(),
    })
}

impl Iterator for Scan {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                // Entries can vanish while we walk; that is not an error.
                Err(e) if vanished(&e) => continue,
                Err(e) => return Some(Err(e.into())),
            };

            let is_file = if entry.path_is_symlink() {
                fs::metadata(entry.path()).map_or(false, |m| m.is_file())
            } else {
                entry.file_type().is_file()
            };
            if is_file && self.rule.matches(entry.path()) {
                return Some(Ok(entry.into_path()));
            }
        }
    }
}

fn vanished(e: &walkdir::Error) -> bool {
    e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound)
}

fn is_file(path: &Path, meta: &fs::Metadata) -> bool {
    if meta.file_type().is_symlink() {
        return fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
    }
    meta.is_file()
}

/// Keeps watching a directory tree and reports files that appear in it.
///
/// Filesystem events from `notify` give prompt notice; a full rescan every
/// `poll_interval` catches whatever the events missed.
pub struct DirectoryWatch {
    rule: DirectoryRule,
    poll_interval: Duration,
    /// Matching paths already reported (or found by the initial scan).
    seen: HashSet<PathBuf>,
}

impl Debug for DirectoryWatch {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DirectoryWatch")
            .field("rule", &self.rule)
            .field("poll_interval", &self.poll_interval)
            .field("seen", &self.seen)
            .finish()
    }
}

impl DirectoryWatch {
    pub fn new(rule: DirectoryRule, poll_interval: Duration, seen: HashSet<PathBuf>) -> Self {
        DirectoryWatch {
            rule,
            poll_interval,
            seen,
        }
    }

    /// Calls `on_new_file` once for every matching file created under the
    /// root, until `cancel` fires.
    ///
    /// Problems with filesystem events go to `on_error` as `Error::Watch`;
    /// the watch carries on with rescans alone. Returns
    /// `Error::DirectoryGone` if the root stops being a directory.
    pub async fn run<F, E>(
        mut self,
        cancel: CancellationToken,
        mut on_new_file: F,
        mut on_error: E,
    ) -> Result<(), Error>
    where
        F: FnMut(PathBuf),
        E: FnMut(Error),
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Dropping the watcher unsubscribes from the tree.
        let _watcher = match self.subscribe(tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(root = %self.rule.root.display(), "falling back to polling: {}", e);
                on_error(Error::Watch(e));
                None
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(root = %self.rule.root.display(), "directory watch cancelled");
                    return Ok(());
                }
                Some(res) = rx.recv() => match res {
                    Ok(event) => {
                        if self.handle_event(event, &mut on_new_file) {
                            self.rescan(&mut on_new_file).await?;
                        }
                    }
                    Err(e) => {
                        warn!(root = %self.rule.root.display(), "event error: {}", e);
                        on_error(Error::Watch(e));
                    }
                },
                _ = ticker.tick() => self.rescan(&mut on_new_file).await?,
            }
        }
    }

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<notify::Result<notify::Event>>,
    ) -> notify::Result<notify::RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver only goes away once `run` returns.
            let _ = tx.send(res);
        })?;

        let mode = if self.rule.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.rule.root, mode)?;

        Ok(watcher)
    }

    /// Reports new files named by `event`. Returns `true` if the tree changed
    /// in a way that needs a full rescan.
    fn handle_event<F>(&mut self, event: notify::Event, on_new_file: &mut F) -> bool
    where
        F: FnMut(PathBuf),
    {
        trace!(?event, "directory event");
        let mut rescan = false;

        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    let meta = match fs::symlink_metadata(&path) {
                        Ok(meta) => meta,
                        Err(_) => continue,
                    };
                    if meta.is_dir() {
                        // Files may have landed before the subdirectory was watched.
                        rescan |= self.rule.recursive;
                    } else if is_file(&path, &meta)
                        && self.rule.matches(&path)
                        && self.seen.insert(path.clone())
                    {
                        debug!(path = %path.display(), "discovered file");
                        on_new_file(path);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    if path == self.rule.root {
                        rescan = true;
                    }
                    self.seen.retain(|seen| !seen.starts_with(&path));
                }
            }
            _ => {}
        }

        rescan
    }

    async fn rescan<F>(&mut self, on_new_file: &mut F) -> Result<(), Error>
    where
        F: FnMut(PathBuf),
    {
        let root = &self.rule.root;
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(Error::DirectoryGone(root.clone())),
        }

        let rule = self.rule.clone();
        let found = tokio::task::spawn_blocking(move || collect(&rule)).await;
        let found = match found {
            Ok(Ok(found)) => found,
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::DirectoryGone(root.clone()));
            }
            Ok(Err(e)) => {
                warn!(root = %root.display(), "rescan failed: {}", e);
                return Ok(());
            }
            Err(e) => {
                warn!(root = %root.display(), "rescan task failed: {}", e);
                return Ok(());
            }
        };

        for path in &found {
            if !self.seen.contains(path) {
                debug!(path = %path.display(), "discovered file");
                on_new_file(path.clone());
            }
        }
        self.seen = found.into_iter().collect();

        Ok(())
    }
}

/// Runs a whole [`Scan`], skipping entries that could not be inspected.
pub(crate) fn collect(rule: &DirectoryRule) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in scan(rule)? {
        match entry {
            Ok(path) => found.push(path),
            Err(e) => trace!(root = %rule.root.display(), "skipping entry: {}", e),
        }
    }

    Ok(found)
}

/// Makes `path` absolute with a canonical parent, so the same file always
/// maps to the same key. The file itself need not exist.
pub(crate) fn absolutify(path: impl Into<PathBuf>, is_file: bool) -> io::Result<PathBuf> {
    let path = path.into();

    let (dir, maybe_filename) = if is_file {
        let parent = match path.parent() {
            None => std::env::current_dir()?,
            Some(path) => {
                if path == Path::new("") {
                    std::env::current_dir()?
                } else {
                    path.to_path_buf()
                }
            }
        };
        let filename = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
            .to_os_string();

        (parent, Some(filename))
    } else {
        (path, None)
    };

    let dir = dir.canonicalize().unwrap_or(dir);

    let path = if let Some(filename) = maybe_filename {
        dir.join(filename)
    } else {
        dir
    };

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "").unwrap();
    }

    fn names(root: &Path, paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_scan_lexical_and_recursive() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["b.log", "a.log", "sub/c.log", "sub/deeper/d.txt", "z.log"] {
            touch(&root.join(name));
        }

        let flat = collect(&DirectoryRule::new(root, false, |_| true)).unwrap();
        assert_eq!(names(root, &flat), vec!["a.log", "b.log", "z.log"]);

        let deep = collect(&DirectoryRule::all(root)).unwrap();
        assert_eq!(
            names(root, &deep),
            vec!["a.log", "b.log", "sub/c.log", "sub/deeper/d.txt", "z.log"]
        );

        let logs = DirectoryRule::new(root, true, |rel| {
            rel.extension().map_or(false, |e| e == "log")
        });
        let logs = collect(&logs).unwrap();
        assert_eq!(names(root, &logs), vec!["a.log", "b.log", "sub/c.log", "z.log"]);
    }

    #[test]
    fn test_scan_is_lazy_iterator() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["1", "2", "3"] {
            touch(&root.join(name));
        }

        let mut walk = scan(&DirectoryRule::all(root)).unwrap();
        let first = walk.next().unwrap().unwrap();
        assert_eq!(first, root.join("1"));
        assert_eq!(walk.count(), 2);
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = tempdir().unwrap();
        assert!(scan(&DirectoryRule::all(dir.path().join("nope"))).is_err());
    }

    #[test]
    fn test_rule_matches_relative_path() {
        let rule = DirectoryRule::new("/logs", false, |rel| rel == Path::new("app.log"));
        assert!(rule.matches(Path::new("/logs/app.log")));
        assert!(!rule.matches(Path::new("/logs/other.log")));
        assert!(!rule.matches(Path::new("/logs/sub/app.log")));
        assert!(!rule.matches(Path::new("/elsewhere/app.log")));
    }

    #[tokio::test]
    async fn test_watch_reports_new_file_once() {
        let dir = tempdir().unwrap();
        let root = absolutify(dir.path(), false).unwrap();
        let rule = DirectoryRule::all(&root);

        let cancel = CancellationToken::new();
        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let watch = DirectoryWatch::new(rule, Duration::from_millis(30), HashSet::new());
        let task = tokio::spawn(watch.run(
            cancel.clone(),
            move |path| {
                let _ = found_tx.send(path);
            },
            |_| {},
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let created = root.join("sub").join("b.log");
        touch(&created);
        fs::write(&created, "hello\n").unwrap();

        let path = timeout(Duration::from_secs(2), found_rx.recv()).await.unwrap().unwrap();
        assert_eq!(path, created);

        // Further writes and rescans do not report it again.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(found_rx.try_recv().is_err());

        cancel.cancel();
        assert!(timeout(Duration::from_secs(1), task).await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watch_reports_vanished_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("logs");
        fs::create_dir(&root).unwrap();
        let root = absolutify(root, false).unwrap();

        let rule = DirectoryRule::all(&root);
        let watch = DirectoryWatch::new(rule, Duration::from_millis(20), HashSet::new());
        let task = tokio::spawn(watch.run(CancellationToken::new(), |_| {}, |_| {}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::remove_dir(&root).unwrap();

        let res = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(Error::DirectoryGone(p)) if p == root));
    }

    #[tokio::test]
    async fn test_watch_setup_failure_is_reported() {
        let dir = tempdir().unwrap();
        let root = absolutify(dir.path().join("never-created"), false).unwrap();

        let mut errors = Vec::new();
        let rule = DirectoryRule::all(&root);
        let watch = DirectoryWatch::new(rule, Duration::from_millis(20), HashSet::new());
        let res = timeout(
            Duration::from_secs(2),
            watch.run(CancellationToken::new(), |_| {}, |e| errors.push(e)),
        )
        .await
        .unwrap();

        assert!(matches!(res, Err(Error::DirectoryGone(p)) if p == root));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Watch(_)));
    }

    #[test]
    fn test_scan_skips_symlinked_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        touch(&root.join("a.log"));
        touch(&outside.join("b.log"));

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, root.join("linked")).unwrap();
            std::os::unix::fs::symlink(outside.join("b.log"), root.join("b.log")).unwrap();
        }

        let found = collect(&DirectoryRule::all(&root)).unwrap();
        #[cfg(unix)]
        assert_eq!(names(&root, &found), vec!["a.log", "b.log"]);
        #[cfg(not(unix))]
        assert_eq!(names(&root, &found), vec!["a.log"]);
    }

    #[test]
    fn test_absolutify_missing_file() {
        let dir = tempdir().unwrap();
        let path = absolutify(dir.path().join("missing.log"), true).unwrap();
        assert!(path.is_absolute());
        assert_eq!(path.file_name().unwrap(), "missing.log");

        assert!(absolutify(dir.path().join(".."), true).is_err());
    }
}
