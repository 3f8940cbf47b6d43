//! One-shot tails of several files at once.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::buffer::{read_last_lines, Partial};
use crate::config::TailConfig;
use crate::error::Error;

/// Last lines of every requested file, or why they could not be read.
#[derive(Debug, Default)]
pub struct Snapshot {
    results: BTreeMap<PathBuf, Result<Vec<String>, Error>>,
}

impl Snapshot {
    /// The lines read from `path`, or why they could not be read. `None` if
    /// `path` was not requested.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Result<Vec<String>, Error>> {
        self.results.get(path.as_ref())
    }

    /// Results in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Result<Vec<String>, Error>)> {
        self.results.iter()
    }

    /// Number of requested paths, failed ones included.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<PathBuf, Result<Vec<String>, Error>> {
        self.results
    }
}

/// Reads the last `n` lines of each path, at most `workers` files at a time.
///
/// Returns only once every read has finished. A failing path does not affect
/// the others.
pub async fn aggregate<I, P>(paths: I, n: usize, workers: usize) -> Snapshot
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for path in paths {
        let path: PathBuf = path.into();
        let permits = permits.clone();
        tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await;
            let read = read_last_lines(&path, n, Partial::Include);
            let res = guarded(&path, async { read.await.map(|chunk| chunk.lines) }).await;
            (path, res)
        });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((path, res)) => {
                if let Err(e) = &res {
                    warn!(path = %path.display(), "{}", e);
                }
                results.insert(path, res);
            }
            // Panics are caught in the task and nothing aborts it.
            Err(e) => warn!("snapshot task failed: {}", e),
        }
    }

    debug!(files = results.len(), "snapshot complete");
    Snapshot { results }
}

/// Turns a panic while reading `path` into an error for that path.
async fn guarded<F>(path: &Path, read: F) -> Result<Vec<String>, Error>
where
    F: Future<Output = Result<Vec<String>, Error>>,
{
    match AssertUnwindSafe(read).catch_unwind().await {
        Ok(res) => res,
        Err(_) => Err(Error::Panicked(path.to_path_buf())),
    }
}

/// Snapshot of every file source in `config`.
pub async fn tail_files(config: &TailConfig) -> Result<Snapshot, Error> {
    config.validate()?;

    let paths: Vec<PathBuf> = config.files().cloned().collect();
    Ok(aggregate(paths, config.line_count, config.snapshot_workers).await)
}

/// The last `n` lines of a single file.
pub async fn tail_file(path: impl AsRef<Path>, n: usize) -> Result<Vec<String>, Error> {
    read_last_lines(path, n, Partial::Include)
        .await
        .map(|chunk| chunk.lines)
}
