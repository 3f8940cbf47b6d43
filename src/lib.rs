//! Asynchronous, multiplexed `tail -F` for files and directory trees.
//!
//! A [`Tailor`] owns one polling watcher per file. Each watcher seeds its
//! output with the last lines of the file, then follows what gets appended,
//! starting over whenever the file is truncated or replaced. Directories can
//! be watched too, in which case files created under them are picked up as
//! they appear. Lines of all files are merged into a single stream of
//! [`FileLine`]s, tagged with the file they came from.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use muxtail::{TailConfig, Tailor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), muxtail::Error> {
//!     let config = TailConfig::default()
//!         .with_line_count(5)
//!         .with_poll_interval(Duration::from_millis(250))
//!         .with_file("some/file.log")
//!         .with_file("/some/other/file.log");
//!     let (tailor, mut output) = Tailor::new(config)?;
//!
//!     let shutdown = tokio_util::sync::CancellationToken::new();
//!     tailor.close_on_cancellation(shutdown.clone());
//!
//!     while let Some(line) = output.lines.next_line().await {
//!         println!("source: {}, line: {}", line.origin().display(), line.text());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For a one-off look at several files, see [`snapshot::aggregate`].
//!
//! ## Caveats
//!
//! Files are polled rather than watched through filesystem events, so new
//! lines show up within one `poll_interval`. Directory watches do use
//! [`notify`](https://crates.io/crates/notify) events, with a periodic rescan
//! behind them.

pub mod buffer;
mod config;
mod error;
pub mod scanner;
pub mod snapshot;
mod tailor;
pub mod watcher;

pub use config::{Mode, Source, TailConfig};
pub use error::{Error, ErrorEvent};
pub use scanner::DirectoryRule;
pub use snapshot::{tail_file, tail_files, Snapshot};
pub use tailor::{ErrorEvents, FileLine, FileLines, Output, Tailor};
