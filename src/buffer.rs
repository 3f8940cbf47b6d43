//! Everything related to pulling lines out of a file: the reverse scan used
//! to seed a tail, and the incremental read used while following.

use std::io::{self, SeekFrom};
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Error;

/// Size of the blocks read backwards from the end of a file.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// How an unterminated final line is treated by [`read_last_lines`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Partial {
    /// The file is read once; a final line without `\n` is still a line.
    Include,
    /// More data is expected; the final line waits for its `\n`.
    Hold,
}

/// Lines read from a file along with the offset to resume from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Chunk {
    pub lines: Vec<String>,
    /// Byte position right after the last line in `lines`.
    pub offset: u64,
}

async fn open(path: &Path) -> Result<(File, u64), Error> {
    let file = File::open(path).await.map_err(|e| Error::from_io(path, e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| Error::from_io(path, e))?
        .len();

    Ok((file, len))
}

/// Reads the last `n` lines of `path` without reading the rest of the file.
pub async fn read_last_lines(
    path: impl AsRef<Path>,
    n: usize,
    partial: Partial,
) -> Result<Chunk, Error> {
    let path = path.as_ref();
    let (mut file, len) = open(path).await?;

    let (start, end) = tail_range(&mut file, len, n, partial)
        .await
        .map_err(|e| Error::from_io(path, e))?;

    let mut buf = vec![0u8; (end - start) as usize];
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| Error::from_io(path, e))?;
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::from_io(path, e))?;

    Ok(Chunk {
        lines: split_lines(&buf),
        offset: end,
    })
}

/// Byte range holding the last `n` lines of a file of `len` bytes.
///
/// Blocks are walked backwards and every byte is looked at once; nothing is
/// kept but the newline count.
async fn tail_range(
    file: &mut File,
    len: u64,
    n: usize,
    partial: Partial,
) -> io::Result<(u64, u64)> {
    let mut end = match partial {
        Partial::Include => Some(len),
        Partial::Hold => None,
    };
    if let (Some(end), 0) = (end, n) {
        return Ok((end, end));
    }

    let mut seen = 0;
    let mut block = vec![0u8; CHUNK_SIZE];
    let mut block_end = len;

    while block_end > 0 {
        let size = block_end.min(CHUNK_SIZE as u64) as usize;
        let block_start = block_end - size as u64;

        file.seek(SeekFrom::Start(block_start)).await?;
        file.read_exact(&mut block[..size]).await?;

        for (i, &b) in block[..size].iter().enumerate().rev() {
            if b != b'\n' {
                continue;
            }
            let pos = block_start + i as u64;
            let current = end;
            match current {
                // Last newline of the file: whatever follows waits.
                None if n == 0 => return Ok((pos + 1, pos + 1)),
                None => end = Some(pos + 1),
                // Terminator of the final line.
                Some(end) if pos + 1 == end => {}
                Some(end) => {
                    seen += 1;
                    if seen == n {
                        return Ok((pos + 1, end));
                    }
                }
            }
        }

        block_end = block_start;
    }

    Ok((0, end.unwrap_or(0)))
}

/// Reads every complete line appended at or after `from`.
///
/// A trailing line without `\n` is left for a later call, so the returned
/// offset always sits on a line boundary.
pub async fn read_new_lines(path: impl AsRef<Path>, from: u64) -> Result<Chunk, Error> {
    let path = path.as_ref();
    let (mut file, len) = open(path).await?;

    if len <= from {
        return Ok(Chunk {
            lines: Vec::new(),
            offset: from,
        });
    }

    file.seek(SeekFrom::Start(from))
        .await
        .map_err(|e| Error::from_io(path, e))?;
    let mut buf = Vec::with_capacity((len - from) as usize);
    file.take(len - from)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::from_io(path, e))?;

    let end = buf
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);

    Ok(Chunk {
        lines: split_lines(&buf[..end]),
        offset: from + end as u64,
    })
}

fn split_lines(content: &[u8]) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let body = content.strip_suffix(b"\n").unwrap_or(content);

    body.split(|&b| b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}
