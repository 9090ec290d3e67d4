//! Side-car offset files.
//!
//! Each tailed file has a side-car under the offset directory named after its
//! [`FileId`](crate::identity::FileId). The side-car is an append-only list of
//! decimal byte offsets, one per line; the last complete line is the current
//! offset. Nothing is cached here: callers read the side-car on cold start and
//! keep the running offset in memory afterwards.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

/// Returns the last offset recorded in `path`.
///
/// `Ok(None)` means nothing was ever recorded: the side-car is missing, empty,
/// or only holds an unterminated fragment left by a torn append.
pub async fn read_last_offset(path: &Path) -> Result<Option<u64>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to open side-car {}", path.display()))
        }
    };

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut last = None;
    let mut rejected = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .with_context(|| format!("failed to read side-car {}", path.display()))?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            // torn append from a crash mid-write
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<u64>() {
            Ok(offset) => last = Some(offset),
            Err(err) => {
                rejected += 1;
                warn!(
                    path = %path.display(),
                    line = trimmed,
                    error = %err,
                    "skipping unparsable side-car line"
                );
            }
        }
    }

    if last.is_none() && rejected > 0 {
        anyhow::bail!(
            "side-car {} holds {} lines but no parsable offset",
            path.display(),
            rejected
        );
    }
    Ok(last)
}

/// Append-mode handle on one side-car file.
///
/// Owned by exactly one live tail task at a time; the sink appends through it
/// on the task's behalf once the matching line has been delivered.
#[derive(Debug)]
pub struct OffsetLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl OffsetLog {
    /// Opens `path` for append, creating it if needed.
    ///
    /// A torn trailing fragment is cut back to the last newline first so the
    /// next append starts on its own line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        drop_torn_tail(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open side-car {} for append", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, offset: u64) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(format!("{offset}\n").as_bytes())
            .await
            .with_context(|| format!("failed to append offset to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush side-car {}", self.path.display()))?;
        Ok(())
    }
}

async fn drop_torn_tail(path: &Path) -> Result<()> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read side-car {}", path.display()))
        }
    };
    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }

    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = contents.len() - keep,
        "truncating torn trailing side-car line"
    );

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open side-car {} for repair", path.display()))?;
    file.set_len(keep as u64)
        .await
        .with_context(|| format!("failed to truncate side-car {}", path.display()))?;
    file.sync_data()
        .await
        .with_context(|| format!("failed to sync side-car {}", path.display()))
}

pub async fn rename(path: &Path, target: &Path) -> Result<()> {
    fs::rename(path, target).await.with_context(|| {
        format!(
            "failed to rename {} to {}",
            path.display(),
            target.display()
        )
    })
}
