use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};

/// Positional, single-pass line reader over one file.
///
/// Lines come back in file order. When the reader reaches the end of the data
/// it hands out whatever unterminated bytes remain as a final line and then
/// reports the stream as closed; it never waits for the file to grow. Files
/// that keep growing are resumed by a later reconciliation pass.
pub struct TailReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    buffer: Vec<u8>,
    closed: bool,
}

impl TailReader {
    pub async fn open(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset,
            buffer: Vec::new(),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte position just past the last line returned by [`next_line`](Self::next_line).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next line without its terminator, or `None` once the data is exhausted.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }

        let read = self
            .reader
            .read_until(b'\n', &mut self.buffer)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        if read == 0 && self.buffer.is_empty() {
            self.closed = true;
            return Ok(None);
        }

        if self.buffer.last() != Some(&b'\n') {
            // no terminator means end of data; flush the remainder as the last line
            self.closed = true;
        }

        self.offset += self.buffer.len() as u64;
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Ok(Some(line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
