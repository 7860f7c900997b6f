//! Line sources the watcher can read from

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Something that yields output lines one at a time
///
/// `Ok(None)` means the source is exhausted and will never produce more.
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Live output stream from a supervised process
#[async_trait]
impl LineSource for mpsc::UnboundedReceiver<String> {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.recv().await)
    }
}

/// Follows a file that another process is still writing, like `tail -F`
///
/// Reads from the beginning. Missing files are waited for, and a trailing
/// line without its newline is held back until the newline arrives. The
/// follower is never exhausted; callers bound it with a deadline.
pub struct FileFollower {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    partial: Vec<u8>,
    poll: Duration,
}

impl FileFollower {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            partial: Vec::new(),
            poll: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&mut self) -> io::Result<bool> {
        match File::open(&self.path).await {
            Ok(file) => {
                self.reader = Some(BufReader::new(file));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl LineSource for FileFollower {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.reader.is_none() && !self.open().await? {
                tokio::time::sleep(self.poll).await;
                continue;
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            let read = reader.read_until(b'\n', &mut self.partial).await?;
            if read > 0 && self.partial.ends_with(b"\n") {
                let line = String::from_utf8_lossy(&self.partial)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                self.partial.clear();
                return Ok(Some(line));
            }
            // At EOF (possibly mid-line): wait for the writer
            tokio::time::sleep(self.poll).await;
        }
    }
}
