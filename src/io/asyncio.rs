use super::common::{LockDeadline, LOCK_RETRY_INTERVAL};
use super::ReadError;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Async counterpart of [`StreamReader`](super::StreamReader).
pub struct AsyncStreamReader<T> {
    reader: BufReader<File>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> AsyncStreamReader<T> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        Self::open_with_timeout(path, Duration::from_secs(0)).await
    }

    pub async fn open_with_timeout(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self, ReadError> {
        let path = path.as_ref();

        let sync_file = std::fs::OpenOptions::new().read(true).open(path)?;

        let deadline = LockDeadline::new(timeout);

        loop {
            if FileExt::try_lock_shared(&sync_file).is_ok() {
                return Ok(Self {
                    reader: BufReader::new(File::from_std(sync_file)),
                    _phantom: std::marker::PhantomData,
                });
            }
            deadline.check()?;
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, ReadError>>
    where
        T: DeserializeOwned,
    {
        let mut line = String::new();

        loop {
            line.clear();
            match self.reader.read_line(&mut line).await {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str(trimmed) {
                        Ok(item) => return Some(Ok(item)),
                        Err(e) => return Some(Err(ReadError::Deserialization(e))),
                    }
                }
                Err(e) => return Some(Err(ReadError::Io(e))),
            }
        }
    }

    /// Drain the stream into memory, e.g. to hand it to a blocking ingestor.
    pub async fn collect_all(mut self) -> Vec<Result<T, ReadError>>
    where
        T: DeserializeOwned,
    {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}
