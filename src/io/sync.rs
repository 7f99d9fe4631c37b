// starload/src/io/sync.rs

use super::{common, ReadError, WriteError};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

/// Appends newline-delimited JSON to a file.
///
/// Each [`write_batch`](Self::write_batch) either lands completely or leaves
/// the file at its previous length. If a failed append cannot be cut back
/// off, the writer refuses every later batch with [`WriteError::Poisoned`].
pub struct StreamWriter {
    file: File,
    lock_timeout: Duration,
    poisoned: bool,
    #[cfg(test)]
    fault: Option<WriteFault>,
}

/// Failure injected into the next append.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteFault {
    /// Bytes of the batch that reach the file before the write fails.
    pub written: usize,
    pub truncate_fails: bool,
}

impl StreamWriter {
    /// Open a stream file for appending.
    ///
    /// The lock is acquired only during write operations, not continuously.
    /// This allows readers to access the file between writes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WriteError> {
        Self::open_with_timeout(path, Duration::from_secs(0))
    }

    /// Open with a timeout for acquiring the lock during writes.
    pub fn open_with_timeout(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self, WriteError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            lock_timeout: timeout,
            poisoned: false,
            #[cfg(test)]
            fault: None,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Write a batch of items atomically.
    ///
    /// Items are serialized to memory first, so a serialization failure
    /// writes nothing. The buffer is then appended and fsynced under an
    /// exclusive lock. On an I/O failure the file is truncated back to its
    /// length before the append.
    pub fn write_batch<T: Serialize>(&mut self, items: &[T]) -> Result<(), WriteError> {
        if self.poisoned {
            return Err(WriteError::Poisoned);
        }
        let buffer = common::serialize_batch(items)?;

        let file = &self.file;
        common::lock_with_timeout(self.lock_timeout, || FileExt::try_lock_exclusive(file))?;

        let result = self.append(&buffer);

        // Always release lock, even on error
        let _ = FileExt::unlock(&self.file);

        result
    }

    fn append(&mut self, buffer: &[u8]) -> Result<(), WriteError> {
        let len = self.file.metadata()?.len();

        let err = match self.write_synced(buffer) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if let Err(truncate_err) = self.truncate(len) {
            tracing::error!(
                error = %truncate_err,
                length = len,
                "could not remove partial append, refusing further writes"
            );
            self.poisoned = true;
        }
        Err(err.into())
    }

    fn write_synced(&mut self, buffer: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if let Some(fault) = self.fault {
                let written = fault.written.min(buffer.len());
                self.file.write_all(&buffer[..written])?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                ));
            }
        }

        self.file.write_all(buffer)?;
        self.file.sync_all()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if let Some(WriteFault {
                truncate_fails: true,
                ..
            }) = self.fault.take()
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected truncate failure",
                ));
            }
        }

        self.file.set_len(len)?;
        self.file.sync_all()
    }

    /// Make the next append fail as described by `fault`.
    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: WriteFault) {
        self.fault = Some(fault);
    }
}

/// Reads newline-delimited JSON under a shared lock.
///
/// A line that fails to decode yields one `Err` item; iteration continues
/// with the next line.
pub struct StreamReader<T> {
    reader: BufReader<File>,
    line: usize,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> StreamReader<T> {
    /// Open a stream file for reading.
    ///
    /// Acquires a shared lock immediately or fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        Self::open_with_timeout(path, Duration::from_secs(0))
    }

    /// Open with a timeout for acquiring the lock.
    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, ReadError> {
        let file = OpenOptions::new().read(true).open(path)?;
        common::lock_with_timeout(timeout, || FileExt::try_lock_shared(&file))?;

        Ok(Self {
            reader: BufReader::new(file),
            line: 0,
            _phantom: std::marker::PhantomData,
        })
    }

    /// 1-based number of the line most recently read.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<T: DeserializeOwned> Iterator for StreamReader<T> {
    type Item = Result<T, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();

        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None, // EOF
                Ok(_) => {
                    self.line += 1;
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue; // Skip empty lines
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
}
