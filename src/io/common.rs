use super::{ReadError, WriteError};
use serde::Serialize;
use std::time::{Duration, Instant};

pub(crate) const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Why a file lock could not be taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LockFailure {
    Held,
    TimedOut(Duration),
}

impl From<LockFailure> for WriteError {
    fn from(failure: LockFailure) -> Self {
        match failure {
            LockFailure::Held => WriteError::AlreadyLocked,
            LockFailure::TimedOut(timeout) => WriteError::LockTimeout(timeout),
        }
    }
}

impl From<LockFailure> for ReadError {
    fn from(failure: LockFailure) -> Self {
        match failure {
            LockFailure::Held => ReadError::AlreadyLocked,
            LockFailure::TimedOut(timeout) => ReadError::LockTimeout(timeout),
        }
    }
}

/// Deadline bookkeeping shared by the blocking and async lock loops.
pub(crate) struct LockDeadline {
    start: Instant,
    timeout: Duration,
}

impl LockDeadline {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Called after a failed attempt. `Ok` means wait and try again.
    pub(crate) fn check(&self) -> Result<(), LockFailure> {
        if self.timeout.is_zero() {
            Err(LockFailure::Held)
        } else if self.start.elapsed() >= self.timeout {
            Err(LockFailure::TimedOut(self.timeout))
        } else {
            Ok(())
        }
    }
}

/// Retry `try_lock` every [`LOCK_RETRY_INTERVAL`] until it succeeds or
/// `timeout` runs out. A zero timeout makes a single attempt.
pub(crate) fn lock_with_timeout(
    timeout: Duration,
    mut try_lock: impl FnMut() -> std::io::Result<()>,
) -> Result<(), LockFailure> {
    let deadline = LockDeadline::new(timeout);
    loop {
        if try_lock().is_ok() {
            return Ok(());
        }
        deadline.check()?;
        std::thread::sleep(LOCK_RETRY_INTERVAL);
    }
}

/// Serialize a batch of items to a buffer.
///
/// All items are serialized as newline-delimited JSON. Newlines within
/// string values are automatically escaped by serde_json.
pub(crate) fn serialize_batch<T: Serialize>(items: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();

    for item in items {
        serde_json::to_writer(&mut buffer, item)?;
        buffer.push(b'\n');
    }

    Ok(buffer)
}
