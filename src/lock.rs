use std::{
    fs::{File, OpenOptions, TryLockError},
    io::Write,
    path::Path,
    time::{Duration, Instant},
};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ACQUIRE_GRACE: Duration = Duration::from_millis(200);

/// Exclusive writer lock on one collection.
///
/// Held as an OS advisory lock on the collection's lockfile, so the kernel
/// drops it when the holder exits, including on a crash or SIGKILL. The
/// file stays in place between holders and records the last holder's pid
/// for diagnostics only.
#[derive(Debug)]
pub struct CollectionLock {
    _file: File,
    collection: String,
}

impl CollectionLock {
    pub fn acquire(path: &Path, collection: &str) -> Result<Self> {
        let mut file = open_lockfile(path)?;
        // Waiters take short-lived shared locks; ride those out.
        let deadline = Instant::now() + ACQUIRE_GRACE;
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(ACQUIRE_GRACE / 10);
                }
                Err(TryLockError::WouldBlock) => {
                    return Err(Error::CollectionLocked {
                        collection: collection.to_string(),
                    });
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        tracing::debug!(collection, path = %path.display(), "acquired lock");
        Ok(Self {
            _file: file,
            collection: collection.to_string(),
        })
    }

    /// Block until nobody holds the lock at `path`, for at most `timeout`.
    ///
    /// Checks with a shared lock, so concurrent waiters do not exclude each
    /// other.
    pub fn wait_until_free(
        path: &Path,
        collection: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let file = open_lockfile(path)?;
        let mut logged = false;

        loop {
            match file.try_lock_shared() {
                // Dropping the file releases the shared lock.
                Ok(()) => return Ok(()),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(Error::CollectionLocked {
                    collection: collection.to_string(),
                });
            }
            if !logged {
                tracing::info!(collection, "waiting for running build");
                logged = true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

fn open_lockfile(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}
