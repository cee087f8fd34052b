//! Advisory per-period write lock.
//!
//! Writers from independent processes serialize on an exclusive `flock`
//! of a sentinel file in the period directory. The lock is taken
//! non-blocking and retried on an interval until a deadline, so a stuck
//! peer surfaces as a timeout instead of an indefinite hang. The holder's
//! PID is written into the sentinel for debugging.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::store::error::{StoreError, StoreResult};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Held exclusive lock on a period. The OS releases the lock when the
/// file handle is dropped; the sentinel file itself is left in place to
/// avoid unlink races with other lockers.
#[derive(Debug)]
pub struct PeriodLock {
    _file: File,
}

impl PeriodLock {
    /// Acquire the lock at `path`, waiting up to `timeout` in `poll`
    /// increments.
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> StoreResult<Self> {
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match try_flock(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(format!(
                            "{} still held after {:?}",
                            path.display(),
                            timeout
                        )));
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(e.into()),
            }
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn try_flock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> io::Result<()> {
    Ok(())
}
