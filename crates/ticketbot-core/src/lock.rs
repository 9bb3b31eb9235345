//! Exclusive tick lease over an advisory file lock.
//!
//! Two processes pointed at the same bucket would both read the same previous
//! log and notify twice. Sharing a lease file keeps their ticks apart. The
//! holder writes its pid into the file so a contender can name it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::ErrorCode;

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: lease {} still held after {waited:?} (holder: {})", ErrorCode::LeaseContention, .path.display(), .holder.as_deref().unwrap_or("unknown"))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<String>,
    },

    #[error("{}: lease file {}: {source}", ErrorCode::StorageWrite, .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LeaseContention,
            Self::Io { .. } => ErrorCode::StorageWrite,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Held for the length of one tick; released on drop.
#[derive(Debug)]
pub struct TickLease {
    file: File,
    path: PathBuf,
}

impl TickLease {
    /// Take the lease at `path`, polling until `timeout` runs out.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let started = Instant::now();
        while file.try_lock_exclusive().is_err() {
            if started.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                    holder: read_holder(&mut file),
                });
            }
            thread::sleep(POLL);
        }

        write_holder(&mut file).map_err(io_err)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TickLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "pid={}", std::process::id())?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut holder = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut holder).ok()?;
    let holder = holder.trim();
    (!holder.is_empty()).then(|| holder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lease_can_be_taken_again_after_release() -> Result<(), LockError> {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("run").join("tick.lock");
        let lease = TickLease::acquire(&path, Duration::from_millis(50))?;
        assert_eq!(lease.path(), path.as_path());
        lease.release();
        let again = TickLease::acquire(&path, Duration::from_millis(50))?;
        drop(again);
        Ok(())
    }

    #[test]
    fn contender_times_out_and_names_the_holder() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("tick.lock");
        let _held = TickLease::acquire(&path, Duration::from_millis(50)).expect("first lease");
        let err = TickLease::acquire(&path, Duration::from_millis(20)).unwrap_err();

        assert!(matches!(err, LockError::Timeout { path: ref p, .. } if *p == path));
        assert_eq!(err.code(), ErrorCode::LeaseContention);
        assert!(err.hint().is_some());
        let expected = format!("pid={}", std::process::id());
        assert!(err.to_string().contains(&expected), "{err}");
    }
}
