use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::common::DaemonError;

/// Single-instance guard: an exclusive `flock` held for the daemon's lifetime.
pub struct LockFile {
    _file: File,
}

impl LockFile {
    pub fn acquire(lock_path: &Path) -> Result<Self, DaemonError> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| DaemonError::LockFailed {
                operation: format!("open {}", lock_path.display()),
                source: e,
            })?;

        let fd = lock_file.as_raw_fd();

        // SAFETY: `fd` is valid for the lifetime of `lock_file`, which this guard owns.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    Err(DaemonError::AlreadyRunning)
                }
                _ => Err(DaemonError::LockFailed {
                    operation: "flock lock file".to_string(),
                    source: err,
                }),
            };
        }

        lock_file.set_len(0).map_err(|e| DaemonError::LockFailed {
            operation: "truncate lock file".to_string(),
            source: e,
        })?;

        let mut lock_file = lock_file;
        writeln!(lock_file, "{}", std::process::id()).map_err(|e| DaemonError::LockFailed {
            operation: "write PID".to_string(),
            source: e,
        })?;

        Ok(Self { _file: lock_file })
    }
}

pub fn remove_lock_file(lock_path: &Path) {
    if lock_path.exists() {
        let _ = std::fs::remove_file(lock_path);
    }
}
