//! Process-level plumbing: detaching from the terminal and the PID file.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Writes the current process id to a file and removes it on drop.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create (or truncate) `path` and write this process's id to it.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error with code `PidFile` if the file cannot be
    /// created or written.
    pub fn create(path: &Path) -> Result<Self> {
        use crate::error::ErrorCode;

        let pid = std::process::id();
        let mut file = std::fs::File::create(path).map_err(|e| {
            Error::io_with_code(
                ErrorCode::PidFile,
                format!("Failed to create PID file at {}", path.display()),
                e,
            )
        })?;
        writeln!(file, "{pid}").map_err(|e| {
            Error::io_with_code(
                ErrorCode::PidFile,
                format!("Failed to write PID file at {}", path.display()),
                e,
            )
        })?;

        debug!(pid, path = %path.display(), "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the PID file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

/// Detach from the controlling terminal.
///
/// Forks once; the parent exits with status 0 and the child continues in a
/// new session with `/` as working directory and stdin, stdout and stderr
/// redirected to `/dev/null`. Must be called while the process is still
/// single-threaded, before any async runtime is built. Sockets and files
/// opened earlier stay open in the child.
///
/// # Errors
///
/// Returns a `Runtime` error with code `DaemonizeFailed` if any step fails.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn daemonize() -> Result<()> {
    use crate::error::ErrorCode;
    use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
    use std::os::unix::io::AsRawFd;

    let failed = |step: &str, e: nix::Error| {
        Error::runtime_with_source(
            ErrorCode::DaemonizeFailed,
            format!("Failed to daemonize: {step}"),
            e,
        )
    };

    // SAFETY: no other threads exist yet, so the child inherits a consistent
    // address space.
    match unsafe { fork() }.map_err(|e| failed("fork", e))? {
        ForkResult::Parent { child } => {
            debug!(child = child.as_raw(), "Forked daemon process, parent exiting");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    setsid().map_err(|e| failed("setsid", e))?;
    chdir("/").map_err(|e| failed("chdir", e))?;

    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| {
            Error::runtime_with_source(
                ErrorCode::DaemonizeFailed,
                "Failed to daemonize: open /dev/null",
                e,
            )
        })?;
    for fd in 0..=2 {
        dup2(dev_null.as_raw_fd(), fd).map_err(|e| failed("redirect stdio", e))?;
    }

    Ok(())
}

/// Detaching is only supported on Unix.
///
/// # Errors
///
/// Always returns a `Runtime` error with code `DaemonizeFailed`.
#[cfg(not(unix))]
pub fn daemonize() -> Result<()> {
    Err(Error::runtime_with_source(
        crate::error::ErrorCode::DaemonizeFailed,
        "Daemon mode is not supported on this platform",
        std::io::Error::from(std::io::ErrorKind::Unsupported),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let path = dir.path().join("aesdsocket.pid");

        {
            let guard = PidFileGuard::create(&path).unwrap();
            assert_eq!(guard.path(), path);
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_in_missing_directory() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let err = PidFileGuard::create(&dir.path().join("nope").join("x.pid")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PidFile);
    }
}
