//! Process-level lock so only one daemon serves a database.
//!
//! `agentmon-daemon.lock` is an advisory OS file lock (flock) held for the
//! daemon's lifetime. The lock file name is scoped to the database path, so
//! daemons pointed at different databases do not contend.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const DAEMON_LOCK_FILE: &str = "agentmon-daemon.lock";

/// Held by the daemon process until exit
pub struct DaemonGuard {
    _lock: ProcessLock,
}

/// Acquire the daemon lock for `db_path`, failing if another daemon holds it
pub fn acquire_daemon_guard(db_path: &Path) -> Result<DaemonGuard> {
    match try_acquire_lock(DAEMON_LOCK_FILE, db_path)? {
        Some(lock) => Ok(DaemonGuard { _lock: lock }),
        None => anyhow::bail!(
            "another agentmon daemon is already running for {}",
            db_path.display()
        ),
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("agentmon");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("agentmon requires Unix (macOS/Linux) for its socket and process lock");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_guard_is_refused_until_first_drops() {
        let db_path = PathBuf::from(format!(
            "/tmp/agentmon-lock-test-{}/agentmon.db",
            std::process::id()
        ));

        let first = acquire_daemon_guard(&db_path).unwrap();
        let err = acquire_daemon_guard(&db_path).err().unwrap();
        assert!(err.to_string().contains("already running"));

        drop(first);
        assert!(acquire_daemon_guard(&db_path).is_ok());
    }

    #[test]
    fn test_lock_names_are_scoped_to_database() {
        let a = scoped_lock_filename(DAEMON_LOCK_FILE, Path::new("/a/agentmon.db"));
        let b = scoped_lock_filename(DAEMON_LOCK_FILE, Path::new("/b/agentmon.db"));
        assert_ne!(a, b);
        assert!(a.starts_with(DAEMON_LOCK_FILE));
    }
}
