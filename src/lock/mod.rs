use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use log::{debug, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::{Result, SyncError};

// ERROR_LOCK_VIOLATION on Windows.
const WINDOWS_LOCK_VIOLATION: i32 = 33;
const ACQUIRE_ATTEMPTS: usize = 3;

/// Single-instance guard for one lockfile path.
///
/// The OS advisory lock is held for the life of the guard, so a crashed
/// holder never blocks a restart. The file also carries the holder's PID so
/// the contender can report who is running. Dropping the guard removes the
/// file; removing an already absent file is not an error.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
    released: bool,
}

impl LockGuard {
    /// Take the lock or report the live holder as `AlreadyRunning`.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        for _ in 0..ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The previous holder may have unlinked the path between our
                    // open and our lock; a lock on an orphaned inode guards nothing.
                    if !same_file(&file, path) {
                        debug!("lock: {} was replaced while locking, retrying", path.display());
                        continue;
                    }
                    return Self::claim(path, file, true);
                }
                Err(err) if is_contended(&err) => {
                    let pid = read_pid(path).unwrap_or(0);
                    info!("lock: {} is held by pid {pid}", path.display());
                    return Err(SyncError::AlreadyRunning { pid });
                }
                Err(err) => {
                    warn!(
                        "lock: advisory locking unavailable on {} ({err}); using pid liveness",
                        path.display()
                    );
                    return Self::acquire_by_pid(path, file);
                }
            }
        }
        Err(SyncError::Io(io::Error::other(format!(
            "lockfile {} keeps changing under us",
            path.display()
        ))))
    }

    /// The PID-in-file contract alone, for filesystems without locking.
    fn acquire_by_pid(path: &Path, file: File) -> Result<Self> {
        if let Some(pid) = read_pid(path)
            && pid != std::process::id()
            && pid_alive(pid)
        {
            return Err(SyncError::AlreadyRunning { pid });
        }
        Self::claim(path, file, false)
    }

    fn claim(path: &Path, mut file: File, locked: bool) -> Result<Self> {
        if let Some(previous) = read_pid(path) {
            debug!("lock: clearing stale record of pid {previous}");
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        info!(
            "lock: acquired {} (pid {}, advisory={locked})",
            path.display(),
            std::process::id()
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lockfile and drop the OS lock. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("lock: released {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("lock: failed to remove {} ({err})", self.path.display()),
        }
        // Closing the handle releases the advisory lock.
        self.file = None;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(WINDOWS_LOCK_VIOLATION)
}

/// PID recorded in a lockfile, if it holds one.
pub fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

pub fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// Holder of a lockfile as seen from outside, for diagnostics.
pub fn holder(path: &Path) -> Option<(u32, bool)> {
    let pid = read_pid(path)?;
    Some((pid, pid_alive(pid)))
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    // Open files cannot be unlinked on Windows.
    path.exists()
}
