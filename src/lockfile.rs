//! Advisory lock-file registry (C4).
//!
//! For each mounted name the registry keeps an open fd at
//! `<lock_dir>/<name>.lock` holding a POSIX shared read lock over the
//! whole file, with the daemon's PID written into it once. External
//! programs that want to know whether a name is "in use" take their own
//! shared lock on the same file and look for exclusive-lock failure.
//!
//! `remove` only unlinks the file after it wins an exclusive lock on it —
//! that is the only way to be sure no other shared-lock holder is still
//! relying on the inode.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

const MAX_DEAD_INODE_RETRIES: u32 = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_secs(3);

struct Entry {
    path: PathBuf,
    file: File,
}

/// Registry of lock files backing mounted names. A no-op registry (every
/// call a silent success) is used when `--use-locks` was not given.
pub struct LockfileRegistry {
    enabled: bool,
    lock_dir: PathBuf,
    pid_line: Vec<u8>,
    table: Mutex<HashMap<Vec<u8>, Entry>>,
    stop: std::sync::atomic::AtomicBool,
}

impl LockfileRegistry {
    /// `lock_dir` is created (including parents) if it does not exist.
    /// When `enabled` is false every operation is a no-op, matching the
    /// original's `if (!lockfiles) return;` early-out on every entry
    /// point.
    pub fn new(enabled: bool, lock_dir: PathBuf, pid: u32) -> io::Result<Self> {
        if enabled {
            fs::create_dir_all(&lock_dir)?;
        }
        Ok(Self {
            enabled,
            lock_dir,
            pid_line: format!("{} \n", pid).into_bytes(),
            table: Mutex::new(HashMap::new()),
            stop: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn stop_set(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    fn stopping(&self) -> bool {
        self.stop.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn path_for(&self, name: &[u8]) -> PathBuf {
        let mut p = self.lock_dir.clone();
        p.push(format!("{}.lock", String::from_utf8_lossy(name)));
        p
    }

    /// Create (or recognize an already-locked) lock file for `name`.
    /// Returns `Ok(true)` if a fresh lock was created, `Ok(false)` if one
    /// already existed for this name (treated as success — matches
    /// `lockfile_add2hash`'s `exist` path), and `Err` on failure.
    pub fn create(&self, name: &[u8]) -> io::Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty name"));
        }

        {
            let table = self.table.lock();
            if table.contains_key(name) {
                return Ok(false);
            }
        }

        let path = self.path_for(name);

        for _ in 0..MAX_DEAD_INODE_RETRIES {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o644)
                .open(&path)?;
            set_cloexec(&file);

            shared_lock(&file, &path, || self.stopping())?;

            let meta = file.metadata()?;
            if meta.nlink() != 0 {
                let mut out = file;
                out.write_all(&self.pid_line)?;
                self.table.lock().insert(
                    name.to_vec(),
                    Entry {
                        path,
                        file: out,
                    },
                );
                return Ok(true);
            }
            // Dead inode left behind by a racing unlink: retry from open.
        }

        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("giving up on dead lock file {}", path.display()),
        ))
    }

    /// Remove the lock file for `name`, unlinking it only if we win the
    /// exclusive upgrade (i.e. no other shared-lock holder remains).
    pub fn remove(&self, name: &[u8]) {
        if !self.enabled {
            return;
        }
        let entry = { self.table.lock().remove(name) };
        let Some(entry) = entry else {
            log::warn!(
                "lockfile remove: no entry for {}",
                String::from_utf8_lossy(name)
            );
            return;
        };
        if exclusive_lock(&entry.file, &entry.path) {
            if let Err(e) = fs::remove_file(&entry.path) {
                log::error!("unlink {}: {}", entry.path.display(), e);
            }
        }
    }

    /// Drain all live entries at shutdown, same unlink-iff-exclusive
    /// discipline as [`Self::remove`].
    pub fn drain(&self) {
        if !self.enabled {
            return;
        }
        let entries: Vec<Entry> = {
            let mut table = self.table.lock();
            table.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            if exclusive_lock(&entry.file, &entry.path) {
                let _ = fs::remove_file(&entry.path);
            }
        }
    }
}

fn set_cloexec(file: &File) {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    if let Err(e) = fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        log::warn!("fcntl FD_CLOEXEC: {}", e);
    }
}

fn exclusive_lock(file: &File, path: &Path) -> bool {
    use nix::fcntl::{fcntl, FcntlArg, FlockArg};
    let _ = path;
    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&make_flock(libc::F_WRLCK))) {
        Ok(_) => true,
        Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => false,
        Err(e) => {
            log::error!("fcntl F_SETLK (exclusive) {}: {}", path.display(), e);
            false
        }
    }
}

fn shared_lock(file: &File, path: &Path, should_stop: impl Fn() -> bool) -> io::Result<()> {
    let mut warned = false;
    loop {
        match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&make_flock(libc::F_RDLCK))) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => {
                if !warned {
                    log::info!("waiting for lock file: {}", path.display());
                    warned = true;
                }
                if should_stop() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "shutting down"));
                }
                thread::sleep(LOCK_RETRY_SLEEP);
                continue;
            }
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

fn make_flock(kind: i32) -> libc::flock {
    libc::flock {
        l_type: kind as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_registry_is_always_a_success_noop() {
        let reg = LockfileRegistry::new(false, PathBuf::from("/nonexistent"), 1).unwrap();
        assert!(reg.create(b"a").unwrap());
        reg.remove(b"a");
    }

    #[test]
    fn create_then_remove_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LockfileRegistry::new(true, dir.path().to_path_buf(), 4242).unwrap();
        assert!(reg.create(b"a").unwrap());
        let path = dir.path().join("a.lock");
        assert!(path.exists());
        reg.remove(b"a");
        assert!(!path.exists());
    }

    #[test]
    fn second_create_for_live_name_reports_existing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LockfileRegistry::new(true, dir.path().to_path_buf(), 1).unwrap();
        assert!(reg.create(b"a").unwrap());
        assert!(!reg.create(b"a").unwrap());
    }
}
