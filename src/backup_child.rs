//! Backup child process registry (C7).
//!
//! Tracks at most one live backup process per canonical name and exposes
//! `start`/`kill`/`wait`/`count`. A background supervisor thread polls
//! every 2 seconds for children that exited or overran `backup_life`.
//!
//! The original keeps entries in both a name hash and a pair of
//! "generation tables" so the supervisor can scan without holding the
//! hash lock across `waitpid`. In Rust the same property falls out of
//! `Arc<ChildEntry>` plus a per-entry mutex: the supervisor clones the
//! table's `Arc`s under the table lock, then releases it before doing any
//! blocking work per entry — no second index structure is needed to get
//! the same lock-free-scan guarantee.
//!
//! Race discipline, preserved from the original: whichever caller
//! successfully takes `pid` out of an entry is the one that reaps or
//! kills it and removes the entry; every other concurrent caller for the
//! same name blocks on that entry's condition until the claimant finishes
//! and marks it done, then returns having done no work of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use parking_lot::{Condvar, Mutex};

use crate::backup_argv::BackupArgv;
use crate::clock::MonotonicClock;

struct Inner {
    pid: Option<Pid>,
    kill_requested: bool,
    done: bool,
}

struct ChildEntry {
    name: Vec<u8>,
    started_at: u64,
    state: Mutex<Inner>,
    cond: Condvar,
}

pub struct BackupChildRegistry {
    table: Mutex<HashMap<Vec<u8>, Arc<ChildEntry>>>,
    stop: AtomicBool,
    backup_life: Option<u64>,
    clock: Arc<MonotonicClock>,
    argv: Option<BackupArgv>,
    nice: Option<i32>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

const SUPERVISOR_POLL: Duration = Duration::from_secs(2);

impl BackupChildRegistry {
    /// `nice`, if given, is the `-20..20` priority `--priority` mapped to;
    /// every backup child calls `setpriority(PRIO_PROCESS, 0, nice)` on
    /// itself right before `execvp`, matching the original's
    /// `backup_exec()`.
    pub fn new(
        argv: Option<BackupArgv>,
        backup_life: Option<u64>,
        nice: Option<i32>,
        clock: Arc<MonotonicClock>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            backup_life,
            clock,
            argv,
            nice,
            supervisor: Mutex::new(None),
        });
        let handle = {
            let registry = registry.clone();
            thread::Builder::new()
                .name("autofsd-backup-sup".to_string())
                .spawn(move || registry.supervisor_loop())
                .expect("spawn backup supervisor thread")
        };
        *registry.supervisor.lock() = Some(handle);
        registry
    }

    pub fn stop_set(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Fork+exec a backup child for `name`/`real_path`. A no-op if no
    /// `-b` backup program was configured.
    pub fn start(&self, name: &[u8], real_path: &str) {
        let Some(argv) = &self.argv else { return };

        let name_str = String::from_utf8_lossy(name).into_owned();
        let argv = match argv.expand(&name_str, real_path) {
            Ok(a) => a,
            Err(e) => {
                log::error!("backup argv expansion for {}: {}", name_str, e);
                return;
            }
        };
        if argv.is_empty() {
            return;
        }

        // SAFETY: the child only calls async-signal-safe functions
        // (setpriority, execvp, _exit) before replacing its image or
        // exiting.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.insert(name, child);
            }
            Ok(ForkResult::Child) => {
                if let Some(nice) = self.nice {
                    // SAFETY: async-signal-safe, no allocation.
                    unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
                }
                let _ = execvp(&argv[0], &argv);
                unsafe { libc::_exit(127) };
            }
            Err(e) => {
                log::error!("fork for backup of {}: {}", name_str, e);
            }
        }
    }

    fn insert(&self, name: &[u8], pid: Pid) {
        let entry = Arc::new(ChildEntry {
            name: name.to_vec(),
            started_at: self.clock.now(),
            state: Mutex::new(Inner {
                pid: Some(pid),
                kill_requested: false,
                done: false,
            }),
            cond: Condvar::new(),
        });
        let mut table = self.table.lock();
        if table.contains_key(name) {
            log::error!(
                "backup_child: entry already exists for {}",
                String::from_utf8_lossy(name)
            );
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return;
        }
        table.insert(name.to_vec(), entry);
    }

    /// Claim the pid held for `name` if we're the first caller, else
    /// block until whoever is handling it finishes. Returns the claimed
    /// pid (caller now owns reaping/killing it) or `None` if there was
    /// nothing to do.
    fn claim(entry: &Arc<ChildEntry>, mark_kill: bool) -> Option<Pid> {
        let mut state = entry.state.lock();
        if let Some(pid) = state.pid.take() {
            return Some(pid);
        }
        if mark_kill {
            state.kill_requested = true;
        }
        while !state.done {
            entry.cond.wait(&mut state);
        }
        None
    }

    fn finish(&self, entry: &Arc<ChildEntry>) {
        self.table.lock().remove(&entry.name);
        let mut state = entry.state.lock();
        state.done = true;
        entry.cond.notify_all();
    }

    /// Kill the backup child for `name`, if any, with escalating
    /// SIGTERM/SIGKILL.
    pub fn kill(&self, name: &[u8]) {
        let Some(entry) = self.table.lock().get(name).cloned() else {
            return;
        };
        if let Some(pid) = Self::claim(&entry, true) {
            kill_escalating(pid, &entry.name);
            self.finish(&entry);
        }
    }

    /// Wait for the backup child for `name` to exit, killing it if it
    /// does not reap promptly.
    pub fn wait(&self, name: &[u8]) {
        let Some(entry) = self.table.lock().get(name).cloned() else {
            return;
        };
        let Some(pid) = Self::claim(&entry, false) else {
            return;
        };
        if reaped_nonblocking(pid) {
            self.finish(&entry);
            return;
        }
        // Give the supervisor a chance, unless a concurrent kill beat us
        // to the punch while we were checking.
        let should_kill = {
            let mut state = entry.state.lock();
            if state.kill_requested {
                true
            } else {
                state.pid = Some(pid);
                while !state.done {
                    entry.cond.wait(&mut state);
                }
                false
            }
        };
        if should_kill {
            kill_escalating(pid, &entry.name);
            self.finish(&entry);
        }
    }

    /// Live backup child count, or `-1` if the table is momentarily
    /// contended (matching the original's `trylock`-and-bail behavior).
    pub fn count(&self) -> i64 {
        match self.table.try_lock() {
            Some(table) => table.len() as i64,
            None => -1,
        }
    }

    fn supervisor_loop(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let entries: Vec<Arc<ChildEntry>> = self.table.lock().values().cloned().collect();
            if entries.is_empty() {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(SUPERVISOR_POLL);
                continue;
            }

            let now = self.clock.now();
            for entry in &entries {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                let Some(mut state) = entry.state.try_lock() else {
                    continue;
                };
                let Some(pid) = state.pid.take() else {
                    continue;
                };
                drop(state);

                if let Some(life) = self.backup_life {
                    if life > 0 && now.saturating_sub(entry.started_at) > life {
                        log::info!("backup timed out for {}", String::from_utf8_lossy(&entry.name));
                        kill_escalating(pid, &entry.name);
                        self.finish(entry);
                        continue;
                    }
                }

                if reaped_nonblocking(pid) {
                    self.finish(entry);
                    continue;
                }

                let mut state = entry.state.lock();
                if state.kill_requested {
                    drop(state);
                    kill_escalating(pid, &entry.name);
                    self.finish(entry);
                } else {
                    state.pid = Some(pid);
                }
            }

            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(SUPERVISOR_POLL);
        }
    }

    /// Join the supervisor, then signal every live child with SIGTERM,
    /// wait a second, and SIGKILL anything still running.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
        let entries: Vec<Arc<ChildEntry>> = self.table.lock().values().cloned().collect();
        for entry in &entries {
            let state = entry.state.lock();
            if let Some(pid) = state.pid {
                let _ = kill(pid, Signal::SIGTERM);
            }
        }
        thread::sleep(Duration::from_secs(1));
        for entry in &entries {
            let mut state = entry.state.lock();
            if let Some(pid) = state.pid.take() {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                state.done = true;
                entry.cond.notify_all();
            }
        }
    }
}

fn reaped_nonblocking(pid: Pid) -> bool {
    matches!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)))
}

fn kill_escalating(pid: Pid, name: &[u8]) {
    let name = String::from_utf8_lossy(name);
    if kill(pid, Signal::SIGTERM).is_err() {
        return;
    }
    for _ in 0..3 {
        thread::sleep(Duration::from_secs(1));
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                log::warn!("backup child {} for {} did not exit on SIGTERM, sending SIGKILL", pid, name);
                let _ = kill(pid, Signal::SIGKILL);
            }
            _ => return,
        }
    }
    let _ = waitpid(pid, None);
}
