//! Deferred-start backup queue (C8).
//!
//! On unmount the dispatcher calls [`BackupQueue::enqueue`]. A single
//! watcher thread periodically pulls due entries off the head of a
//! time-ordered list (up to `BACK_START_MAX` per round, capped by spare
//! process slots) into a "launch batch", forks each one through the
//! backup child registry with a 100 ms pacing sleep between forks, and
//! finally removes the whole batch and wakes anyone waiting on it.
//!
//! [`BackupQueue::dequeue_or_wait`] is how the missing handler cancels a
//! pending backup for a name that is about to be remounted: if the entry
//! is still queued it is removed outright; if it has already been
//! promoted into a launch batch, the caller waits for that batch to
//! finish rather than racing the fork (see the open-question resolution
//! in `DESIGN.md` — cancellation during an active batch is not
//! supported, only waiting is).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::backup_child::BackupChildRegistry;
use crate::clock::MonotonicClock;

const BACK_START_MAX: usize = 300;
const FORK_PACING: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct QueueEntry {
    name: Vec<u8>,
    real_path: String,
    enqueue_time: u64,
    in_launch_batch: bool,
}

struct State {
    order: VecDeque<Arc<Mutex<QueueEntry>>>,
    by_name: HashMap<Vec<u8>, Arc<Mutex<QueueEntry>>>,
}

pub struct BackupQueue {
    state: Mutex<State>,
    batch_done: Condvar,
    wait_before: u64,
    max_proc: i64,
    stop: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
    children: Arc<BackupChildRegistry>,
    clock: Arc<MonotonicClock>,
}

impl BackupQueue {
    pub fn new(wait_before: u64, max_proc: i64, children: Arc<BackupChildRegistry>, clock: Arc<MonotonicClock>) -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                by_name: HashMap::new(),
            }),
            batch_done: Condvar::new(),
            wait_before,
            max_proc,
            stop: AtomicBool::new(false),
            watcher: Mutex::new(None),
            children,
            clock,
        });
        let handle = {
            let queue = queue.clone();
            thread::Builder::new()
                .name("autofsd-backup-watch".to_string())
                .spawn(move || queue.watch_loop())
                .expect("spawn backup queue watcher thread")
        };
        *queue.watcher.lock() = Some(handle);
        queue
    }

    pub fn stop_set(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Enqueue a backup for `name`/`real_path`. A no-op if already queued
    /// or the queue has been stopped.
    pub fn enqueue(&self, name: &[u8], real_path: &str) {
        if self.stopping() {
            return;
        }
        let mut state = self.state.lock();
        if state.by_name.contains_key(name) {
            return;
        }
        let entry = Arc::new(Mutex::new(QueueEntry {
            name: name.to_vec(),
            real_path: real_path.to_string(),
            enqueue_time: self.clock.now(),
            in_launch_batch: false,
        }));
        state.order.push_back(entry.clone());
        state.by_name.insert(name.to_vec(), entry);
    }

    /// Cancel a pending backup for `name`. If the entry is still queued,
    /// it is removed and `true` is returned. If it has already been
    /// promoted into a launch batch, this blocks until that batch
    /// finishes and returns `false` without cancelling anything — the
    /// fork already happened or is unavoidably about to.
    pub fn dequeue_or_wait(&self, name: &[u8]) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.by_name.get(name).cloned() else {
            return false;
        };
        let in_batch = entry.lock().in_launch_batch;
        if in_batch {
            self.batch_done.wait(&mut state);
            return false;
        }
        state.by_name.remove(name);
        state.order.retain(|e| !Arc::ptr_eq(e, &entry));
        true
    }

    fn watch_loop(&self) {
        loop {
            if self.stopping() {
                return;
            }

            let due = {
                let state = self.state.lock();
                state.order.front().map(|head| {
                    let head = head.lock();
                    self.clock.now().saturating_sub(head.enqueue_time)
                })
            };

            let ready = match due {
                None => false,
                Some(age) => age >= self.wait_before,
            };
            if !ready {
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let child_count = self.children.count();
            if child_count < 0 {
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let batch = self.form_batch(child_count);
            if batch.is_empty() {
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            for entry in &batch {
                let (name, path) = {
                    let e = entry.lock();
                    (e.name.clone(), e.real_path.clone())
                };
                self.children.start(&name, &path);
                thread::sleep(FORK_PACING);
            }

            {
                let mut state = self.state.lock();
                for entry in &batch {
                    let name = entry.lock().name.clone();
                    state.by_name.remove(&name);
                }
            }
            self.batch_done.notify_all();
        }
    }

    fn form_batch(&self, child_count: i64) -> Vec<Arc<Mutex<QueueEntry>>> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let mut batch = Vec::new();

        while batch.len() < BACK_START_MAX && (child_count + batch.len() as i64) <= self.max_proc {
            let due = match state.order.front() {
                None => false,
                Some(head) => now.saturating_sub(head.lock().enqueue_time) >= self.wait_before,
            };
            if !due {
                break;
            }
            let entry = state.order.pop_front().unwrap();
            entry.lock().in_launch_batch = true;
            batch.push(entry);
        }
        batch
    }

    /// Join the watcher thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}
