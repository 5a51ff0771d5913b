//! Expire driver (C10).
//!
//! A main thread issues `EXPIRE_MULTI` ioctls back to back, up to
//! `EXPIRE_MAX` per cycle, while the kernel keeps reporting expired
//! mounts. When a cycle hits that cap there is probably more work than
//! one thread can drain promptly, so a round-robin "burst" thread is
//! started (up to `EXPIRE_MAX_THREADS` concurrently) to help drain the
//! backlog; each burst thread runs up to 100 rounds and retires itself
//! once its `life` counter — reset to `DEFAULT_LIFE` whenever a round
//! expires at least one mount, decremented when a round expires nothing —
//! reaches zero. Each round paces itself a second apart from the next.
//!
//! On stop, if the main loop's last cycle hit the `EXPIRE_MAX` cap there
//! is probably still a backlog, so it drains one more cycle before
//! actually stopping. Otherwise it waits for every burst thread to
//! finish, then sets `shutdown` — the flag the dispatcher's main loop
//! polls to know the expire side is fully quiesced.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::proto;

const EXPIRE_MAX: u32 = 500;
const EXPIRE_MAX_THREADS: usize = 10;
const DEFAULT_LIFE: i32 = 5;
const BURST_ROUNDS: u32 = 100;
const IDLE_SLEEP: Duration = Duration::from_secs(1);

struct BurstSlot {
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    ioctlfd: RawFd,
    stop: AtomicBool,
    shutdown: Arc<AtomicBool>,
    burst_threads: Mutex<Vec<BurstSlot>>,
    burst_counter: std::sync::atomic::AtomicUsize,
}

/// Drives periodic kernel-side expiry for one mounted autofs root.
pub struct ExpireDriver {
    shared: Arc<Shared>,
    main: Mutex<Option<JoinHandle<()>>>,
}

impl ExpireDriver {
    /// Starts the expire main thread, unless `timeout` is zero, in which
    /// case expiry is disabled entirely and `None` is returned. `shutdown`
    /// is set to `true` once the driver has fully stopped, including all
    /// burst threads — the dispatcher polls it before proceeding with its
    /// own teardown.
    pub fn start(ioctlfd: RawFd, timeout: u64, shutdown: Arc<AtomicBool>) -> Option<Self> {
        if timeout == 0 {
            return None;
        }

        let shared = Arc::new(Shared {
            ioctlfd,
            stop: AtomicBool::new(false),
            shutdown,
            burst_threads: Mutex::new((0..EXPIRE_MAX_THREADS).map(|_| BurstSlot { handle: None }).collect()),
            burst_counter: std::sync::atomic::AtomicUsize::new(0),
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("autofsd-expire-main".to_string())
                .spawn(move || main_expire_mounts(shared))
                .expect("spawn expire main thread")
        };

        Some(Self {
            shared,
            main: Mutex::new(Some(handle)),
        })
    }

    /// Request the main thread to stop after draining any backlog.
    pub fn stop_set(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Join the main thread. Burst threads are joined internally by the
    /// main thread before it sets `shutdown`.
    pub fn stop(&self) {
        self.stop_set();
        if let Some(handle) = self.main.lock().take() {
            let _ = handle.join();
        }
    }
}

fn main_expire_mounts(shared: Arc<Shared>) {
    loop {
        let mut hits = 0u32;
        while hits < EXPIRE_MAX {
            match proto::ioctl_expire_multi(shared.ioctlfd) {
                Ok(true) => hits += 1,
                Ok(false) => break,
                Err(e) => {
                    log::error!("expire_multi ioctl: {}", e);
                    break;
                }
            }
        }

        let stopping = shared.stop.load(Ordering::SeqCst);
        let hit_cap = hits >= EXPIRE_MAX;

        if stopping {
            if hit_cap {
                // Likely more work queued up; drain one more cycle
                // before actually stopping.
                continue;
            }
            wait_all_burst_threads(&shared);
            shared.shutdown.store(true, Ordering::SeqCst);
            return;
        }

        if hit_cap {
            start_extra_expire_thread(&shared);
        } else if hits < 1 {
            thread::sleep(IDLE_SLEEP);
        }
    }
}

fn start_extra_expire_thread(shared: &Arc<Shared>) {
    let mut slots = shared.burst_threads.lock();
    for slot in slots.iter_mut() {
        let free = match &slot.handle {
            Some(h) => h.is_finished(),
            None => true,
        };
        if !free {
            continue;
        }
        if let Some(h) = slot.handle.take() {
            let _ = h.join();
        }
        let id = shared.burst_counter.fetch_add(1, Ordering::Relaxed);
        let shared_clone = shared.clone();
        let name = format!("autofsd-expire-burst-{}", id);
        match thread::Builder::new().name(name).spawn(move || extra_expire_mounts(shared_clone)) {
            Ok(handle) => slot.handle = Some(handle),
            Err(e) => log::error!("could not start extra expire thread: {}", e),
        }
        return;
    }
    log::warn!("could not start extra expire thread: all {} slots busy", EXPIRE_MAX_THREADS);
}

fn extra_expire_mounts(shared: Arc<Shared>) {
    let mut life = DEFAULT_LIFE;

    for _ in 0..BURST_ROUNDS {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }

        let mut hits = 0u32;
        loop {
            match proto::ioctl_expire_multi(shared.ioctlfd) {
                Ok(true) => hits += 1,
                Ok(false) => break,
                Err(e) => {
                    log::error!("expire_multi ioctl (burst): {}", e);
                    break;
                }
            }
        }

        if hits < 1 {
            life -= 1;
        } else {
            life = DEFAULT_LIFE;
        }

        if life <= 0 {
            return;
        }

        thread::sleep(IDLE_SLEEP);
    }
}

fn wait_all_burst_threads(shared: &Arc<Shared>) {
    let mut slots = shared.burst_threads.lock();
    for slot in slots.iter_mut() {
        if let Some(handle) = slot.handle.take() {
            let _ = handle.join();
        }
    }
}
