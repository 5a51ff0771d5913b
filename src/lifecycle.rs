//! Signal handling and the ordered shutdown sequence (C13).
//!
//! Every thread in this process is started with every signal blocked
//! (`main` does this once, before any thread is spawned, since the mask is
//! inherited). One dedicated thread blocks in `sigwait(2)`-equivalent and
//! either swallows a signal that is expected background noise
//! (`SIGCHLD`/`SIGUSR1`/`SIGALRM`/`SIGHUP`/`SIGPIPE`) or treats anything
//! else as a shutdown request and drives the teardown order from §4.11:
//! stop accepting new work, drain the expire side before the missing side,
//! stop the backup subsystem, then tear down the mount.

use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

use nix::sys::signal::{SigSet, Signal, SigmaskHow};

use crate::backup_child::BackupChildRegistry;
use crate::backup_queue::BackupQueue;
use crate::dispatcher::Dispatcher;
use crate::expire::ExpireDriver;

const IGNORED: &[Signal] = &[
    Signal::SIGUSR1,
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGHUP,
    Signal::SIGPIPE,
];

/// Blocks every signal on the calling thread. Must run before any other
/// thread is spawned so the blocked mask is inherited everywhere.
pub fn block_all_signals() -> nix::Result<()> {
    let all = SigSet::all();
    nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&all), None)
}

/// Everything the signal thread needs to drive shutdown once it decides
/// to act on a signal. Every field is an `Arc`, so cloning a `Services`
/// is cheap and just hands out another handle to the same components —
/// both the signal thread and the main loop's post-`run` cleanup hold
/// one.
#[derive(Clone)]
pub struct Services {
    pub dispatcher: Arc<Dispatcher>,
    pub expire: Option<Arc<ExpireDriver>>,
    pub backup_queue: Arc<BackupQueue>,
    pub backup_children: Arc<BackupChildRegistry>,
}

/// Owns the dedicated signal-waiting thread.
pub struct SignalThread {
    handle: Option<JoinHandle<()>>,
}

impl SignalThread {
    /// Spawns the thread. `block_all_signals` must already have been
    /// called on the main thread before this is invoked.
    pub fn spawn(services: Services) -> Self {
        let handle = thread::Builder::new()
            .name("autofsd-signal".to_string())
            .spawn(move || signal_loop(services))
            .expect("spawn signal thread");
        Self {
            handle: Some(handle),
        }
    }

    /// Block until the signal thread has driven a full shutdown (or
    /// forever, if no terminating signal ever arrives — callers normally
    /// pair this with the dispatcher's own loop exiting first).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn signal_loop(services: Services) {
    // Matches the original's `sigfillset(&set)`: wait on every signal,
    // not just the ones this function cares about.
    let wait_set = SigSet::all();

    loop {
        let sig = match wait_set.wait() {
            Ok(sig) => sig,
            Err(e) => {
                log::error!("sigwait: {e}");
                continue;
            }
        };

        if IGNORED.contains(&sig) {
            log::debug!("ignoring signal {sig:?}");
            continue;
        }

        log::info!("received signal {sig:?}, shutting down");
        ensure_shutdown(&services);
        return;
    }
}

static SHUTDOWN: Once = Once::new();

/// Runs the ordered shutdown sequence exactly once, however it was
/// triggered. Both the signal thread (on a terminating signal) and the
/// main thread (once [`Dispatcher::run`] returns on its own, e.g. because
/// the kernel closed the pipe) call this; whichever gets here first runs
/// it, the other blocks until it is done and returns having done nothing
/// further.
pub fn ensure_shutdown(services: &Services) {
    SHUTDOWN.call_once(|| shutdown(services));
}

/// Runs the ordered shutdown sequence from spec §4.11: flip every stop
/// flag, drain the expire side before the missing side (the Open Question
/// resolution recorded in `DESIGN.md`), stop the backup subsystem, then
/// tear down the autofs mount.
fn shutdown(services: &Services) {
    services.dispatcher.request_stop();
    services.backup_queue.stop_set();
    services.backup_children.stop_set();
    if let Some(expire) = &services.expire {
        expire.stop_set();
    }

    if let Some(expire) = &services.expire {
        expire.stop();
    }
    services.backup_queue.stop();
    services.backup_children.stop();

    services.dispatcher.stop_pools();
    services.dispatcher.teardown_mount();
}
