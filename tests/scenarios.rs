//! End-to-end scenarios across the registries a real missing/expire cycle
//! would drive together, without requiring an actual autofs kernel mount.
//! Each test assembles the same components `Dispatcher` wires up and drives
//! them the way the request handlers do, standing in for the kernel with
//! plain thread-level concurrency instead of a real `/dev/autofs` pipe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use autofsd::backup_child::BackupChildRegistry;
use autofsd::backup_queue::BackupQueue;
use autofsd::clock::MonotonicClock;
use autofsd::lockfile::LockfileRegistry;
use autofsd::multipath::MultipathRegistry;
use autofsd::packet::Packet;
use autofsd::worker_pool::WorkerPool;
use autofsd::workon::WorkonRegistry;

/// One name going through a full materialize-then-expire cycle: the missing
/// handler's gate+lockfile sequence, then the expire handler's non-blocking
/// gate, exactly as `Inner::handle_missing`/`handle_expire` use them.
#[test]
fn single_name_mount_then_unmount_cycle() {
    let workon = WorkonRegistry::new();
    let dir = tempfile::tempdir().unwrap();
    let locks = LockfileRegistry::new(true, dir.path().to_path_buf(), 1234).unwrap();

    {
        let _guard = workon.acquire(b"home");
        assert!(locks.create(b"home").unwrap());
        assert!(dir.path().join("home.lock").exists());
    }
    assert_eq!(workon.live_count(), 0);

    // Expire uses try_acquire; nothing else holds the gate, so it succeeds.
    {
        let _guard = workon.try_acquire(b"home").expect("gate should be free");
        locks.remove(b"home");
    }
    assert!(!dir.path().join("home.lock").exists());
}

/// While a name is being materialized, a second expire for the same raw
/// name must not block behind it — the expire handler treats contention as
/// transient and just re-acknowledges instead of waiting.
#[test]
fn expire_does_not_block_on_a_concurrent_missing() {
    let workon = Arc::new(WorkonRegistry::new());
    let barrier = Arc::new(Barrier::new(2));

    let missing_workon = workon.clone();
    let missing_barrier = barrier.clone();
    let missing_thread = thread::spawn(move || {
        let _guard = missing_workon.acquire(b"home");
        missing_barrier.wait();
        thread::sleep(Duration::from_millis(100));
    });

    barrier.wait();
    assert!(workon.try_acquire(b"home").is_none());
    missing_thread.join().unwrap();

    assert!(workon.try_acquire(b"home").is_some());
}

/// Two aliases sharing one canonical name: the canonical gate is shared
/// across both raw names, and the alias refcount only reaches zero (backup
/// eligible) once every alias has expired.
#[test]
fn alias_group_backup_eligible_only_after_last_alias_expires() {
    let multi = MultipathRegistry::new();
    let canonical = b"shared";

    multi.increment(canonical); // alias ".shared"
    multi.increment(canonical); // alias "shared"

    assert_eq!(multi.decrement(canonical), 1, "first alias leaving: one still live");
    assert_eq!(multi.decrement(canonical), 0, "last alias leaving: now eligible for backup");
}

/// Raw-before-canonical gate ordering lets the missing handler hold both
/// gates for an alias without deadlocking against a second handler doing
/// the same for a different alias of the same canonical name.
#[test]
fn raw_then_canonical_gate_order_does_not_deadlock_across_aliases() {
    let workon = Arc::new(WorkonRegistry::new());

    let w1 = workon.clone();
    let t1 = thread::spawn(move || {
        let _raw = w1.acquire(b".shared");
        let _canon = w1.acquire(b"shared");
    });

    let w2 = workon.clone();
    let t2 = thread::spawn(move || {
        let _raw = w2.acquire(b"shared-other-alias");
        let _canon = w2.acquire(b"shared");
    });

    t1.join().unwrap();
    t2.join().unwrap();
    assert_eq!(workon.live_count(), 0);
}

/// A backup enqueued on unmount is superseded by a prompt remount: as long
/// as the watcher has not yet promoted it into a launch batch, cancelling it
/// is a plain dequeue and no child is ever started.
#[test]
fn pending_backup_is_cancelled_by_a_prompt_remount() {
    let clock = Arc::new(MonotonicClock::new());
    let children = BackupChildRegistry::new(None, None, None, clock.clone());
    // A long quiet period means the watcher will not promote this entry
    // before the remount arrives to cancel it.
    let queue = BackupQueue::new(3600, 10, children.clone(), clock);

    queue.enqueue(b"home", "/real/home");
    assert!(queue.dequeue_or_wait(b"home"), "still queued, should cancel outright");
    assert_eq!(children.count(), 0, "backup must never have been started");

    queue.stop();
    children.stop();
}

/// Once a backup has been promoted into an active launch batch, a remount
/// for the same name waits for that batch to finish rather than racing the
/// fork — the resolution recorded for the queue's cancel-vs-wait question.
#[test]
fn backup_already_in_launch_batch_is_waited_on_not_cancelled() {
    let clock = Arc::new(MonotonicClock::new());
    // "/bin/true" is a harmless, always-present binary to actually fork so
    // the registry's count transitions are observable.
    let argv = autofsd::backup_argv::BackupArgv::new(Some("/bin/true")).unwrap();
    let children = BackupChildRegistry::new(argv, None, None, clock.clone());
    // wait_before=0: the watcher promotes the entry on its very next poll.
    let queue = BackupQueue::new(0, 10, children.clone(), clock);

    queue.enqueue(b"home", "/real/home");

    // Give the watcher a moment to pick the entry up and start forking.
    thread::sleep(Duration::from_millis(200));

    // By now the entry is either already gone (batch finished) or mid-batch;
    // either way dequeue_or_wait must not report a cancellation.
    let cancelled = queue.dequeue_or_wait(b"home");
    assert!(!cancelled, "an in-flight or completed backup must never be reported as cancelled");

    queue.stop();
    children.stop();
}

/// Stopping a worker pool while a packet is mid-callback must drain that
/// in-flight work before the pool reports itself empty — shutdown never
/// abandons a handler partway through.
#[test]
fn worker_pool_stop_drains_in_flight_work_before_returning() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicUsize::new(0));

    let started2 = started.clone();
    let finished2 = finished.clone();
    let pool = WorkerPool::new("test-shutdown", 4, 1, move |_packet| {
        started2.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        finished2.fetch_add(1, Ordering::SeqCst);
    });

    pool.submit(Packet::empty());
    while !started.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(5));
    }

    pool.stop();

    assert_eq!(finished.load(Ordering::SeqCst), 1, "in-flight callback must finish before stop() returns");
    assert_eq!(pool.live_count(), 0);
}
