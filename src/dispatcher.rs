//! Dispatcher (C11): owns the autofs mount, the kernel protocol loop, and
//! the missing/expire handlers.
//!
//! Mirrors the teacher's `Session`: setup mounts the filesystem and opens
//! its communication channel, `run` reads and dispatches requests until
//! told to stop, and teardown unmounts. Here the "channel" is a pipe the
//! kernel autofs module writes fixed-size packets into, and every request
//! gets exactly one `ready`/`fail` acknowledgement instead of a FUSE
//! reply.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::{lstat, Mode};
use nix::unistd::{getpgrp, pipe};
use parking_lot::Mutex;

use crate::backup_child::BackupChildRegistry;
use crate::backup_queue::BackupQueue;
use crate::config::{Config, RemountPolicy};
use crate::lockfile::LockfileRegistry;
use crate::module_loader::Module;
use crate::multipath::MultipathRegistry;
use crate::packet::{Packet, PacketKind, PacketPool, WIRE_SIZE};
use crate::proto;
use crate::worker_pool::WorkerPool;
use crate::workon::WorkonRegistry;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of trying to remove a mount at a virtual path.
enum UnmountResult {
    /// Unmounted and the mountpoint directory was removed.
    Success,
    /// Busy; nothing changed. The kernel will ask again later.
    Busy,
    Error(io::Error),
}

/// Shared state reachable from both the dispatcher thread and the
/// missing/expire worker threads.
struct Inner {
    root: PathBuf,
    dev0: u64,
    // Kept open for the process lifetime; `READY`/`FAIL`/`SETTIMEOUT`/
    // `CATATONIC` all ioctl against it.
    ioctl_fd: OwnedFd,
    prefix: u8,
    multipath: bool,
    remount_policy: RemountPolicy,
    stop: AtomicBool,
    workon: WorkonRegistry,
    multi: MultipathRegistry,
    locks: LockfileRegistry,
    packets: PacketPool,
    module: Module,
    backup_queue: Arc<BackupQueue>,
    backup_children: Arc<BackupChildRegistry>,
}

/// Owns the autofs mount and drives the kernel request loop.
///
/// `reader` sits behind a lock even though only the thread running
/// [`Self::run`] ever touches it: the signal thread needs to share this
/// struct via `Arc` to call the `&self` shutdown methods below, and a
/// plain `File` would make `Dispatcher` usable only from one thread at a
/// time with no way to express that the sharing is actually one-writer,
/// one-reader-of-different-fields.
pub struct Dispatcher {
    inner: Arc<Inner>,
    reader: Mutex<File>,
    missing_pool: WorkerPool,
    expire_pool: WorkerPool,
}

impl Dispatcher {
    /// Mounts `config.directory` as an autofs v4 root, loads the supplied
    /// module's entry points, and wires up the missing/expire worker
    /// pools. Does not start reading requests; call [`Self::run`] for that.
    pub fn mount(
        config: &Config,
        module: Module,
        locks: LockfileRegistry,
        backup_queue: Arc<BackupQueue>,
        backup_children: Arc<BackupChildRegistry>,
    ) -> io::Result<Self> {
        let (reader_fd, writer_fd): (OwnedFd, OwnedFd) = pipe()?;

        let pgrp = getpgrp();
        let options = format!(
            "fd={},pgrp={},minproto=4,maxproto=4",
            writer_fd.as_raw_fd(),
            pgrp
        );
        mount(
            Some(config.directory.to_string_lossy().as_ref()),
            &config.directory,
            Some("autofs"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(io::Error::from)?;

        // The kernel holds its own reference to the write end via `fd=`
        // in the mount options; our copy is only needed to construct it.
        drop(writer_fd);

        set_nonblocking(reader_fd.as_raw_fd())?;
        let reader = File::from(reader_fd);

        let ioctl_path = config.directory.join(".");
        let ioctl_fd = open(&ioctl_path, OFlag::O_RDONLY, Mode::empty())?;

        let st = lstat(&config.directory)?;
        let dev0 = st.st_dev;

        let proto_version = proto::ioctl_protover(ioctl_fd.as_raw_fd())?;
        if proto_version as u32 != proto::PROTO_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "kernel negotiated autofs protocol {proto_version}, only v{} is supported",
                    proto::PROTO_VERSION
                ),
            ));
        }
        proto::ioctl_settimeout(ioctl_fd.as_raw_fd(), config.timeout)?;

        let inner = Arc::new(Inner {
            root: config.directory.clone(),
            dev0,
            ioctl_fd,
            prefix: config.prefix,
            multipath: config.multipath,
            remount_policy: config.remount_policy,
            stop: AtomicBool::new(false),
            workon: WorkonRegistry::new(),
            multi: MultipathRegistry::new(),
            locks,
            packets: PacketPool::new(),
            module,
            backup_queue,
            backup_children,
        });

        let missing_inner = inner.clone();
        let missing_pool = WorkerPool::new("autofsd-missing", 1000, 30, move |packet| {
            missing_inner.handle_missing(packet);
        });

        let expire_inner = inner.clone();
        let expire_pool = WorkerPool::new("autofsd-expire", 100, 10, move |packet| {
            expire_inner.handle_expire(packet);
        });

        Ok(Self {
            inner,
            reader: Mutex::new(reader),
            missing_pool,
            expire_pool,
        })
    }

    pub fn module_name(&self) -> &str {
        self.inner.module.name()
    }

    /// Raw fd for the `AUTOFS_IOC_*` ioctls, for [`crate::expire::
    /// ExpireDriver`] to issue `EXPIRE_MULTI` against independently of the
    /// dispatcher's own request loop.
    pub fn ioctl_raw_fd(&self) -> RawFd {
        self.inner.ioctl_fd.as_raw_fd()
    }

    /// Reads and dispatches kernel packets until [`Self::request_stop`]
    /// has been called and the pipe has gone quiet. Call this from the
    /// one thread that owns the main loop; everything else on
    /// `Dispatcher` is safe to call concurrently from other threads.
    pub fn run(&self) {
        let mut reader = self.reader.lock();
        loop {
            let stopping = self.inner.stop.load(Ordering::SeqCst);

            let mut poll_fd = PollFd::new(reader.as_fd(), PollFlags::POLLIN);
            let timeout = PollTimeout::from(POLL_TIMEOUT.as_millis() as u16);
            match poll(std::slice::from_mut(&mut poll_fd), timeout) {
                Ok(0) => {
                    if stopping {
                        return;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("poll on autofs pipe: {e}");
                    return;
                }
            }

            let readable = poll_fd
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if !readable {
                if stopping {
                    return;
                }
                continue;
            }

            match self.read_packet(&mut reader) {
                Ok(Some(packet)) => self.dispatch(packet),
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::info!("kernel closed the autofs pipe, shutting down");
                    return;
                }
                Err(e) => {
                    log::error!("reading autofs packet: {e}");
                    return;
                }
            }
        }
    }

    fn read_packet(&self, reader: &mut File) -> io::Result<Option<Packet>> {
        let mut buf = [0u8; WIRE_SIZE];
        let mut filled = 0usize;
        while filled < WIRE_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let mut packet = self.inner.packets.allocate();
        packet.fill_from_wire(&buf);
        Ok(Some(packet))
    }

    fn dispatch(&self, packet: Packet) {
        match packet.kind {
            PacketKind::Missing => self.missing_pool.submit(packet),
            PacketKind::ExpireMulti => self.expire_pool.submit(packet),
            PacketKind::Unknown(ty) => {
                log::error!("unknown autofs packet type {ty}, bailing out of the main loop");
                self.inner.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Flip the internal stop flag: new `missing` requests are failed and
    /// new `expire` requests are acknowledged without enqueuing backups.
    /// Also stops the lock-file registry this dispatcher owns, since it is
    /// not independently reachable from outside. Does not itself stop the
    /// worker pools or unmount anything — see `lifecycle` for the full
    /// ordered teardown.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.locks.stop_set();
    }

    /// Stop the expire pool, then the missing pool, draining in-flight
    /// work from each. Order matches the Open Question resolution in
    /// `DESIGN.md`: expire-token holders must drain before the handler
    /// code they call into goes away.
    pub fn stop_pools(&self) {
        self.expire_pool.stop();
        self.missing_pool.stop();
    }

    /// Unmount every live child of the autofs root, put the kernel side
    /// into catatonic mode, and unmount the root itself. Call only after
    /// [`Self::stop_pools`] has returned.
    pub fn teardown_mount(&self) {
        self.inner.packets.drain();
        self.inner.locks.drain();
        if let Err(e) = self.inner.unmount_all_children() {
            log::error!("unmounting leftover children of {}: {}", self.inner.root.display(), e);
        }
        if let Err(e) = proto::ioctl_catatonic(self.inner.ioctl_fd.as_raw_fd()) {
            log::warn!("ioctl(CATATONIC): {e}");
        }
        if let Err(e) = umount2(&self.inner.root, MntFlags::empty()) {
            log::error!("unmounting autofs root {}: {}", self.inner.root.display(), e);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Splits a raw kernel name into (is_alias, canonical name), stripping the
/// configured alias prefix when multipath is enabled and present.
fn canonical_name(multipath: bool, prefix: u8, raw: &[u8]) -> (bool, Vec<u8>) {
    if multipath && raw.first() == Some(&prefix) {
        (true, raw[1..].to_vec())
    } else {
        (false, raw.to_vec())
    }
}

/// Replaces non-printable bytes with spaces and truncates to `len`,
/// matching the dispatcher's sanitize-on-read step.
fn sanitize(raw: &[u8], len: usize) -> Vec<u8> {
    raw[..len]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b } else { b' ' })
        .collect()
}

impl Inner {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn ready(&self, token: u32) {
        if let Err(e) = proto::ioctl_ready(self.ioctl_fd.as_raw_fd(), token) {
            log::error!("ioctl(READY, {token}): {e}");
        }
    }

    fn fail(&self, token: u32) {
        if let Err(e) = proto::ioctl_fail(self.ioctl_fd.as_raw_fd(), token) {
            log::error!("ioctl(FAIL, {token}): {e}");
        }
    }

    fn virtual_path(&self, raw_name: &[u8]) -> PathBuf {
        self.root.join(String::from_utf8_lossy(raw_name).into_owned())
    }

    fn is_mountpoint(&self, path: &Path) -> io::Result<bool> {
        let st = lstat(path)?;
        Ok(st.st_dev != self.dev0)
    }

    fn handle_missing(&self, packet: Packet) {
        let token = packet.token;

        if packet.len == 0 || packet.len > proto::NAME_MAX || packet.name.get(packet.len) != Some(&0) {
            log::warn!("invalid missing packet (len={})", packet.len);
            self.fail(token);
            self.packets.free(packet);
            return;
        }

        let raw_name = sanitize(&packet.name, packet.len);
        self.packets.free(packet);

        if self.stopping() {
            self.fail(token);
            return;
        }

        let raw_guard = self.workon.acquire(&raw_name);
        let (is_alias, canonical) = canonical_name(self.multipath, self.prefix, &raw_name);
        let canon_guard = if is_alias {
            Some(self.workon.acquire(&canonical))
        } else {
            None
        };

        // `--no-kill` leaves a pending or in-flight backup completely
        // alone: no queue cancellation, no kill/wait on an already-forked
        // child. Matches the original's `backup_remove()`, which returns
        // immediately on `backup_nokill` before touching either.
        if self.remount_policy != RemountPolicy::Ignore {
            self.backup_queue.dequeue_or_wait(&canonical);

            // A backup may already have been forked for this name (past
            // the queue, tracked only by the child registry now); apply
            // the configured remount policy to it before proceeding.
            match self.remount_policy {
                RemountPolicy::Kill => self.backup_children.kill(&canonical),
                RemountPolicy::Wait => self.backup_children.wait(&canonical),
                RemountPolicy::Ignore => unreachable!(),
            }
        }

        let v = self.virtual_path(&raw_name);

        match lstat(&v) {
            Ok(st) => {
                if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                    log::error!("{} exists and is not a directory", v.display());
                    self.fail(token);
                    return;
                }
                if st.st_dev != self.dev0 {
                    // Already mounted: idempotent success, kernel retry.
                    self.ready(token);
                    return;
                }
            }
            Err(nix::errno::Errno::ENOENT) => {
                if let Err(e) = std::fs::create_dir(&v) {
                    log::error!("mkdir {}: {}", v.display(), e);
                    self.fail(token);
                    return;
                }
                let _ = std::fs::set_permissions(&v, std::os::unix::fs::PermissionsExt::from_mode(0o700));
            }
            Err(e) => {
                log::error!("lstat {}: {}", v.display(), e);
                self.fail(token);
                return;
            }
        }

        if let Err(e) = self.locks.create(&raw_name) {
            log::error!("lockfile create for {}: {}", String::from_utf8_lossy(&raw_name), e);
            let _ = std::fs::remove_dir(&v);
            self.fail(token);
            return;
        }

        let canonical_str = String::from_utf8_lossy(&canonical).into_owned();
        let root_str = self.root.to_string_lossy().into_owned();
        let Some(real_path) = self.module.dowork(&canonical_str, &root_str) else {
            log::error!("module dowork failed for {canonical_str}");
            self.locks.remove(&raw_name);
            let _ = std::fs::remove_dir(&v);
            self.fail(token);
            return;
        };

        if let Err(e) = mount(
            Some(real_path.to_string_lossy().as_ref()),
            &v,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            log::error!("bind mount {} -> {}: {}", real_path.display(), v.display(), e);
            self.locks.remove(&raw_name);
            let _ = std::fs::remove_dir(&v);
            self.fail(token);
            return;
        }

        if self.multipath {
            self.multi.increment(&canonical);
        }

        self.ready(token);
        drop(canon_guard);
        drop(raw_guard);
    }

    fn handle_expire(&self, packet: Packet) {
        let token = packet.token;

        if packet.len == 0 || packet.len > proto::NAME_MAX || packet.name.get(packet.len) != Some(&0) {
            log::warn!("invalid expire packet (len={})", packet.len);
            self.fail(token);
            self.packets.free(packet);
            return;
        }
        let raw_name = sanitize(&packet.name, packet.len);
        self.packets.free(packet);

        let Some(_guard) = self.workon.try_acquire(&raw_name) else {
            // Transient contention: nothing changed under us, so a bare
            // ready is safe and the kernel will ask again if needed.
            self.ready(token);
            return;
        };

        let v = self.virtual_path(&raw_name);
        match unmount_virtual(&v) {
            UnmountResult::Busy => {
                self.ready(token);
                return;
            }
            UnmountResult::Error(e) => {
                log::error!("unmount {}: {}", v.display(), e);
                self.fail(token);
                return;
            }
            UnmountResult::Success => {}
        }

        self.locks.remove(&raw_name);

        let (_, canonical) = canonical_name(self.multipath, self.prefix, &raw_name);
        let canonical_str = String::from_utf8_lossy(&canonical).into_owned();
        let real_path = self.module.dir(&canonical_str);
        let real_path_str = real_path.to_string_lossy().into_owned();

        if self.multipath {
            match self.multi.decrement(&canonical) {
                -1 => {
                    log::warn!(
                        "multipath decrement for {canonical_str} found no entry (protocol violation), skipping backup"
                    );
                }
                0 => {
                    if !self.stopping() {
                        self.backup_queue.enqueue(&canonical, &real_path_str);
                    }
                }
                _ => {
                    // Other aliases still live; no backup yet.
                }
            }
        } else if !self.stopping() {
            self.backup_queue.enqueue(&raw_name, &real_path_str);
        }

        self.ready(token);
    }

    fn unmount_all_children(&self) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match self.is_mountpoint(&path) {
                Ok(true) => {
                    if let UnmountResult::Error(e) = unmount_virtual(&path) {
                        log::warn!("unmounting leftover child {}: {}", path.display(), e);
                    }
                }
                Ok(false) => {}
                Err(e) => log::warn!("lstat {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

fn unmount_virtual(path: &Path) -> UnmountResult {
    match umount2(path, MntFlags::empty()) {
        Ok(()) => {
            let _ = std::fs::remove_dir(path);
            UnmountResult::Success
        }
        Err(nix::errno::Errno::EBUSY) => UnmountResult::Busy,
        Err(nix::errno::Errno::ENOENT) => {
            let _ = std::fs::remove_dir(path);
            UnmountResult::Success
        }
        Err(e) => UnmountResult::Error(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_strips_prefix_when_present() {
        let (alias, canon) = canonical_name(true, b'.', b".u");
        assert!(alias);
        assert_eq!(canon, b"u");
    }

    #[test]
    fn canonical_name_passes_through_without_prefix() {
        let (alias, canon) = canonical_name(true, b'.', b"u");
        assert!(!alias);
        assert_eq!(canon, b"u");
    }

    #[test]
    fn canonical_name_ignores_prefix_when_multipath_disabled() {
        let (alias, canon) = canonical_name(false, b'.', b".u");
        assert!(!alias);
        assert_eq!(canon, b".u");
    }

    #[test]
    fn sanitize_replaces_non_printable_bytes() {
        let raw = b"a\x01b\x7f";
        assert_eq!(sanitize(raw, raw.len()), b"a b ");
    }
}
