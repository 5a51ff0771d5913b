//! Wire constants and ioctl bindings for the kernel autofs v4 protocol.
//!
//! These numbers come from the kernel's `<linux/auto_fs4.h>`: ioctl magic
//! `0x93`, packet types `missing` (autofs v4 notify) and `expire_multi`.
//! Only the pieces this daemon actually uses are bound here — no autofs
//! v5 direct-mount or `AUTOFS_DEV_IOCTL` miscdevice support, matching the
//! v4-only scope this crate targets.

use std::os::fd::RawFd;

pub const PROTO_VERSION: u32 = 4;

pub const AUTOFS_TYPE_MISSING: u32 = 0;
pub const AUTOFS_TYPE_EXPIRE_MULTI: u32 = 1;

/// `sizeof(struct autofs_packet_hdr) + ...` for the v4 `autofs_packet_missing`
/// variant: `proto_version`, `type`, `wait_queue_token`, `len`, `name[NAME_MAX+1]`.
pub const NAME_MAX: usize = 255;

nix::ioctl_none!(autofs_ioc_catatonic, 0x93, 0x62);
nix::ioctl_read!(autofs_ioc_protover, 0x93, 0x63, i32);
nix::ioctl_write_ptr!(autofs_ioc_settimeout, 0x93, 0x64, u64);
nix::ioctl_write_int!(autofs_ioc_expire_multi, 0x93, 0x66);

/// `ioctl(AUTOFS_IOC_READY)` acknowledges a token with success. The
/// kernel autofs v4 `READY`/`FAIL` ioctls take the token as the ioctl
/// argument via `ioctl(fd, cmd, token)` rather than as a pointed-to
/// struct, so these two bypass the `ioctl_*!`-generated wrappers.
pub fn ioctl_ready(fd: RawFd, token: u32) -> nix::Result<()> {
    ioctl_with_token(fd, 0x93, 0x60, token)
}

pub fn ioctl_fail(fd: RawFd, token: u32) -> nix::Result<()> {
    ioctl_with_token(fd, 0x93, 0x61, token)
}

fn ioctl_with_token(fd: RawFd, ty: u8, nr: u8, token: u32) -> nix::Result<()> {
    let request = nix::request_code_write!(ty, nr, std::mem::size_of::<u64>());
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, token as libc::c_ulong) };
    if ret < 0 {
        return Err(nix::Error::last());
    }
    Ok(())
}

pub fn ioctl_catatonic(fd: RawFd) -> nix::Result<()> {
    unsafe { autofs_ioc_catatonic(fd) }?;
    Ok(())
}

pub fn ioctl_protover(fd: RawFd) -> nix::Result<i32> {
    let mut version: i32 = 0;
    unsafe { autofs_ioc_protover(fd, &mut version) }?;
    Ok(version)
}

pub fn ioctl_settimeout(fd: RawFd, secs: u64) -> nix::Result<()> {
    let secs = secs;
    unsafe { autofs_ioc_settimeout(fd, &secs) }?;
    Ok(())
}

/// Issues `AUTOFS_IOC_EXPIRE_MULTI`. Returns `Ok(true)` if the kernel
/// expired something, `Ok(false)` if there was nothing to expire
/// (`ENOENT`/`EAGAIN`), and `Err` otherwise.
pub fn ioctl_expire_multi(fd: RawFd) -> nix::Result<bool> {
    match unsafe { autofs_ioc_expire_multi(fd, 0) } {
        Ok(_) => Ok(true),
        Err(nix::Error::EAGAIN) | Err(nix::Error::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}
