//! autofsd: an on-demand directory manager cooperating with the Linux
//! autofs v4 kernel module.
//!
//! The binary in `src/main.rs` is a thin CLI/process shell around this
//! library. Each module below corresponds to one piece of the daemon:
//! wire protocol, per-name locking, worker pools, the backup subsystem,
//! and the dispatcher that ties them together.

pub mod backup_argv;
pub mod backup_child;
pub mod backup_queue;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expire;
pub mod lifecycle;
pub mod lockfile;
pub mod module_loader;
pub mod multipath;
pub mod packet;
pub mod proto;
pub mod worker_pool;
pub mod workon;
