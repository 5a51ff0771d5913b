//! Process entry point (C14): argument parsing, logging, capability
//! dropping, module loading, component wiring, and the main loop.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use std::os::fd::AsFd;

use caps::{CapSet, CapsHashSet, Capability};
use clap::Parser;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{dup2_stderr, dup2_stdin, dup2_stdout, fork, setpgid, setsid, ForkResult, Pid, Uid};

use autofsd::backup_argv::BackupArgv;
use autofsd::backup_child::BackupChildRegistry;
use autofsd::backup_queue::BackupQueue;
use autofsd::clock::MonotonicClock;
use autofsd::config::{Cli, Config};
use autofsd::dispatcher::Dispatcher;
use autofsd::error::AutofsError;
use autofsd::expire::ExpireDriver;
use autofsd::lifecycle::{self, Services, SignalThread};
use autofsd::lockfile::LockfileRegistry;
use autofsd::module_loader::Module;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("autofsd: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    // The signal mask is inherited by every thread spawned after this
    // point, so this must run before any registry/pool/driver spawns its
    // background thread.
    if let Err(e) = lifecycle::block_all_signals() {
        log::error!("blocking signals: {e}");
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let level = if config.verbose { log::LevelFilter::Info } else { log::LevelFilter::Warn };
    if config.foreground {
        env_logger::Builder::new().filter_level(level).init();
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "autofsd".into(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(writer) => {
                let logger = syslog::BasicLogger::new(writer);
                if log::set_boxed_logger(Box::new(logger)).is_ok() {
                    log::set_max_level(level);
                }
            }
            Err(e) => {
                // No syslog available; fall back to stderr rather than
                // running with no logging at all.
                env_logger::Builder::new().filter_level(level).init();
                log::error!("connecting to syslog: {e}, logging to stderr instead");
            }
        }
    }
}

fn run(config: Config) -> Result<(), AutofsError> {
    if !Uid::effective().is_root() {
        return Err(AutofsError::Config("autofsd must be run by root".to_string()));
    }

    drop_capabilities()?;

    let module = Module::load(&config.module, config.module_options.as_deref(), &config.directory.to_string_lossy())?;

    // Everything below this point starts a background thread of its own;
    // forking (or just joining the foreground process group) has to
    // happen first so the forked child, not a parent that's about to
    // exit, ends up owning the worker/watcher/supervisor threads.
    if config.foreground {
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    } else {
        daemonize()?;
    }

    let pidfile = write_pidfile(&config)?;

    let clock = Arc::new(MonotonicClock::new());

    let argv = BackupArgv::new(config.backup.as_deref())?;
    let backup_children = BackupChildRegistry::new(argv, config.backup_life, config.nice, clock.clone());
    let backup_queue = BackupQueue::new(config.wait, config.max_backups, backup_children.clone(), clock.clone());

    let locks = LockfileRegistry::new(config.use_locks, config.lock_dir.clone(), std::process::id())?;

    let dispatcher = Arc::new(Dispatcher::mount(&config, module, locks, backup_queue.clone(), backup_children.clone())?);
    log::info!("autofsd: mounted {} (module {})", config.directory.display(), dispatcher.module_name());

    let expire_shutdown = Arc::new(AtomicBool::new(false));
    let expire = ExpireDriver::start(dispatcher.ioctl_raw_fd(), config.timeout, expire_shutdown).map(Arc::new);

    let services = Services {
        dispatcher: dispatcher.clone(),
        expire,
        backup_queue,
        backup_children,
    };

    let signal_thread = SignalThread::spawn(services.clone());

    dispatcher.run();

    // `run` can return either because a signal triggered `request_stop`
    // (in which case the signal thread is already driving — or has
    // already driven — the rest of the teardown) or spontaneously (an
    // unknown packet type, the kernel closing the pipe, or a poll
    // error). Either way the full ordered shutdown must happen exactly
    // once before the process exits.
    lifecycle::ensure_shutdown(&services);
    signal_thread.join();

    if let Some(path) = pidfile {
        let _ = std::fs::remove_file(path);
    }

    Ok(())
}

/// Forks into the background, detaches from the controlling terminal,
/// and redirects stdio to `/dev/null` — matches the original's
/// `become_daemon`. The parent exits immediately; only the child
/// returns.
fn daemonize() -> std::io::Result<()> {
    std::env::set_current_dir("/")?;

    // SAFETY: no other thread exists yet at this point in startup (every
    // registry/pool/driver that spawns one is constructed after this
    // call returns), so forking here can't race a concurrent allocation
    // or lock acquisition on another thread.
    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(std::io::Error::from)?;

    let nullfd = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    let _ = dup2_stdin(nullfd.as_fd());
    let _ = dup2_stdout(nullfd.as_fd());
    let _ = dup2_stderr(nullfd.as_fd());

    Ok(())
}

/// Writes the daemon's PID to `config.pidfile`, if one was given.
fn write_pidfile(config: &Config) -> std::io::Result<Option<std::path::PathBuf>> {
    let Some(path) = &config.pidfile else {
        return Ok(None);
    };
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(Some(path.clone()))
}

/// Drops every capability except the set spec.md §6 names: `CAP_CHOWN`,
/// `CAP_DAC_OVERRIDE`, `CAP_FOWNER`, `CAP_FSETID`, `CAP_SYS_ADMIN`
/// (effective + permitted) and `CAP_DAC_READ_SEARCH` (inheritable only,
/// so backup children can traverse but not write).
fn drop_capabilities() -> Result<(), AutofsError> {
    let mut working: CapsHashSet = CapsHashSet::new();
    working.insert(Capability::CAP_CHOWN);
    working.insert(Capability::CAP_DAC_OVERRIDE);
    working.insert(Capability::CAP_FOWNER);
    working.insert(Capability::CAP_FSETID);
    working.insert(Capability::CAP_SYS_ADMIN);

    caps::set(None, CapSet::Permitted, &working)
        .map_err(|e| AutofsError::Config(format!("dropping permitted capabilities: {e}")))?;
    caps::set(None, CapSet::Effective, &working)
        .map_err(|e| AutofsError::Config(format!("dropping effective capabilities: {e}")))?;

    let mut inheritable: CapsHashSet = CapsHashSet::new();
    inheritable.insert(Capability::CAP_DAC_READ_SEARCH);
    caps::set(None, CapSet::Inheritable, &inheritable)
        .map_err(|e| AutofsError::Config(format!("dropping inheritable capabilities: {e}")))?;

    Ok(())
}
