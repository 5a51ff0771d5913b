//! CLI surface and validated daemon configuration (C14/C15).
//!
//! `Cli` is the `clap::Parser` mirror of the option table in the spec; it
//! accepts raw strings and unchecked ranges the way `getopt_long` does.
//! `Config::from_cli` is the single place all of the per-flag validation
//! the original's `options.c` scatters across `autodir_option_*` happens,
//! producing a `Config` that every other component can trust without
//! re-checking.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::AutofsError;

/// On-demand directory manager cooperating with the Linux autofs v4 kernel module.
#[derive(Parser, Debug)]
#[command(name = "autofsd", version, about)]
pub struct Cli {
    /// Autofs mount point to own.
    #[arg(short = 'd', long = "directory")]
    pub directory: PathBuf,

    /// Absolute path to the materialization module.
    #[arg(short = 'm', long = "module")]
    pub module: PathBuf,

    /// Suboptions passed to the module's init entry point.
    #[arg(short = 'o', long = "options")]
    pub options: Option<String>,

    /// Expire idle-timeout, in seconds. Zero disables expiry.
    #[arg(short = 't', long = "timeout", default_value_t = 300)]
    pub timeout: u64,

    /// Write the daemon PID to this file, unlinking it on exit.
    #[arg(short = 'l', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Stay in the foreground and log to the console instead of syslog.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Enable info-level logging.
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// Backup program argv template (e.g. "/usr/bin/backup %N %L").
    #[arg(short = 'b', long = "backup")]
    pub backup: Option<String>,

    /// Quiet period, in seconds, before a backup is started after unmount.
    #[arg(short = 'w', long = "wait", default_value_t = 0)]
    pub wait: u64,

    /// Maximum concurrent backup children.
    #[arg(short = 'c', long = "max-backups", default_value_t = 200)]
    pub max_backups: i64,

    /// Nice value, 1..40, mapped onto -20..20.
    #[arg(short = 'p', long = "priority")]
    pub priority: Option<i32>,

    /// Kill backups that run longer than this many seconds.
    #[arg(short = 'L', long = "backup-life")]
    pub backup_life: Option<u64>,

    /// Wait for an in-flight backup instead of killing it on remount.
    #[arg(short = 'n', long = "wait-for-backup")]
    pub wait_for_backup: bool,

    /// Neither wait for nor kill an in-flight backup on remount.
    #[arg(short = 'N', long = "no-kill")]
    pub no_kill: bool,

    /// Enable the advisory lock-file registry.
    #[arg(short = 'k', long = "use-locks")]
    pub use_locks: bool,

    /// Lock directory (default: /var/lock/<module-name>).
    #[arg(short = 'r', long = "lock-dir")]
    pub lock_dir: Option<PathBuf>,

    /// Enable multi-alias reference counting.
    #[arg(short = 'a', long = "multipath")]
    pub multipath: bool,

    /// Alias prefix character.
    #[arg(short = 'x', long = "prefix", default_value_t = '.')]
    pub prefix: char,
}

/// What happens to an in-flight backup child when its name is remounted
/// before the backup finishes. Collapses the mutually exclusive
/// `--wait-for-backup` / `--no-kill` flags into one choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountPolicy {
    /// Kill the backup immediately (the default).
    Kill,
    /// Block the missing handler until the backup finishes.
    Wait,
    /// Neither: leave the backup running and proceed with the remount.
    Ignore,
}

/// Validated, range-checked daemon configuration built from [`Cli`].
#[derive(Debug, Clone)]
pub struct Config {
    pub directory: PathBuf,
    pub module: PathBuf,
    pub module_options: Option<String>,
    pub timeout: u64,
    pub pidfile: Option<PathBuf>,
    pub foreground: bool,
    pub verbose: bool,
    pub backup: Option<String>,
    pub wait: u64,
    pub max_backups: i64,
    pub nice: Option<i32>,
    pub backup_life: Option<u64>,
    pub remount_policy: RemountPolicy,
    pub use_locks: bool,
    pub lock_dir: PathBuf,
    pub multipath: bool,
    pub prefix: u8,
}

const MAX_WAIT: u64 = 86_400;

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, AutofsError> {
        if !cli.directory.is_absolute() {
            return Err(AutofsError::Config(format!(
                "--directory {:?} must be an absolute path",
                cli.directory
            )));
        }
        if !cli.module.is_absolute() {
            return Err(AutofsError::Config(format!(
                "--module {:?} must be an absolute path",
                cli.module
            )));
        }
        if cli.wait > MAX_WAIT {
            return Err(AutofsError::Config(format!(
                "--wait {} exceeds the maximum of {} seconds",
                cli.wait, MAX_WAIT
            )));
        }
        if cli.max_backups < 1 {
            return Err(AutofsError::Config(
                "--max-backups must be at least 1".to_string(),
            ));
        }
        if !cli.prefix.is_ascii_graphic() {
            return Err(AutofsError::Config(format!(
                "--prefix {:?} must be a printable ASCII character",
                cli.prefix
            )));
        }

        let nice = match cli.priority {
            None => None,
            Some(p) if (1..=40).contains(&p) => Some(priority_to_nice(p)),
            Some(p) => {
                return Err(AutofsError::Config(format!(
                    "--priority {} must be in 1..40",
                    p
                )));
            }
        };

        let remount_policy = match (cli.wait_for_backup, cli.no_kill) {
            (true, true) => {
                return Err(AutofsError::Config(
                    "--wait-for-backup and --no-kill are mutually exclusive".to_string(),
                ));
            }
            (true, false) => RemountPolicy::Wait,
            (false, true) => RemountPolicy::Ignore,
            (false, false) => RemountPolicy::Kill,
        };

        let lock_dir = match cli.lock_dir {
            Some(dir) => dir,
            None => default_lock_dir(&cli.module),
        };

        Ok(Self {
            directory: cli.directory,
            module: cli.module,
            module_options: cli.options,
            timeout: cli.timeout,
            pidfile: cli.pidfile,
            foreground: cli.foreground,
            verbose: cli.verbose,
            backup: cli.backup,
            wait: cli.wait,
            max_backups: cli.max_backups,
            nice,
            backup_life: cli.backup_life,
            remount_policy,
            use_locks: cli.use_locks,
            lock_dir,
            multipath: cli.multipath,
            prefix: cli.prefix as u8,
        })
    }
}

/// Maps the CLI's 1..40 nice scale onto the kernel's -20..20 range, the
/// same linear transform `options.c`'s `autodir_option_priority` applies.
fn priority_to_nice(priority: i32) -> i32 {
    priority - 20
}

fn default_lock_dir(module: &Path) -> PathBuf {
    let stem = module
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "autofsd".to_string());
    PathBuf::from("/var/lock").join(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            directory: PathBuf::from("/mnt/home"),
            module: PathBuf::from("/usr/lib/autofsd/home.so"),
            options: None,
            timeout: 300,
            pidfile: None,
            foreground: false,
            verbose: false,
            backup: None,
            wait: 0,
            max_backups: 200,
            priority: None,
            backup_life: None,
            wait_for_backup: false,
            no_kill: false,
            use_locks: false,
            lock_dir: None,
            multipath: false,
            prefix: '.',
        }
    }

    #[test]
    fn relative_directory_is_rejected() {
        let mut cli = base_cli();
        cli.directory = PathBuf::from("mnt/home");
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn wait_over_max_is_rejected() {
        let mut cli = base_cli();
        cli.wait = MAX_WAIT + 1;
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn priority_maps_onto_nice_range() {
        let mut cli = base_cli();
        cli.priority = Some(1);
        let cfg = Config::from_cli(cli).unwrap();
        assert_eq!(cfg.nice, Some(-19));

        let mut cli = base_cli();
        cli.priority = Some(40);
        let cfg = Config::from_cli(cli).unwrap();
        assert_eq!(cfg.nice, Some(20));
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let mut cli = base_cli();
        cli.priority = Some(41);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn wait_for_backup_and_no_kill_are_mutually_exclusive() {
        let mut cli = base_cli();
        cli.wait_for_backup = true;
        cli.no_kill = true;
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn default_lock_dir_derives_from_module_stem() {
        let cli = base_cli();
        let cfg = Config::from_cli(cli).unwrap();
        assert_eq!(cfg.lock_dir, PathBuf::from("/var/lock/home"));
    }
}
