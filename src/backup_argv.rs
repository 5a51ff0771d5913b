//! Backup argv template expansion (C9).
//!
//! The `-b/--backup` argument is a whitespace-split template. Each word
//! is classified once, at startup, as *static* (no `%`) or *dynamic*
//! (contains `%`). At fork time every dynamic word has `%N`/`%L`/`%K`
//! substituted for the canonical name, real path, and hostname; any other
//! `%X` survives the first pass and is handed to `strftime` using the
//! fork-time local time, matching the original's two-stage expansion.

use std::ffi::CString;
use std::os::raw::c_char;

const ARG_BUF_SIZE: usize = 4096 + 256;

#[derive(Debug, Clone)]
enum Arg {
    Static(String),
    Dynamic(String),
}

/// Parsed backup argv template, ready to be expanded per fork.
#[derive(Debug, Clone)]
pub struct BackupArgv {
    args: Vec<Arg>,
    hostname: String,
}

impl BackupArgv {
    /// Split `template` on whitespace and classify each word. Returns
    /// `None` if no backup program was configured (`-b` omitted).
    pub fn new(template: Option<&str>) -> std::io::Result<Option<Self>> {
        let Some(template) = template else {
            return Ok(None);
        };
        let hostname = gethostname()?;
        let args = template
            .split_whitespace()
            .map(|word| {
                if word.contains('%') {
                    Arg::Dynamic(word.to_string())
                } else {
                    Arg::Static(word.to_string())
                }
            })
            .collect();
        Ok(Some(Self { args, hostname }))
    }

    /// Build the argv (without argv[0] — the program name from `-b` is
    /// itself the first static word) for a single backup invocation,
    /// expanding dynamic arguments against `name`/`real_path` and the
    /// fork-time local time.
    pub fn expand(&self, name: &str, real_path: &str) -> std::io::Result<Vec<CString>> {
        let mut out = Vec::with_capacity(self.args.len());
        let tm = now_local()?;
        for arg in &self.args {
            let expanded = match arg {
                Arg::Static(s) => s.clone(),
                Arg::Dynamic(template) => {
                    expand_one(template, name, real_path, &self.hostname, &tm)?
                }
            };
            out.push(
                CString::new(expanded)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul byte in backup argv"))?,
            );
        }
        Ok(out)
    }
}

fn expand_one(
    template: &str,
    name: &str,
    real_path: &str,
    hostname: &str,
    tm: &libc::tm,
) -> std::io::Result<String> {
    let mut first_pass = String::with_capacity(template.len());
    let mut needs_strftime = false;
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            first_pass.push(c);
            continue;
        }
        match chars.next() {
            Some('L') => first_pass.push_str(real_path),
            Some('N') => first_pass.push_str(name),
            Some('K') => first_pass.push_str(hostname),
            Some(other) => {
                first_pass.push('%');
                first_pass.push(other);
                needs_strftime = true;
            }
            None => first_pass.push('%'),
        }
    }

    if !needs_strftime {
        return Ok(first_pass);
    }

    strftime_expand(&first_pass, tm)
}

const HOSTNAME_LEN: usize = 64;

fn gethostname() -> std::io::Result<String> {
    let mut buf = vec![0u8; HOSTNAME_LEN + 1];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut c_char, buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(nul);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn now_local() -> std::io::Result<libc::tm> {
    unsafe {
        let t = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&t, &mut tm).is_null() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(tm)
    }
}

fn strftime_expand(fmt: &str, tm: &libc::tm) -> std::io::Result<String> {
    let c_fmt = CString::new(fmt)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul byte in backup argv format"))?;
    let mut buf = vec![0u8; ARG_BUF_SIZE];
    let written = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut c_char,
            buf.len(),
            c_fmt.as_ptr(),
            tm,
        )
    };
    if written == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "strftime expansion failed or produced an empty result",
        ));
    }
    buf.truncate(written);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_args_pass_through_unchanged() {
        let argv = BackupArgv::new(Some("/usr/bin/backup --quiet")).unwrap().unwrap();
        let expanded = argv.expand("u", "/real/u").unwrap();
        assert_eq!(expanded[0].to_str().unwrap(), "/usr/bin/backup");
        assert_eq!(expanded[1].to_str().unwrap(), "--quiet");
    }

    #[test]
    fn substitutes_name_path_and_host() {
        let argv = BackupArgv::new(Some("prog --name=%N --path=%L --host=%K"))
            .unwrap()
            .unwrap();
        let expanded = argv.expand("u", "/real/u").unwrap();
        assert_eq!(expanded[1].to_str().unwrap(), "--name=u");
        assert_eq!(expanded[2].to_str().unwrap(), "--path=/real/u");
    }

    #[test]
    fn no_backup_template_yields_none() {
        assert!(BackupArgv::new(None).unwrap().is_none());
    }
}
