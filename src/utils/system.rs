//! Running external programs on the host.

use std::borrow::Cow;
use std::io;
use std::process::{Command, Stdio};

use log::{debug, trace};

use crate::error::{Error, Result};

/// Exit status and combined stdout/stderr of a host command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ShellOutput {
    pub status: i32,
    pub output: String,
}

/// Runs programs on the host, one argument vector at a time.
pub trait Shell: Send + Sync {
    fn exec(&self, argv: &[String]) -> io::Result<ShellOutput>;
}

/// The real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl Shell for SystemShell {
    fn exec(&self, argv: &[String]) -> io::Result<ShellOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        debug!("$ {}", argv.join(" "));
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        trace!("{}", output);
        Ok(ShellOutput {
            // Killed by a signal
            status: out.status.code().unwrap_or(-1),
            output,
        })
    }
}

/// Run `argv` and return its output, failing with a runtime error when it
/// cannot be started or exits with a non-zero status.
pub(crate) fn run_checked(shell: &dyn Shell, argv: &[String], what: &str) -> Result<String> {
    let out = shell
        .exec(argv)
        .map_err(|e| Error::Runtime(format!("cannot run {}: {}", what, e)))?;
    if out.status != 0 {
        debug!("{} output:\n{}", what, out.output);
        return Err(Error::Runtime(format!(
            "{} failed with code {}: {}",
            what,
            out.status,
            out.output.trim()
        )));
    }
    Ok(out.output)
}

/// Build the argument vector of a host command, prefixed with `sudo` when
/// the tools need root privileges.
pub(crate) fn host_command(use_sudo: bool, args: &[&str]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    if use_sudo {
        argv.push("sudo".to_owned());
    }
    argv.extend(args.iter().map(|a| (*a).to_owned()));
    argv
}

/// Quote `word` for a POSIX shell command line. Words made of characters the
/// shell never interprets are returned as is.
pub(crate) fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = |c: char| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c);
    if !word.is_empty() && word.chars().all(plain) {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn system_shell_captures_output_and_status() {
    let argv: Vec<String> = vec!["sh".into(), "-c".into(), "echo out; echo err >&2; exit 3".into()];
    let out = SystemShell.exec(&argv).unwrap();
    assert_eq!(out.status, 3);
    assert!(out.output.contains("out"));
    assert!(out.output.contains("err"));
}

#[test]
fn run_checked_fails_on_nonzero_status() {
    let argv: Vec<String> = vec!["false".into()];
    let err = run_checked(&SystemShell, &argv, "false").unwrap_err();
    assert!(matches!(err, Error::Runtime(ref msg) if msg.contains("code 1")));
}

#[test]
fn host_command_with_sudo() {
    assert_eq!(
        host_command(true, &["umount", "/mnt"]),
        vec!["sudo", "umount", "/mnt"]
    );
    assert_eq!(host_command(false, &["umount", "/mnt"]), vec!["umount", "/mnt"]);
}

#[test]
fn shell_quote_only_when_needed() {
    assert_eq!(shell_quote("/mnt/var/log"), "/mnt/var/log");
    assert_eq!(shell_quote("/mnt/var/my dir"), "'/mnt/var/my dir'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
    assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    assert_eq!(shell_quote(""), "''");
}
