//! Command execution on top of a [`ConsoleSession`].

use std::ops::{Deref, DerefMut};
use std::slice;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use regex::Regex;

use super::session::{Captures, ConsoleSession, Outcome};
use crate::error::{Error, Result};
use crate::settings::Timeouts;

/// The command sent after each command to recover its exit status.
const STATUS_PROBE: &str = "echo x$?x";
/// What the board prints back for [`STATUS_PROBE`].
const STATUS_PATTERN: &str = r"x([0-9]+)x";
/// An IPv4 address, as a capture group.
pub(crate) const IP_PATTERN: &str = r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})";

// =============================================================================
// Public Interface
// =============================================================================

/// Options of [`CommandRunner::run`], built like the settings.
///
/// **Example**
///
/// ```ignore
/// let options = RunOptions::new()
///     .response(Regex::new(r"address: (\S+)")?)
///     .timeout(Duration::from_secs(60))
///     .fail_ok();
/// ```
#[derive(Debug, Clone)]
pub struct RunOptions {
    response: Vec<Regex>,
    timeout: Option<Duration>,
    fail_ok: bool,
    wait_for_prompt: bool,
}
impl Default for RunOptions {
    fn default() -> Self {
        Self::new()
    }
}
impl RunOptions {
    pub fn new() -> Self {
        RunOptions {
            response: Vec::new(),
            timeout: None,
            fail_ok: false,
            wait_for_prompt: true,
        }
    }

    /// Wait for one of these patterns after sending the command. The patterns
    /// accumulate in the order they are added.
    pub fn response(mut self, pattern: Regex) -> Self {
        self.response.push(pattern);
        self
    }

    /// Override the default command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Do not fail when the command exits with a non-zero status.
    pub fn fail_ok(mut self) -> Self {
        self.fail_ok = true;
        self
    }

    /// Return right after the response, without waiting for the prompt and
    /// without recovering the exit status.
    pub fn no_prompt(mut self) -> Self {
        self.wait_for_prompt = false;
        self
    }
}

/// What came out of running one command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command. `None` when status recovery was skipped.
    pub exit_code: Option<i32>,
    /// Outcome of waiting for the caller supplied response patterns.
    pub response: Option<Outcome>,
    /// Console output of the command, without its echo.
    pub output: String,
}
impl CommandResult {
    pub fn matched(&self) -> Option<&Captures> {
        self.response.as_ref().and_then(Outcome::captures)
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs shell commands on a board console sitting at a known prompt.
pub struct CommandRunner<'s> {
    session: &'s mut ConsoleSession,
    prompt: Regex,
    status: Regex,
    timeouts: Timeouts,
}

impl<'s> CommandRunner<'s> {
    /// `prompt` is the literal prompt of the shell, not a pattern.
    pub fn new(session: &'s mut ConsoleSession, prompt: &str, timeouts: Timeouts) -> Self {
        CommandRunner {
            session,
            prompt: literal(prompt),
            status: literal_pattern(STATUS_PATTERN),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn session(&mut self) -> &mut ConsoleSession {
        self.session
    }

    /// Send `command` and wait for it to complete.
    ///
    /// Unless `no_prompt` was requested, the exit status is recovered with a
    /// status probe. A non-zero status fails the run unless `fail_ok` is set.
    /// A probe that cannot be matched always fails the run.
    pub fn run(&mut self, command: &str, options: RunOptions) -> Result<CommandResult> {
        let timeout = options.timeout.unwrap_or(self.timeouts.command);
        self.session.send_line(command)?;

        let mut output = String::new();
        let response = if options.response.is_empty() {
            None
        } else {
            let outcome = self.session.expect(&options.response, timeout);
            if let Outcome::Matched(captures) = &outcome {
                output.push_str(&captures.before);
                output.push_str(captures.group(0).unwrap_or_default());
            }
            Some(outcome)
        };

        if !options.wait_for_prompt {
            return Ok(CommandResult {
                exit_code: None,
                response,
                output: strip_echo(&output, command),
            });
        }

        match self.session.expect(slice::from_ref(&self.prompt), timeout) {
            Outcome::Matched(captures) => output.push_str(&captures.before),
            other => {
                if other == Outcome::Timeout {
                    self.interrupt(command);
                }
                return Err(Error::OperationFailed(format!(
                    "no prompt after {:?} ({})",
                    command, other
                )));
            }
        }

        let code = self.probe_status(command)?;
        if code != 0 && !options.fail_ok {
            return Err(Error::OperationFailed(format!(
                "executing {:?} failed with code {}",
                command, code
            )));
        }

        Ok(CommandResult {
            exit_code: Some(code),
            response,
            output: strip_echo(&output, command),
        })
    }

    /// Stop `command` with `Ctrl+C` so that the next command starts at a
    /// fresh prompt.
    fn interrupt(&mut self, command: &str) {
        info!("Interrupting {:?}", command);
        if let Err(e) = self.session.send_control('c') {
            warn!("{}", e);
            return;
        }
        let outcome = self
            .session
            .expect(slice::from_ref(&self.prompt), self.timeouts.status_probe);
        if !outcome.is_matched() {
            warn!("No prompt after interrupting {:?} ({})", command, outcome);
        }
    }

    fn probe_status(&mut self, command: &str) -> Result<i32> {
        self.session.send_line(STATUS_PROBE)?;
        let probe_timeout = self.timeouts.status_probe;
        let code = match self
            .session
            .expect(slice::from_ref(&self.status), probe_timeout)
        {
            Outcome::Matched(captures) => captures.group(1).and_then(|c| c.parse::<i32>().ok()),
            _ => None,
        };
        let code = code.ok_or_else(|| {
            Error::OperationFailed(format!(
                "could not recover the exit status of {:?}",
                command
            ))
        })?;

        // The probe brings its own prompt back.
        if !self
            .session
            .expect(slice::from_ref(&self.prompt), probe_timeout)
            .is_matched()
        {
            return Err(Error::OperationFailed(format!(
                "no prompt after the exit status probe of {:?}",
                command
            )));
        }
        debug!("{:?} exited with {}", command, code);
        Ok(code)
    }
}

/// A [`CommandRunner`] for a board whose master image has its network up.
pub struct NetworkCommandRunner<'s> {
    runner: CommandRunner<'s>,
}

impl<'s> NetworkCommandRunner<'s> {
    pub fn new(runner: CommandRunner<'s>) -> Self {
        NetworkCommandRunner { runner }
    }

    /// Whether `path` exists on the board.
    pub fn is_file_exist(&mut self, path: &str) -> Result<bool> {
        let result = self.run(&format!("ls {} > /dev/null", path), RunOptions::new().fail_ok())?;
        Ok(result.succeeded())
    }

    /// Discover the IPv4 address of `interface`.
    pub fn get_master_ip(&mut self, interface: &str) -> Result<String> {
        let command = format!(
            "ifconfig {} | grep 'inet addr' | awk -F: '{{print $2}}' | awk '{{print \"<\" $1 \">\"}}'",
            interface
        );
        let pattern = literal_pattern(&format!("<{}>", IP_PATTERN));
        let result = self.run(
            &command,
            RunOptions::new()
                .response(pattern)
                .timeout(Duration::from_secs(5)),
        )?;
        match result.matched().and_then(|c| c.group(1)) {
            Some(ip) => {
                debug!("Master image IP is {}", ip);
                Ok(ip.to_owned())
            }
            None => {
                let msg = "Unable to determine master image IP address";
                error!("{}", msg);
                Err(Error::critical(msg))
            }
        }
    }

    /// Ping `server` until one packet comes back or `timeout` expires.
    pub fn wait_network_up(&mut self, server: &str, timeout: Duration) -> Result<()> {
        info!("Waiting for network to come up");
        let deadline = Instant::now() + timeout;
        let command = format!("LC_ALL=C ping -W4 -c1 {}", server);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self.run(
                &command,
                RunOptions::new()
                    .response(literal_pattern("1 received|1 packets received"))
                    .response(literal_pattern("0 received|0 packets received"))
                    .response(literal_pattern("Network is unreachable"))
                    .timeout(std::cmp::max(remaining, Duration::from_secs(1)))
                    .fail_ok(),
            )?;
            if result.matched().map(|c| c.index) == Some(0) {
                info!("Network is up");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::critical(format!(
                    "Unable to reach {}, check network",
                    server
                )));
            }
            thread::sleep(std::cmp::min(remaining, Duration::from_secs(1)));
        }
    }
}

impl<'s> Deref for NetworkCommandRunner<'s> {
    type Target = CommandRunner<'s>;

    fn deref(&self) -> &Self::Target {
        &self.runner
    }
}

impl<'s> DerefMut for NetworkCommandRunner<'s> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.runner
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// A pattern matching `text` literally.
pub(crate) fn literal(text: &str) -> Regex {
    literal_pattern(&regex::escape(text))
}

/// Compile one of the crate's own patterns. Those are known to be valid, the
/// fallback never matches anything.
pub(crate) fn literal_pattern(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| {
        error!("invalid pattern {:?}: {}", pattern, e);
        never()
    })
}

fn never() -> Regex {
    // An empty character class cannot match.
    Regex::new(r"[^\s\S]").unwrap_or_else(|_| unreachable!())
}

/// Remove the echo of `command` from the start of `output`.
fn strip_echo(output: &str, command: &str) -> String {
    let trimmed = output.trim_start_matches(|c| c == '\r' || c == '\n');
    match trimmed.strip_prefix(command) {
        Some(rest) => rest.trim_start_matches(|c| c == '\r' || c == '\n').to_owned(),
        None => output.to_owned(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_timeouts, unique_host, SimBoard};

    const PROMPT: &str = "root@master# ";

    fn session(sim: &SimBoard) -> ConsoleSession {
        sim.set_prompt(PROMPT);
        ConsoleSession::open(&unique_host("runner"), sim.transport()).unwrap()
    }

    #[test]
    fn recovers_exit_status() {
        let sim = SimBoard::new();
        sim.on("^ls /mnt", "boot  root", 0);
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        let result = runner.run("ls /mnt", RunOptions::new()).unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("boot  root"));
        assert!(!result.output.starts_with("ls /mnt"));
    }

    #[test]
    fn nonzero_status_fails_with_command_and_code() {
        let sim = SimBoard::new();
        sim.on("^false$", "", 1);
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        match runner.run("false", RunOptions::new()) {
            Err(Error::OperationFailed(msg)) => {
                assert!(msg.contains("\"false\""));
                assert!(msg.contains("code 1"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn fail_ok_returns_the_status() {
        let sim = SimBoard::new();
        sim.on("^false$", "", 1);
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        let result = runner.run("false", RunOptions::new().fail_ok()).unwrap();
        assert_eq!(result.exit_code, Some(1));

        // The session is still in step with the board.
        let result = runner.run("true", RunOptions::new()).unwrap();
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn stuck_command_is_interrupted() {
        let sim = SimBoard::new();
        sim.hang_on("^cat /dev/ttyS0$");
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        let err = runner.run("cat /dev/ttyS0", RunOptions::new()).unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg) if msg.contains("timeout")));
        assert_eq!(sim.commands(), vec!["cat /dev/ttyS0", "^C"]);

        // Back at the prompt, the next command gets its own status.
        let result = runner.run("true", RunOptions::new()).unwrap();
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn unmatched_status_probe_fails_even_with_fail_ok() {
        let sim = SimBoard::new();
        sim.silence_status_probe();
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        let result = runner.run("true", RunOptions::new().fail_ok());
        assert!(matches!(result, Err(Error::OperationFailed(_))));
    }

    #[test]
    fn no_prompt_skips_status_recovery() {
        let sim = SimBoard::new();
        sim.on("configure_networking", "IP-Config: eth0 complete:\n address: 10.1.2.3 ", 0);
        let mut session = session(&sim);
        let mut runner = CommandRunner::new(&mut session, PROMPT, fast_timeouts());
        let result = runner
            .run(
                "DEVICE=eth0 configure_networking",
                RunOptions::new()
                    .response(literal_pattern(&format!("address: {}", IP_PATTERN)))
                    .no_prompt(),
            )
            .unwrap();
        assert_eq!(result.exit_code, None);
        assert_eq!(result.matched().unwrap().group(1), Some("10.1.2.3"));
        assert!(!sim.commands().iter().any(|c| c == STATUS_PROBE));
    }

    #[test]
    fn is_file_exist_uses_the_status() {
        let sim = SimBoard::new();
        sim.on("^ls /mnt/boot", "ls: /mnt/boot: No such file or directory", 1);
        let mut session = session(&sim);
        let mut runner =
            NetworkCommandRunner::new(CommandRunner::new(&mut session, PROMPT, fast_timeouts()));
        assert!(runner.is_file_exist("/mnt").unwrap());
        assert!(!runner.is_file_exist("/mnt/boot").unwrap());
    }

    #[test]
    fn get_master_ip() {
        let sim = SimBoard::new();
        sim.on("^ifconfig eth0", "<192.168.10.4>", 0);
        let mut session = session(&sim);
        let mut runner =
            NetworkCommandRunner::new(CommandRunner::new(&mut session, PROMPT, fast_timeouts()));
        assert_eq!(runner.get_master_ip("eth0").unwrap(), "192.168.10.4");
    }

    #[test]
    fn wait_network_up_gives_up_after_timeout() {
        let sim = SimBoard::new();
        sim.on("ping", "1 packets transmitted, 0 packets received", 1);
        let mut session = session(&sim);
        let mut runner =
            NetworkCommandRunner::new(CommandRunner::new(&mut session, PROMPT, fast_timeouts()));
        let result = runner.wait_network_up("10.0.0.1", Duration::from_millis(100));
        assert!(matches!(result, Err(Error::Critical { .. })));
    }

    #[test]
    fn wait_network_up_succeeds() {
        let sim = SimBoard::new();
        sim.on("ping", "1 packets transmitted, 1 packets received", 0);
        let mut session = session(&sim);
        let mut runner =
            NetworkCommandRunner::new(CommandRunner::new(&mut session, PROMPT, fast_timeouts()));
        runner
            .wait_network_up("10.0.0.1", Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn strip_echo_only_removes_the_command() {
        assert_eq!(strip_echo("ls\r\nfoo\r\n", "ls"), "foo\r\n");
        assert_eq!(strip_echo("foo", "ls"), "foo");
    }
}
