//! States for the master image boot state machine.
//!
//! This modules is private and restricted to the
//! [`master_boot`](crate::master_boot) scope. The public interface of the
//! state machine is provided by [`master_boot`](crate::master_boot).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;
use std::time::Duration;

use log::{debug, info};
use regex::Regex;

use super::events::*;
use crate::board::MasterImage;
use crate::console::{literal, literal_pattern, Captures, ConsoleSession, Outcome, IP_PATTERN};
use crate::error::{Error, Result};
use crate::power::{BootDevice, PowerController};
use crate::settings::Timeouts;

// =============================================================================
// Public Interface
// =============================================================================

/// What the master image learned while bringing its network up.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MasterEnv {
    /// Address of the board on the network.
    pub ip: String,
    /// The DNS server it was given.
    pub dns: String,
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Everything the states share: the master image conventions of the board and
/// the patterns derived from them.
#[derive(Debug, Clone)]
pub(crate) struct BootPlan {
    pub master: MasterImage,
    pub marker: Regex,
    pub prompt: Regex,
    pub timeouts: Timeouts,
}
impl BootPlan {
    pub fn new(master: &MasterImage, timeouts: Timeouts) -> Result<Self> {
        let marker = Regex::new(&master.marker).map_err(|e| {
            Error::Config(format!("invalid master image marker {:?}: {}", master.marker, e))
        })?;
        Ok(BootPlan {
            master: master.clone(),
            marker,
            prompt: literal(&master.prompt),
            timeouts,
        })
    }
}

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// The state is consumed by the call. When finished, it requests a
    /// transition to a new state by returning the appropriate `event`, which
    /// carries the console session along.
    fn run(self, plan: &BootPlan) -> Event;
}

/// The `export` line overriding the shell prompt with `prompt`.
///
/// The literal is split in two quoted halves, so that the echo of the command
/// itself never matches the prompt.
pub(crate) fn prompt_override(prompt: &str) -> String {
    let middle = prompt
        .char_indices()
        .nth(prompt.chars().count() / 2)
        .map_or(prompt.len(), |(i, _)| i);
    let (head, tail) = prompt.split_at(middle);
    format!("export PS1='{}''{}'", head, tail)
}

// PoweredOff State ============================================================

/// The initial state. Nothing is known about the board, it may be running
/// anything or nothing at all.
pub(crate) struct PoweredOffState<'a> {
    pub session: ConsoleSession,
    pub power: &'a mut dyn PowerController,
}
impl<'a> Runnable for PoweredOffState<'a> {
    /// Select the network as boot device and reset the board.
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> PoweredOff");
        let PoweredOffState {
            mut session,
            power,
        } = self;

        // Whatever was printed before the reset must not be mistaken for the
        // new boot.
        session.discard_pending();
        let result = power
            .set_boot_device(BootDevice::Network)
            .and_then(|_| power.reset());
        match result {
            Ok(()) => Event::Boot(BootEvent {
                plan: plan.clone(),
                session,
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}
impl<'a> fmt::Debug for PoweredOffState<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoweredOffState")
            .field("session", &self.session)
            .finish()
    }
}

// Booting State ===============================================================

#[derive(Debug)]
pub(crate) struct BootingState {
    pub session: ConsoleSession,
}
impl Runnable for BootingState {
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> Booting");
        let mut session = self.session;
        let step = exchange(
            &mut session,
            "boot into the master image",
            None,
            &[plan.marker.clone()],
            plan.timeouts.boot,
        );
        match step {
            Ok(_) => Event::MarkerSeen(MarkerSeenEvent {
                plan: plan.clone(),
                session,
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}

// AtRecoveryPrompt State ======================================================

#[derive(Debug)]
pub(crate) struct AtRecoveryPromptState {
    pub session: ConsoleSession,
}
impl Runnable for AtRecoveryPromptState {
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> AtRecoveryPrompt");
        let mut session = self.session;
        let step = exchange(
            &mut session,
            "set the master image prompt",
            Some(&prompt_override(&plan.master.prompt)),
            &[plan.prompt.clone()],
            plan.timeouts.prompt,
        );
        match step {
            Ok(_) => Event::PromptSet(PromptSetEvent {
                plan: plan.clone(),
                session,
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}

// ShellReady State ============================================================

#[derive(Debug)]
pub(crate) struct ShellReadyState {
    pub session: ConsoleSession,
}
impl Runnable for ShellReadyState {
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> ShellReady");
        let mut session = self.session;
        match bring_up_network(&mut session, plan) {
            Ok(ip) => Event::NetworkUp(NetworkUpEvent {
                plan: plan.clone(),
                session,
                ip,
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}

fn bring_up_network(session: &mut ConsoleSession, plan: &BootPlan) -> Result<String> {
    let prompt = [plan.prompt.clone()];
    let command = plan.timeouts.command;

    exchange(
        session,
        "load the network functions",
        Some(". /scripts/functions"),
        &prompt,
        command,
    )?;
    let captures = exchange(
        session,
        "bring up the network",
        Some(&format!(
            "DEVICE={} configure_networking",
            plan.master.interface
        )),
        &[literal_pattern(&format!("address: {}", IP_PATTERN))],
        plan.timeouts.network,
    )?;
    exchange(session, "bring up the network", None, &prompt, command)?;
    captured_address(&captures, "bring up the network")
}

// NetworkUp State =============================================================

#[derive(Debug)]
pub(crate) struct NetworkUpState {
    pub session: ConsoleSession,
    pub ip: String,
}
impl Runnable for NetworkUpState {
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> NetworkUp ({})", self.ip);
        let NetworkUpState { mut session, ip } = self;
        match find_dns(&mut session, plan) {
            Ok(dns) => Event::DnsFound(DnsFoundEvent {
                plan: plan.clone(),
                session,
                ip,
                dns,
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}

fn find_dns(session: &mut ConsoleSession, plan: &BootPlan) -> Result<String> {
    let command = plan.timeouts.command;
    let captures = exchange(
        session,
        "find the DNS server",
        Some(&format!("ipconfig {}", plan.master.interface)),
        &[literal_pattern(&format!(r"dns0\s*:\s*{}", IP_PATTERN))],
        command,
    )?;
    exchange(
        session,
        "find the DNS server",
        None,
        &[plan.prompt.clone()],
        command,
    )?;
    captured_address(&captures, "find the DNS server")
}

// DnsConfigured State =========================================================

#[derive(Debug)]
pub(crate) struct DnsConfiguredState {
    pub session: ConsoleSession,
    pub ip: String,
    pub dns: String,
}
impl Runnable for DnsConfiguredState {
    fn run(self, plan: &BootPlan) -> Event {
        info!("=> DnsConfigured ({})", self.dns);
        let DnsConfiguredState {
            mut session,
            ip,
            dns,
        } = self;
        let step = exchange(
            &mut session,
            "configure name resolution",
            Some(&format!("echo nameserver {} > /etc/resolv.conf", dns)),
            &[plan.prompt.clone()],
            plan.timeouts.command,
        );
        match step {
            Ok(_) => Event::Ready(ReadyEvent {
                plan: plan.clone(),
                session,
                env: MasterEnv { ip, dns },
            }),
            Err(error) => failed(plan, session, error),
        }
    }
}

// Terminal states =============================================================

/// The master image is up, its shell sits at the known prompt.
#[derive(Debug)]
pub(crate) struct ReadyState {
    pub session: ConsoleSession,
    pub env: MasterEnv,
}

/// A step failed, the error names it.
#[derive(Debug)]
pub(crate) struct FailedState {
    pub session: ConsoleSession,
    pub error: Error,
}

// =============================================================================
// Private stuff
// =============================================================================

/// Optionally send a line, then wait for `patterns`. Timeout and end of
/// stream are critical, the board cannot be driven any further.
fn exchange(
    session: &mut ConsoleSession,
    step: &str,
    send: Option<&str>,
    patterns: &[Regex],
    timeout: Duration,
) -> Result<Captures> {
    if let Some(line) = send {
        session
            .send_line(line)
            .map_err(|e| e.into_critical(format!("Failed to {}", step)))?;
    }
    match session.expect(patterns, timeout) {
        Outcome::Matched(captures) => Ok(captures),
        other => Err(Error::critical(format!(
            "Failed to {}: {} waiting for {:?}",
            step, other, patterns
        ))),
    }
}

fn captured_address(captures: &Captures, step: &str) -> Result<String> {
    match captures.group(1) {
        Some(address) => {
            debug!("{}: {}", step, address);
            Ok(address.to_owned())
        }
        None => Err(Error::critical(format!("Failed to {}: no address", step))),
    }
}

fn failed(plan: &BootPlan, session: ConsoleSession, error: Error) -> Event {
    Event::Failed(FailedEvent {
        plan: plan.clone(),
        session,
        error,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn prompt_override_never_contains_the_prompt() {
    let line = prompt_override("root@master# ");
    assert_eq!(line, "export PS1='root@m''aster# '");
    assert!(!line.contains("root@master# "));
}
