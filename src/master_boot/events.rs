//! Events for the master image boot state machine.
//!
//! This modules is private and restricted to the
//! [`master_boot`](crate::master_boot) scope. The public interface of the
//! state machine is provided by [`master_boot`](crate::master_boot).
//!
//! Every event carries the console session by value: the session moves from
//! one state to the next and is handed back to the caller at the end, whether
//! the boot succeeded or not.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::states::{BootPlan, MasterEnv};
use crate::console::ConsoleSession;
use crate::error::Error;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// BootEvent ===================================================================

/// Fired once the board was told to boot from the network and was reset.
#[derive(Debug)]
pub(crate) struct BootEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
}

// MarkerSeenEvent =============================================================

/// Fired when the recovery environment marker shows up on the console.
#[derive(Debug)]
pub(crate) struct MarkerSeenEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
}

// PromptSetEvent ==============================================================

/// Fired when the shell answers with the overridden prompt.
#[derive(Debug)]
pub(crate) struct PromptSetEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
}

// NetworkUpEvent ==============================================================

/// Fired when the master image got its address.
#[derive(Debug)]
pub(crate) struct NetworkUpEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
    pub ip: String,
}

// DnsFoundEvent ===============================================================

/// Fired when the DNS server handed over with the address is known.
#[derive(Debug)]
pub(crate) struct DnsFoundEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
    pub ip: String,
    pub dns: String,
}

// ReadyEvent ==================================================================

/// Fired when the name resolution is configured. The master image is ready
/// for use.
#[derive(Debug)]
pub(crate) struct ReadyEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
    pub env: MasterEnv,
}

// FailedEvent =================================================================

/// Fired by any state whose step failed. There is no recovery from it within
/// the same boot.
#[derive(Debug)]
pub(crate) struct FailedEvent {
    pub plan: BootPlan,
    pub session: ConsoleSession,
    pub error: Error,
}

// Events enum ==================================================================

/// Events that can be triggered within the master boot state machine.
#[derive(Debug)]
pub(crate) enum Event {
    Boot(BootEvent),
    MarkerSeen(MarkerSeenEvent),
    PromptSet(PromptSetEvent),
    NetworkUp(NetworkUpEvent),
    DnsFound(DnsFoundEvent),
    Ready(ReadyEvent),
    Failed(FailedEvent),
}
