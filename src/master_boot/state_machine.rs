//! Driving a board from whatever it runs into a ready master image shell.
//!
//! The following state diagram summarizes the different states and
//! transitions the boot goes through. Any step hitting a timeout or the end of
//! the console stream transitions to `Failed`, naming the step. There is no
//! retry within one boot.
//!
//! ```text
//!        START
//!          |
//!          v
//!   .------------.  bootdev network
//!   | PoweredOff |  + reset
//!   '------------'
//!          |
//!          v
//!   .------------.  recovery
//!   |  Booting   |  marker
//!   '------------'
//!          |
//!          v
//!   .------------------.  PS1
//!   | AtRecoveryPrompt |  override
//!   '------------------'
//!          |
//!          v
//!   .------------.  configure_networking
//!   | ShellReady |  -> address
//!   '------------'
//!          |
//!          v
//!   .------------.  ipconfig
//!   | NetworkUp  |  -> dns0
//!   '------------'
//!          |
//!          v
//!   .---------------.  resolv.conf
//!   | DnsConfigured |
//!   '---------------'
//!          |
//!          v
//!      ***********
//!      *  Ready  *
//!      ***********
//! ```

use log::info;

use super::events::*;
use super::states::*;
use crate::board::MasterImage;
use crate::console::ConsoleSession;
use crate::error::Result;
use crate::power::PowerController;
use crate::settings::Timeouts;

// =============================================================================
// Public Interface
// =============================================================================

/// The master image boot state machine. Use the `factory()` function to get
/// an instance then run it by calling its `run()` method.
pub struct MasterBoot<'a> {
    session: ConsoleSession,
    power: &'a mut dyn PowerController,
    master: MasterImage,
    timeouts: Timeouts,
}
impl<'a> MasterBoot<'a> {
    /// Run the state machine until the master image is ready or a step failed.
    ///
    /// The console session is always handed back, so that the caller can log
    /// its transcript and keep driving the board.
    pub fn run(self) -> (ConsoleSession, Result<MasterEnv>) {
        let plan = match BootPlan::new(&self.master, self.timeouts) {
            Ok(plan) => plan,
            // Unusable master image conventions, the board is left alone.
            Err(error) => return (self.session, Err(error)),
        };

        // The same machine naturally starts in the `PoweredOff` state.
        let mut sm = MasterBootStates::PoweredOff(MasterBootSM {
            plan,
            state: PoweredOffState {
                session: self.session,
                power: self.power,
            },
        });
        loop {
            sm = match sm.step() {
                MasterBootStates::Ready(sm) => {
                    info!("=> Ready ({})", sm.state.env.ip);
                    return (sm.state.session, Ok(sm.state.env));
                }
                MasterBootStates::Failed(sm) => {
                    info!("=> Failed");
                    return (sm.state.session, Err(sm.state.error));
                }
                other => other,
            };
        }
    }
}

/// Factory function for the master boot state machine. Use it to get an
/// instance, which you can run by invoking its `run()` method.
pub fn factory<'a>(
    session: ConsoleSession,
    power: &'a mut dyn PowerController,
    master: &MasterImage,
    timeouts: Timeouts,
) -> MasterBoot<'a> {
    MasterBoot {
        session,
        power,
        master: master.clone(),
        timeouts,
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine. The plan is shared by all states, the state holds
/// the console session.
#[derive(Debug)]
struct MasterBootSM<S> {
    plan: BootPlan,
    state: S,
}
impl<S: Runnable> MasterBootSM<S> {
    fn run(self) -> Event {
        let MasterBootSM { plan, state } = self;
        state.run(&plan)
    }
}

/// An enum wrapper around the states of the state machine, used for pattern
/// matching during state transitions.
#[derive(Debug)]
enum MasterBootStates<'a> {
    PoweredOff(MasterBootSM<PoweredOffState<'a>>),
    Booting(MasterBootSM<BootingState>),
    AtRecoveryPrompt(MasterBootSM<AtRecoveryPromptState>),
    ShellReady(MasterBootSM<ShellReadyState>),
    NetworkUp(MasterBootSM<NetworkUpState>),
    DnsConfigured(MasterBootSM<DnsConfiguredState>),
    Ready(MasterBootSM<ReadyState>),
    Failed(MasterBootSM<FailedState>),
}
impl<'a> MasterBootStates<'a> {
    /// The unit of work in the state machine event loop. Runs the current
    /// state and transitions on the event it fired. Only the transitions
    /// implemented with `From` are possible.
    fn step(self) -> Self {
        match self {
            MasterBootStates::PoweredOff(sm) => match sm.run() {
                Event::Boot(ev) => MasterBootStates::Booting(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state PoweredOff", event),
            },
            MasterBootStates::Booting(sm) => match sm.run() {
                Event::MarkerSeen(ev) => MasterBootStates::AtRecoveryPrompt(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state Booting", event),
            },
            MasterBootStates::AtRecoveryPrompt(sm) => match sm.run() {
                Event::PromptSet(ev) => MasterBootStates::ShellReady(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state AtRecoveryPrompt", event),
            },
            MasterBootStates::ShellReady(sm) => match sm.run() {
                Event::NetworkUp(ev) => MasterBootStates::NetworkUp(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state ShellReady", event),
            },
            MasterBootStates::NetworkUp(sm) => match sm.run() {
                Event::DnsFound(ev) => MasterBootStates::DnsConfigured(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state NetworkUp", event),
            },
            MasterBootStates::DnsConfigured(sm) => match sm.run() {
                Event::Ready(ev) => MasterBootStates::Ready(ev.into()),
                Event::Failed(ev) => MasterBootStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at state DnsConfigured", event),
            },
            // Terminal states
            done @ MasterBootStates::Ready(_) | done @ MasterBootStates::Failed(_) => done,
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<BootEvent> for MasterBootSM<BootingState> {
    fn from(event: BootEvent) -> MasterBootSM<BootingState> {
        MasterBootSM {
            plan: event.plan,
            state: BootingState {
                session: event.session,
            },
        }
    }
}

impl From<MarkerSeenEvent> for MasterBootSM<AtRecoveryPromptState> {
    fn from(event: MarkerSeenEvent) -> MasterBootSM<AtRecoveryPromptState> {
        MasterBootSM {
            plan: event.plan,
            state: AtRecoveryPromptState {
                session: event.session,
            },
        }
    }
}

impl From<PromptSetEvent> for MasterBootSM<ShellReadyState> {
    fn from(event: PromptSetEvent) -> MasterBootSM<ShellReadyState> {
        MasterBootSM {
            plan: event.plan,
            state: ShellReadyState {
                session: event.session,
            },
        }
    }
}

impl From<NetworkUpEvent> for MasterBootSM<NetworkUpState> {
    fn from(event: NetworkUpEvent) -> MasterBootSM<NetworkUpState> {
        MasterBootSM {
            plan: event.plan,
            state: NetworkUpState {
                session: event.session,
                ip: event.ip,
            },
        }
    }
}

impl From<DnsFoundEvent> for MasterBootSM<DnsConfiguredState> {
    fn from(event: DnsFoundEvent) -> MasterBootSM<DnsConfiguredState> {
        MasterBootSM {
            plan: event.plan,
            state: DnsConfiguredState {
                session: event.session,
                ip: event.ip,
                dns: event.dns,
            },
        }
    }
}

impl From<ReadyEvent> for MasterBootSM<ReadyState> {
    fn from(event: ReadyEvent) -> MasterBootSM<ReadyState> {
        MasterBootSM {
            plan: event.plan,
            state: ReadyState {
                session: event.session,
                env: event.env,
            },
        }
    }
}

impl From<FailedEvent> for MasterBootSM<FailedState> {
    fn from(event: FailedEvent) -> MasterBootSM<FailedState> {
        MasterBootSM {
            plan: event.plan,
            state: FailedState {
                session: event.session,
                error: event.error,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
