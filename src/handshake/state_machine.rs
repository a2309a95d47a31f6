//! Handshake state machine.
//!
//! A session reaches its ready state through a strictly sequential handshake.
//! Any state may fail, which ends the machine in `Done` with the error; the
//! session then is `Failed` and only a new connection cycle gets it back.
//!
//! The following state diagram summarizes the states and transitions of a
//! full [`Plan::Connect`] run. `Plan::Resync` enters at `Resync`,
//! `Plan::ChangeBaud` enters at `BaudSwitch`; both end in `Done` right after.
//!
//! ```text
//!   Opening --Sync--> Syncing --LoadStub--> StubLoad --Resync--> Resync
//!                                              |                   |
//!                                              | (skip stub)       |
//!                                              v                   |
//!                          Identity <--QueryIdentity---------------'
//!                              |
//!                              |--SwitchBaud--> BaudSwitch --.
//!                              |                             |
//!                              '-----------------------------+--Done--> Done --Exit--> Done
//!
//!   (every state) --Done(error)--> Done
//! ```

use super::events::*;
use super::states::*;
use crate::connection::Connection;
use crate::error::Result;
use crate::session::{CancelFlag, DeviceInfo, SessionState};
use crate::settings::Settings;
use crate::status::{Stage, StatusEmitter};
use crate::stub::StubImage;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Which sequence the machine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The full handshake, from a closed transport.
    Connect,
    /// Sync again with the loader of a ready session.
    Resync,
    /// Switch a ready session to another baud rate.
    ChangeBaud(u32),
}

impl Plan {
    /// Progress attached to the status event of `stage`. Only the full
    /// handshake has an overall completion to report.
    pub fn percent(self, stage: Stage) -> Option<u8> {
        match self {
            Plan::Connect => Some(stage.percent()),
            _ => None,
        }
    }
}

/// Everything the states work on. Owned by the session, lent to the machine
/// for the duration of a run.
pub(crate) struct Context {
    pub connection: Connection,
    pub settings: Settings,
    pub status: StatusEmitter,
    pub cancel: CancelFlag,
    pub stub: Option<StubImage>,
    pub state: SessionState,
    /// The baud rate the local side currently talks at.
    pub baud_rate: u32,
    pub device: Option<DeviceInfo>,
}

impl Context {
    /// Record the session state a machine state stands for.
    pub fn enter(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Report `stage`, once per attempt.
    pub fn report(&mut self, plan: Plan, stage: Stage) {
        self.status.emit(stage, plan.percent(stage));
    }
}

/// Run `plan` to completion against `context`.
pub(crate) fn run(context: &mut Context, plan: Plan) -> Result<()> {
    context.status.begin_attempt();
    factory(plan).run(context)
}

// =============================================================================
// Private stuff
// =============================================================================

/// The handshake state machine. Use [`factory`] to get an instance.
struct Handshake {
    sm: HandshakeStates,
}

impl Handshake {
    /// The event loop runs until the `Done` state is reached with its
    /// `should_exit` flag set, and returns the error the run ended with, if
    /// any.
    fn run(&mut self, context: &mut Context) -> Result<()> {
        loop {
            self.sm = self.sm.step(context);
            if let HandshakeStates::Done(sm) = &mut self.sm {
                if sm.state.should_exit {
                    return match sm.state.error.take() {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}

/// Each plan has its own entry state.
fn factory(plan: Plan) -> Handshake {
    let sm = match plan {
        Plan::Connect => HandshakeStates::Opening(HandshakeSM {
            plan,
            state: OpeningState {},
        }),
        Plan::Resync => HandshakeStates::Resync(ResyncEvent { plan }.into()),
        Plan::ChangeBaud(baud_rate) => {
            HandshakeStates::BaudSwitch(SwitchBaudEvent { plan, baud_rate }.into())
        }
    };
    Handshake { sm }
}

/// The raw state machine, holding the plan shared by all states and the
/// current state.
#[derive(Debug)]
struct HandshakeSM<S: Runnable> {
    plan: Plan,
    state: S,
}
impl<S: Runnable> HandshakeSM<S> {
    fn run(&mut self, context: &mut Context) -> Event {
        self.state.run(self.plan, context)
    }
}

/// An enum wrapper around the states of the handshake state machine.
enum HandshakeStates {
    Opening(HandshakeSM<OpeningState>),
    Syncing(HandshakeSM<SyncState>),
    StubLoad(HandshakeSM<StubLoadState>),
    Resync(HandshakeSM<ResyncState>),
    Identity(HandshakeSM<IdentityState>),
    BaudSwitch(HandshakeSM<BaudSwitchState>),
    Done(HandshakeSM<DoneState>),
}
impl HandshakeStates {
    /// The unit of work in the event loop: run the current state and
    /// transition on the event it returns. Transitions are `From`
    /// implementations, so an event can only lead to the state it was made
    /// for.
    fn step(&mut self, context: &mut Context) -> Self {
        match self {
            HandshakeStates::Opening(sm) => {
                let event = sm.run(context);
                match event {
                    Event::Sync(ev) => HandshakeStates::Syncing(ev.into()),
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::Syncing(sm) => {
                let event = sm.run(context);
                match event {
                    Event::LoadStub(ev) => HandshakeStates::StubLoad(ev.into()),
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::StubLoad(sm) => {
                let event = sm.run(context);
                match event {
                    Event::Resync(ev) => HandshakeStates::Resync(ev.into()),
                    Event::QueryIdentity(ev) => HandshakeStates::Identity(ev.into()),
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::Resync(sm) => {
                let event = sm.run(context);
                match event {
                    Event::QueryIdentity(ev) => HandshakeStates::Identity(ev.into()),
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::Identity(sm) => {
                let event = sm.run(context);
                match event {
                    Event::SwitchBaud(ev) => HandshakeStates::BaudSwitch(ev.into()),
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::BaudSwitch(sm) => {
                let event = sm.run(context);
                match event {
                    Event::Done(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            HandshakeStates::Done(sm) => {
                let event = sm.run(context);
                match event {
                    Event::Exit(ev) => HandshakeStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<SyncEvent> for HandshakeSM<SyncState> {
    fn from(event: SyncEvent) -> HandshakeSM<SyncState> {
        HandshakeSM {
            plan: event.plan,
            state: SyncState {},
        }
    }
}

impl From<LoadStubEvent> for HandshakeSM<StubLoadState> {
    fn from(event: LoadStubEvent) -> HandshakeSM<StubLoadState> {
        HandshakeSM {
            plan: event.plan,
            state: StubLoadState {},
        }
    }
}

impl From<ResyncEvent> for HandshakeSM<ResyncState> {
    fn from(event: ResyncEvent) -> HandshakeSM<ResyncState> {
        HandshakeSM {
            plan: event.plan,
            state: ResyncState {},
        }
    }
}

impl From<QueryIdentityEvent> for HandshakeSM<IdentityState> {
    fn from(event: QueryIdentityEvent) -> HandshakeSM<IdentityState> {
        HandshakeSM {
            plan: event.plan,
            state: IdentityState {},
        }
    }
}

impl From<SwitchBaudEvent> for HandshakeSM<BaudSwitchState> {
    fn from(event: SwitchBaudEvent) -> HandshakeSM<BaudSwitchState> {
        HandshakeSM {
            plan: event.plan,
            state: BaudSwitchState {
                baud_rate: event.baud_rate,
            },
        }
    }
}

impl From<DoneEvent> for HandshakeSM<DoneState> {
    fn from(event: DoneEvent) -> HandshakeSM<DoneState> {
        HandshakeSM {
            plan: event.plan,
            state: DoneState {
                error: event.error,
                should_exit: false,
            },
        }
    }
}
impl From<ExitEvent> for HandshakeSM<DoneState> {
    fn from(event: ExitEvent) -> HandshakeSM<DoneState> {
        HandshakeSM {
            plan: event.plan,
            state: DoneState {
                error: event.error,
                should_exit: true,
            },
        }
    }
}
