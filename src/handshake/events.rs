//! Events for the handshake state machine.
//!
//! This module is private and restricted to the
//! [`handshake`](crate::handshake) scope.
//!
//! ```ignore
//! use super::events::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::state_machine::Plan;
use crate::error::ProtocolError;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// SyncEvent ===================================================================

/// Event fired to trigger a transition to [`SyncState`](super::states::SyncState)
/// once the transport is open.
#[derive(Debug)]
pub(crate) struct SyncEvent {
    pub plan: Plan,
}

// LoadStubEvent ===============================================================

/// Event fired to trigger a transition to
/// [`StubLoadState`](super::states::StubLoadState) after the ROM loader
/// answered SYNC.
#[derive(Debug)]
pub(crate) struct LoadStubEvent {
    pub plan: Plan,
}

// ResyncEvent =================================================================

/// Event fired to trigger a transition to
/// [`ResyncState`](super::states::ResyncState).
///
/// This event can happen under one of the following circumstances:
///
///  1. While at the `StubLoadState` after the stub greeted us.
///  2. When a ready session asks for a resync with the loader.
#[derive(Debug)]
pub(crate) struct ResyncEvent {
    pub plan: Plan,
}

// QueryIdentityEvent ==========================================================

/// Event fired to trigger a transition to
/// [`IdentityState`](super::states::IdentityState) once the loader that will
/// answer all further commands is known to be listening.
#[derive(Debug)]
pub(crate) struct QueryIdentityEvent {
    pub plan: Plan,
}

// SwitchBaudEvent =============================================================

/// Event fired to trigger a transition to
/// [`BaudSwitchState`](super::states::BaudSwitchState).
#[derive(Debug)]
pub(crate) struct SwitchBaudEvent {
    pub plan: Plan,
    pub baud_rate: u32,
}

// DoneEvent ===================================================================

/// Event fired when the sequence completes, normally or not. It triggers a
/// transition to the `Done` state.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub plan: Plan,
    /// Set on abnormal completion.
    pub error: Option<ProtocolError>,
}

// ExitEvent ===================================================================

/// The last event of the state machine. The event loop terminates and hands
/// the outcome back to the session.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub plan: Plan,
    pub error: Option<ProtocolError>,
}

// Events enum =================================================================

/// Events that can be triggered within the handshake state machine.
#[derive(Debug)]
pub(crate) enum Event {
    Sync(SyncEvent),
    LoadStub(LoadStubEvent),
    Resync(ResyncEvent),
    QueryIdentity(QueryIdentityEvent),
    SwitchBaud(SwitchBaudEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
