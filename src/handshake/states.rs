//! States for the handshake state machine.
//!
//! This module is private and restricted to the
//! [`handshake`](crate::handshake) scope.
//!
//! ```ignore
//! use super::states::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::{io, thread, time::Duration};

use log::{debug, info, warn};
use retry::{delay, retry_with_index, OperationResult};

use super::events::*;
use super::state_machine::{Context, Plan};
use crate::chip::Chip;
use crate::commands::Commands;
use crate::error::{ProtocolError, Result};
use crate::session::{DeviceInfo, SessionState};
use crate::status::Stage;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// Do the state's work and request the next transition by returning the
    /// appropriate event.
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event;
}

// Opening State ===============================================================

/// Opens the transport at the initial baud rate and, when configured, resets
/// the chip into its bootloader.
///
///  * **[`SyncEvent`] => [`SyncState`]** once the transport is open,
///  * **[`DoneEvent`] => [`DoneState`]** on failure or cancellation.
#[derive(Debug)]
pub(crate) struct OpeningState {}
impl Runnable for OpeningState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Opening");
        context.enter(SessionState::Opening);
        context.report(plan, Stage::OpeningPort);
        bail_if_cancelled!(plan, context);

        let baud_rate = context.settings.baud_rate;
        context.connection.set_strict(context.settings.strict_correlation);
        try_or_done!(plan, context.connection.open(baud_rate));
        context.baud_rate = baud_rate;
        context.device = None;

        if context.settings.reset_on_connect {
            try_or_done!(plan, reset_into_bootloader(context));
        }

        Event::Sync(SyncEvent { plan })
    }
}

// Sync State ==================================================================

/// Syncs with the ROM loader, retrying a bounded number of times.
///
///  * **[`LoadStubEvent`] => [`StubLoadState`]** once the ROM answered,
///  * **[`DoneEvent`] => [`DoneState`]** when every attempt timed out, on any
///    other error, or on cancellation.
#[derive(Debug)]
pub(crate) struct SyncState {}
impl Runnable for SyncState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Syncing");
        context.enter(SessionState::Syncing);
        context.report(plan, Stage::HandshakingBootloader);
        bail_if_cancelled!(plan, context);

        try_or_done!(plan, sync_with_retry(context));
        Event::LoadStub(LoadStubEvent { plan })
    }
}

// StubLoad State ==============================================================

/// Uploads and starts the stub, unless the session stays with the ROM loader.
///
///  * **[`ResyncEvent`] => [`ResyncState`]** once the stub greeted us,
///  * **[`QueryIdentityEvent`] => [`IdentityState`]** when the stub is
///    skipped,
///  * **[`DoneEvent`] => [`DoneState`]** on failure or cancellation.
#[derive(Debug)]
pub(crate) struct StubLoadState {}
impl Runnable for StubLoadState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Stub Load");
        context.enter(SessionState::StubLoading);
        context.report(plan, Stage::LoadingStub);
        bail_if_cancelled!(plan, context);

        if context.settings.skip_stub {
            info!("Staying with the ROM loader");
            return Event::QueryIdentity(QueryIdentityEvent { plan });
        }

        let stub = try_or_done!(
            plan,
            context.stub.as_ref().ok_or_else(|| ProtocolError::Validation(
                "no stub image supplied; supply one or skip the stub".into()
            ))
        );
        let status = &mut context.status;
        let mut commands = Commands::new(&mut context.connection, &context.settings);
        try_or_done!(
            plan,
            commands.run_stub(stub, &mut |done: usize, total: usize| {
                status.progress(Stage::LoadingStub, done, total)
            })
        );

        Event::Resync(ResyncEvent { plan })
    }
}

// Resync State ================================================================

/// Syncs again with whichever loader now runs, before trusting it with
/// anything else.
///
///  * **[`QueryIdentityEvent`] => [`IdentityState`]** during a full
///    handshake,
///  * **[`DoneEvent`] => [`DoneState`]** when only a resync was asked for, on
///    failure or on cancellation.
#[derive(Debug)]
pub(crate) struct ResyncState {}
impl Runnable for ResyncState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Resync");
        context.enter(SessionState::Resyncing);
        context.report(plan, Stage::ReconnectingStub);
        bail_if_cancelled!(plan, context);

        try_or_done!(plan, sync_with_retry(context));
        match plan {
            Plan::Connect => Event::QueryIdentity(QueryIdentityEvent { plan }),
            _ => Event::Done(DoneEvent { plan, error: None }),
        }
    }
}

// Identity State ==============================================================

/// Identifies the chip and collects its MAC address and security facts.
///
///  * **[`SwitchBaudEvent`] => [`BaudSwitchState`]** when another baud rate
///    was requested,
///  * **[`DoneEvent`] => [`DoneState`]** otherwise.
#[derive(Debug)]
pub(crate) struct IdentityState {}
impl Runnable for IdentityState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Identity Query");
        context.enter(SessionState::IdentityQuery);
        context.report(plan, Stage::GettingSecurityInfo);
        bail_if_cancelled!(plan, context);

        let device = try_or_done!(plan, query_identity(context));
        info!("Found {} ({})", device.chip_name, device.mac_address);
        context.device = Some(device);

        match context.settings.baud_switch() {
            Some(baud_rate) => Event::SwitchBaud(SwitchBaudEvent { plan, baud_rate }),
            None => Event::Done(DoneEvent { plan, error: None }),
        }
    }
}

// BaudSwitch State ============================================================

/// Moves both sides of the link to another baud rate, without syncing again.
/// It reports no stage of its own.
///
///  * **[`DoneEvent`] => [`DoneState`]** in every case.
#[derive(Debug)]
pub(crate) struct BaudSwitchState {
    pub baud_rate: u32,
}
impl Runnable for BaudSwitchState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        info!("=> Baud Switch");
        context.enter(SessionState::BaudSwitching);
        bail_if_cancelled!(plan, context);

        let current = context.baud_rate;
        let mut commands = Commands::new(&mut context.connection, &context.settings);
        try_or_done!(plan, commands.change_baud(self.baud_rate, current));
        context.baud_rate = self.baud_rate;

        Event::Done(DoneEvent { plan, error: None })
    }
}

// Done State ==================================================================

/// The final state. Leaves the session `Ready`, or `Failed` with the
/// transport closed.
#[derive(Debug)]
pub(crate) struct DoneState {
    pub error: Option<ProtocolError>,
    /// Set when the state machine event loop should terminate.
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn run(&mut self, plan: Plan, context: &mut Context) -> Event {
        match &self.error {
            None => {
                info!("=> Ready");
                context.enter(SessionState::Ready);
            }
            Some(error) => {
                info!("=> Failed: {}", error);
                context.enter(SessionState::Failed);
                context.device = None;
                if let Err(e) = context.connection.close() {
                    warn!("Closing the transport failed: {}", e);
                }
            }
        }

        Event::Exit(ExitEvent {
            plan,
            error: self.error.take(),
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Classic DTR/RTS sequence pulling the chip into its serial bootloader: hold
/// it in reset with IO0 high, then release reset with IO0 low.
fn reset_into_bootloader(context: &mut Context) -> Result<()> {
    debug!("Resetting into the bootloader");
    let transport = context.connection.transport();
    transport.set_signals(false, true)?;
    thread::sleep(Duration::from_millis(100));
    transport.set_signals(true, false)?;
    thread::sleep(Duration::from_millis(50));
    transport.set_signals(false, false)?;
    transport.discard_input()?;
    context.connection.clear_input();
    Ok(())
}

/// SYNC until the loader answers. Only timeouts are retried, and the cancel
/// flag is checked before every attempt.
fn sync_with_retry(context: &mut Context) -> Result<()> {
    let attempts = context.settings.sync_attempts.max(1);
    let backoff = context.settings.retry_backoff.as_millis() as u64;

    let result = retry_with_index(
        delay::Fixed::from_millis(backoff).take(attempts as usize - 1),
        |attempt| {
            if context.cancel.is_cancelled() {
                return OperationResult::Err(ProtocolError::Cancelled);
            }
            debug!("SYNC attempt {}/{}", attempt, attempts);
            context.connection.clear_input();
            match Commands::new(&mut context.connection, &context.settings).sync() {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if e.is_timeout() => OperationResult::Retry(e),
                Err(e) => OperationResult::Err(e),
            }
        },
    );

    match result {
        Ok(()) => {
            info!("{} is listening", context.connection.mode());
            Ok(())
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            info!(
                "No sync after {} tries and {:?} of backoff: {}",
                tries, total_delay, error
            );
            Err(error)
        }
        Err(retry::Error::Internal(description)) => {
            Err(io::Error::new(io::ErrorKind::Other, description).into())
        }
    }
}

/// Detect the chip, then collect its MAC and security facts.
fn query_identity(context: &mut Context) -> Result<DeviceInfo> {
    let loader = context.connection.mode();
    let mut commands = Commands::new(&mut context.connection, &context.settings);

    let (magic, detected) = commands.detect_chip()?;
    let security_info = match detected {
        Some(chip) if !chip.supports_security_info() => None,
        _ => Some(commands.security_info()?),
    };

    let chip_id = security_info.and_then(|info| info.chip_id);
    let chip = detected
        .or_else(|| chip_id.and_then(Chip::from_chip_id))
        .ok_or(ProtocolError::UnsupportedChip { magic, chip_id })?;

    let mac_address = commands.read_mac(chip)?;
    let security_facts = security_info
        .map(|info| info.facts())
        .unwrap_or_default();

    Ok(DeviceInfo {
        chip,
        chip_name: chip.name().to_string(),
        mac_address,
        flash_size: None,
        security_facts,
        security_info,
        loader,
    })
}
