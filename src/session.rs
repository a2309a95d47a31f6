//! The caller-visible session.
//!
//! A [`Session`] owns a [`Transport`] and everything learned about the chip
//! at the other end. It is driven by one caller at a time: every operation
//! is a blocking exchange and none may be interleaved with another on the
//! same session.
//!
//! **Example** - Identifying a chip over a serial port:
//! ```no_run
//! use espcom::{Session, SerialTransport, SettingsBuilder};
//!
//! let settings = SettingsBuilder::new()
//!     .path("/dev/ttyUSB0")
//!     .skip_stub(true)
//!     .finalize();
//! let transport = SerialTransport::new(settings.clone());
//! let mut session = Session::new(Box::new(transport), settings)
//!     .with_status_sink(|event: &espcom::StatusEvent| println!("{}", event.stage));
//! let device = session.connect_and_handshake()?;
//! println!("{} {}", device.chip_name, device.mac_address);
//! # Ok::<(), espcom::ProtocolError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::chip::{Chip, SecurityInfo};
use crate::commands::Commands;
use crate::connection::Connection;
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::handshake::{self, Context, Plan};
use crate::packet::LoaderMode;
use crate::settings::Settings;
use crate::status::{StatusEmitter, StatusSink};
use crate::stub::StubImage;
use crate::transport::Transport;

// =============================================================================
// Public Interface
// =============================================================================

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Syncing,
    StubLoading,
    Resyncing,
    IdentityQuery,
    Ready,
    BaudSwitching,
    /// A handshake or command sequence failed. Only a new
    /// [`connect_and_handshake`](Session::connect_and_handshake) leaves it.
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Syncing => "syncing",
            SessionState::StubLoading => "loading the stub",
            SessionState::Resyncing => "resyncing",
            SessionState::IdentityQuery => "querying the identity",
            SessionState::Ready => "ready",
            SessionState::BaudSwitching => "switching baud rate",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the handshake learned about the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub chip: Chip,
    pub chip_name: String,
    /// Six lowercase colon-separated hex octets.
    pub mac_address: String,
    /// `None` means not known yet, not zero.
    pub flash_size: Option<u32>,
    pub security_facts: Vec<String>,
    pub security_info: Option<SecurityInfo>,
    /// The loader that answered the identity queries.
    pub loader: LoaderMode,
}

/// Cooperative cancellation. Clones share the same flag, so one can be handed
/// to a signal handler while the session keeps the other.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A protocol session over a caller supplied transport.
pub struct Session {
    context: Context,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, settings: Settings) -> Self {
        let baud_rate = settings.baud_rate;
        Session {
            context: Context {
                connection: Connection::new(transport),
                settings,
                status: StatusEmitter::new(),
                cancel: CancelFlag::new(),
                stub: None,
                state: SessionState::Closed,
                baud_rate,
                device: None,
            },
        }
    }

    /// Report status events to `sink`.
    pub fn with_status_sink(mut self, sink: impl StatusSink + 'static) -> Self {
        self.context.status.set_sink(Box::new(sink));
        self
    }

    /// The stub to run during the handshake, unless `skip_stub` is set.
    pub fn with_stub(mut self, stub: StubImage) -> Self {
        self.context.stub = Some(stub);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.context.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.context.cancel.clone()
    }

    /// Run the full handshake. Allowed from `Closed` and `Failed`.
    pub fn connect_and_handshake(&mut self) -> Result<DeviceInfo> {
        match self.context.state {
            SessionState::Closed | SessionState::Failed => {}
            other => {
                return Err(ProtocolError::InvalidState {
                    expected: "closed",
                    actual: other.name(),
                })
            }
        }

        handshake::run(&mut self.context, Plan::Connect)?;
        self.context.device.clone().ok_or_else(|| {
            ProtocolError::InvalidResponse("handshake finished without identifying the chip".into())
        })
    }

    /// Sync again with the running loader, reporting
    /// [`Stage::ReconnectingStub`](crate::Stage::ReconnectingStub).
    pub fn sync_with_stub(&mut self) -> Result<()> {
        self.require_ready()?;
        handshake::run(&mut self.context, Plan::Resync)
    }

    /// Switch the link to `baud_rate`.
    pub fn change_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.require_ready()?;
        if baud_rate == self.context.baud_rate {
            return Ok(());
        }
        handshake::run(&mut self.context, Plan::ChangeBaud(baud_rate))
    }

    /// Run steady-state commands. Only a ready session accepts them. A
    /// failure other than a rejected argument fails the session and closes
    /// the transport.
    pub fn with_commands<T>(
        &mut self,
        f: impl FnOnce(&mut Commands<'_>) -> Result<T>,
    ) -> Result<T> {
        self.require_ready()?;
        let result = f(&mut Commands::new(
            &mut self.context.connection,
            &self.context.settings,
        ));
        if let Err(error) = &result {
            if error.kind() != ErrorKind::Validation {
                self.fail(error);
            }
        }
        result
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        self.with_commands(|commands| commands.read_reg(address))
    }

    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        self.with_commands(|commands| commands.write_reg(address, value, mask, delay_us))
    }

    /// Upload `data` to RAM at `address` without running it.
    pub fn upload_to_ram(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.with_commands(|commands| commands.upload_to_ram(address, data, progress))
    }

    /// Close the transport. The session can connect again afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.context.state != SessionState::Closed {
            info!("Closing {}", self.context.connection.transport().name());
        }
        self.context.state = SessionState::Closed;
        self.context.device = None;
        self.context.connection.close()
    }

    pub fn state(&self) -> SessionState {
        self.context.state
    }

    /// The baud rate the link currently runs at.
    pub fn baud_rate(&self) -> u32 {
        self.context.baud_rate
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.context.device.as_ref()
    }

    pub fn loader_mode(&self) -> LoaderMode {
        self.context.connection.mode()
    }

    fn fail(&mut self, error: &ProtocolError) {
        info!("=> Failed: {}", error);
        self.context.state = SessionState::Failed;
        self.context.device = None;
        if let Err(e) = self.context.connection.close() {
            warn!("Closing the transport failed: {}", e);
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.context.state {
            SessionState::Ready => Ok(()),
            other => Err(ProtocolError::InvalidState {
                expected: "ready",
                actual: other.name(),
            }),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
use crate::transport::{ScriptedTransport, Step};

#[test]
fn cancel_flag_is_shared_by_clones() {
    let flag = CancelFlag::new();
    let other = flag.clone();
    assert!(!flag.is_cancelled());
    other.cancel();
    assert!(flag.is_cancelled());
    flag.reset();
    assert!(!other.is_cancelled());
}

#[test]
fn commands_require_ready() {
    let script = ScriptedTransport::new(vec![]);
    let mut session = Session::new(Box::new(script), Settings::default());
    assert_eq!(session.state(), SessionState::Closed);

    assert_eq!(
        session.read_reg(0x6000_0000).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        session.with_commands(|c| c.sync()).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        session.sync_with_stub().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        session.change_baud(921_600).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn close_resets_state() {
    let script = ScriptedTransport::new(vec![Step::rom(crate::packet::Opcode::Sync, 0, &[])]);
    let mut session = Session::new(Box::new(script.clone()), Settings::default());
    session.close().unwrap();
    assert_eq!(script.remaining(), 1);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.device_info(), None);
}
