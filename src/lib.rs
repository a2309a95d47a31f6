//! Espcom talks to the serial bootloader of Espressif chips. It drives the ROM
//! loader (and optionally a RAM resident stub loader) over a byte stream using
//! the SLIP-framed command/response protocol, identifies the chip on the other
//! end and hands back a ready [`Session`] for steady-state commands.
//!
//! The crate is layered bottom-up:
//!
//! * [`slip`] frames packets on the wire, and decodes them incrementally
//!   whatever the chunking of the incoming bytes,
//! * [`packet`] builds request packets and parses response packets,
//! * [`connection`] correlates responses with the request in flight,
//! * [`commands`] is the typed command library,
//! * the handshake state machine gets a [`Session`] from a closed transport
//!   to its ready state, reporting [`StatusEvent`]s on the way.
//!
//! The handshake is implemented as a state machine with the following
//! characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * The session context is shared between **all** states.
//! * Transitions between states are triggered via typed **events** and only
//!   explicitly defined transitions are permitted.
//! * Transitioning from one state to another consumes the original state.
//! * Data is transferred from one state to the next by attaching it to the
//!   transition event.
//!
//! Transitions leverage `rust`'s `From` and `Into` pattern: each transition is
//! a `From` implementation converting an `event` into the next `state`. Any
//! transition without one is rejected at compile-time.
//!
//! The transport is owned by the caller and lent to the session. Tests use the
//! [`ScriptedTransport`] to replay bootloader transcripts instead of a serial
//! port.

pub mod chip;
pub mod commands;
pub mod connection;
mod error;
pub mod fs;
mod handshake;
pub mod packet;
mod session;
mod settings;
pub mod slip;
mod status;
pub mod stub;
mod transport;

pub use chip::{Chip, SecurityInfo};
pub use commands::Commands;
pub use error::{ErrorKind, FramingError, ProtocolError, Result};
pub use packet::{LoaderMode, Opcode};
pub use session::{CancelFlag, DeviceInfo, Session, SessionState};
pub use settings::{
    DataBits, FlowControl, Parity, Settings, SettingsBuilder, StopBits, DEFAULT_FLASH_BAUD,
    DEFAULT_ROM_BAUD,
};
pub use status::{Stage, StatusEvent, StatusRecorder, StatusSink};
pub use stub::StubImage;
pub use transport::{
    available_ports, Incoming, ScriptedTransport, SerialTransport, Step, Transport, TransportCall,
};
