//! Byte stream abstraction the protocol client talks through.
//!
//! The transport is owned by the caller and handed to a
//! [`Session`](crate::Session); the protocol client never shares it. Reads
//! return whatever happens to be available, so nothing above this layer may
//! assume chunk boundaries match frame boundaries.
//!
//! Two implementations ship with the crate:
//!
//! * [`SerialTransport`] drives a real serial port through `serialport`,
//! * [`ScriptedTransport`] replays a transcript for tests.

use std::time::Duration;

use crate::error::Result;

mod script;
mod serial;

pub use script::{ScriptedTransport, Step, TransportCall};
pub use serial::{available_ports, SerialTransport};

/// Outcome of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Some bytes arrived.
    Bytes(Vec<u8>),
    /// Nothing arrived before the read timeout.
    Idle,
    /// The stream ended; nothing more will ever arrive.
    EndOfStream,
}

/// A duplex byte stream with explicit open/close and flow-control hooks.
pub trait Transport {
    /// Open the stream at `baud_rate`.
    fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Wait up to `timeout` for bytes.
    fn read_chunk(&mut self, timeout: Duration) -> Result<Incoming>;

    /// Write all of `data`.
    fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Switch the local side to `baud_rate` without closing the stream.
    fn set_baud(&mut self, baud_rate: u32) -> Result<()>;

    /// Drive the DTR and RTS lines. Transports without modem lines ignore it.
    fn set_signals(&mut self, _dtr: bool, _rts: bool) -> Result<()> {
        Ok(())
    }

    /// Discard anything buffered on the input side.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()>;

    /// A name for log messages.
    fn name(&self) -> String;
}
