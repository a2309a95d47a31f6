//! Typed failures of the bootloader protocol client.
//!
//! Every operation in the crate returns a [`ProtocolError`] on failure. The
//! UI layer is the only place where these are turned into prose; use
//! [`ProtocolError::kind`] to classify a failure without matching on its
//! payload.

use thiserror::Error;

use crate::packet::Opcode;

/// Errors produced while decoding a SLIP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// An escape byte was followed by something other than a substitution
    /// code.
    #[error("invalid escape sequence 0xdb 0x{0:02x}")]
    InvalidEscape(u8),

    /// The input ended before the closing sentinel (or never opened a
    /// frame).
    #[error("incomplete frame")]
    Incomplete,

    /// The decoded payload is shorter than a response header.
    #[error("packet of {len} bytes is shorter than the {min} byte header")]
    TooShort { len: usize, min: usize },
}

/// Everything that can go wrong while talking to the bootloader.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed SLIP data, or a partial frame left over at end of stream.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A response arrived for another opcode where an exact match was
    /// required.
    #[error("expected a response to {expected} but received opcode 0x{received:02x}")]
    OpcodeMismatch { expected: Opcode, received: u8 },

    /// No matching response arrived within the time budget.
    #[error("timed out waiting for a response to {opcode}")]
    Timeout { opcode: Opcode },

    /// The remote reported a failure in the response status block. The status
    /// bytes are kept verbatim.
    #[error("{opcode} failed with status 0x{status:02x} (detail 0x{detail:02x})")]
    Status {
        opcode: Opcode,
        status: u8,
        detail: u8,
        status_bytes: Vec<u8>,
    },

    /// The byte stream ended unexpectedly.
    #[error("transport closed")]
    TransportClosed,

    /// A caller supplied argument is out of range. Nothing was sent.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The operation was cancelled through the session's cancel flag.
    #[error("operation cancelled")]
    Cancelled,

    /// Neither the detection magic nor the security info identified a known
    /// chip.
    #[error("unsupported chip (magic 0x{magic:08x}, chip id {chip_id:?})")]
    UnsupportedChip { magic: u32, chip_id: Option<u32> },

    /// A well-formed response carried data that could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The session is not in a state that allows the requested operation.
    #[error("session is {actual}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload-free classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Framing,
    OpcodeMismatch,
    Timeout,
    ChecksumOrStatus,
    TransportClosed,
    Validation,
    Cancelled,
    UnsupportedChip,
    InvalidResponse,
    InvalidState,
    Transport,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Framing(_) => ErrorKind::Framing,
            ProtocolError::OpcodeMismatch { .. } => ErrorKind::OpcodeMismatch,
            ProtocolError::Timeout { .. } => ErrorKind::Timeout,
            ProtocolError::Status { .. } => ErrorKind::ChecksumOrStatus,
            ProtocolError::TransportClosed => ErrorKind::TransportClosed,
            ProtocolError::Validation(_) => ErrorKind::Validation,
            ProtocolError::Cancelled => ErrorKind::Cancelled,
            ProtocolError::UnsupportedChip { .. } => ErrorKind::UnsupportedChip,
            ProtocolError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            ProtocolError::InvalidState { .. } => ErrorKind::InvalidState,
            ProtocolError::Serial(_) | ProtocolError::Io(_) => ErrorKind::Transport,
        }
    }

    /// `true` for the only failure a bounded retry loop is allowed to absorb.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result type for bootloader protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn kind_classification() {
    let timeout = ProtocolError::Timeout {
        opcode: Opcode::Sync,
    };
    assert_eq!(timeout.kind(), ErrorKind::Timeout);
    assert!(timeout.is_timeout());

    let framing: ProtocolError = FramingError::Incomplete.into();
    assert_eq!(framing.kind(), ErrorKind::Framing);
    assert!(!framing.is_timeout());

    let status = ProtocolError::Status {
        opcode: Opcode::MemData,
        status: 1,
        detail: 0x07,
        status_bytes: vec![1, 7, 0, 0],
    };
    assert_eq!(status.kind(), ErrorKind::ChecksumOrStatus);
}

#[test]
fn messages_name_the_opcode() {
    let timeout = ProtocolError::Timeout {
        opcode: Opcode::Sync,
    };
    assert_eq!(
        timeout.to_string(),
        "timed out waiting for a response to SYNC"
    );

    let mismatch = ProtocolError::OpcodeMismatch {
        expected: Opcode::ReadReg,
        received: 0x08,
    };
    assert_eq!(
        mismatch.to_string(),
        "expected a response to READ_REG but received opcode 0x08"
    );
}
