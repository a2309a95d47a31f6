//! Command and response packets.
//!
//! A command travels as a SLIP frame carrying:
//!
//! ```text
//!   0      1        2..4        4..8          8..
//! .-----.--------.-----------.-------------.---------.
//! | 0x00| opcode | length LE | value LE    | payload |
//! '-----'--------'-----------'-------------'---------'
//! ```
//!
//! A response mirrors it with a `0x01` direction byte. Its data section ends
//! with a status block whose size depends on the [`LoaderMode`]: the ROM
//! loader appends four bytes, the stub two.

use std::convert::TryFrom;
use std::fmt;

use crate::error::{FramingError, ProtocolError, Result};
use crate::slip;

/// Direction byte of an outgoing command.
pub const DIRECTION_REQUEST: u8 = 0x00;
/// Direction byte of an incoming response.
pub const DIRECTION_RESPONSE: u8 = 0x01;
/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 8;
/// Seed of the data checksum carried by `MEM_DATA`.
pub const CHECKSUM_SEED: u8 = 0xEF;

// =============================================================================
// Public Interface
// =============================================================================

/// Operations understood by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    ChangeBaudrate = 0x0F,
    GetSecurityInfo = 0x14,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::MemBegin => "MEM_BEGIN",
            Opcode::MemEnd => "MEM_END",
            Opcode::MemData => "MEM_DATA",
            Opcode::Sync => "SYNC",
            Opcode::WriteReg => "WRITE_REG",
            Opcode::ReadReg => "READ_REG",
            Opcode::ChangeBaudrate => "CHANGE_BAUDRATE",
            Opcode::GetSecurityInfo => "GET_SECURITY_INFO",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        match code {
            0x05 => Ok(Opcode::MemBegin),
            0x06 => Ok(Opcode::MemEnd),
            0x07 => Ok(Opcode::MemData),
            0x08 => Ok(Opcode::Sync),
            0x09 => Ok(Opcode::WriteReg),
            0x0A => Ok(Opcode::ReadReg),
            0x0F => Ok(Opcode::ChangeBaudrate),
            0x14 => Ok(Opcode::GetSecurityInfo),
            other => Err(other),
        }
    }
}

/// Which loader is answering commands. Changes the response status block
/// size and a few command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    Rom,
    Stub,
}

impl LoaderMode {
    /// Size of the status block trailing every response.
    pub fn status_len(self) -> usize {
        match self {
            LoaderMode::Rom => 4,
            LoaderMode::Stub => 2,
        }
    }
}

impl fmt::Display for LoaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderMode::Rom => f.write_str("ROM loader"),
            LoaderMode::Stub => f.write_str("stub loader"),
        }
    }
}

/// An outgoing command before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    /// Checksum or plain value field, depending on the opcode.
    pub value: u32,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Command {
            opcode,
            value: 0,
            payload,
        }
    }

    pub fn with_value(mut self, value: u32) -> Self {
        self.value = value;
        self
    }

    /// Lay the command out and wrap it into a SLIP frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        build_command(self.opcode, self.value, &self.payload)
    }
}

/// The status block trailing a response's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBlock {
    bytes: Vec<u8>,
}

impl StatusBlock {
    pub fn new(bytes: Vec<u8>) -> Self {
        StatusBlock { bytes }
    }

    /// Raw bytes, as received.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `0` on success. A block too short to carry it reads as a failure.
    pub fn status(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0xFF)
    }

    /// Failure detail reported alongside a non-zero status.
    pub fn detail(&self) -> u8 {
        self.bytes.get(1).copied().unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        self.status() == 0
    }
}

/// A parsed incoming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub direction: u8,
    /// The raw opcode, which may be one this crate does not know.
    pub opcode: u8,
    pub value: u32,
    pub data: Vec<u8>,
    pub status: Option<StatusBlock>,
}

impl Response {
    pub fn is_response(&self) -> bool {
        self.direction == DIRECTION_RESPONSE
    }

    pub fn is_for(&self, opcode: Opcode) -> bool {
        self.opcode == opcode.code()
    }
}

/// Build the SLIP frame of a command.
///
/// The payload length must fit the 16 bit length field.
pub fn build_command(opcode: Opcode, value: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::Validation(format!(
            "{} payload of {} bytes exceeds {} bytes",
            opcode,
            payload.len(),
            u16::MAX
        )));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.push(DIRECTION_REQUEST);
    packet.push(opcode.code());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(&value.to_le_bytes());
    packet.extend_from_slice(payload);
    Ok(slip::encode(&packet))
}

/// SLIP-decode `frame` and parse it as a response.
pub fn parse_response(frame: &[u8], mode: LoaderMode) -> Result<Response> {
    let packet = slip::decode(frame)?;
    parse_packet(&packet, mode)
}

/// Parse an already SLIP-decoded packet.
///
/// The length field is not trusted: the data section is everything after the
/// header. When the data section is at least as long as the mode's status
/// block, its tail is split off as the status.
pub fn parse_packet(packet: &[u8], mode: LoaderMode) -> Result<Response> {
    if packet.len() < HEADER_LEN {
        return Err(FramingError::TooShort {
            len: packet.len(),
            min: HEADER_LEN,
        }
        .into());
    }

    let mut value = [0u8; 4];
    value.copy_from_slice(&packet[4..8]);

    let body = &packet[HEADER_LEN..];
    let status_len = mode.status_len();
    let (data, status) = if body.len() >= status_len {
        let (data, status) = body.split_at(body.len() - status_len);
        (
            data.to_vec(),
            Some(StatusBlock::new(status.to_vec())),
        )
    } else {
        (body.to_vec(), None)
    };

    Ok(Response {
        direction: packet[0],
        opcode: packet[1],
        value: u32::from_le_bytes(value),
        data,
        status,
    })
}

/// Checksum of a `MEM_DATA` block.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b) as u32
}

/// Encode a sequence of 32 bit words, little endian.
pub(crate) fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Build the SLIP frame of a response. Used by replay transcripts.
pub fn build_response(opcode: u8, value: u32, data: &[u8], status: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + data.len() + status.len());
    packet.push(DIRECTION_RESPONSE);
    packet.push(opcode);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&value.to_le_bytes());
    packet.extend_from_slice(data);
    packet.extend_from_slice(status);
    slip::encode(&packet)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn command_layout() {
    let frame = build_command(Opcode::ReadReg, 0, &words(&[0x4000_1000])).unwrap();
    assert_eq!(
        slip::decode(&frame).unwrap(),
        vec![0x00, 0x0A, 0x04, 0x00, 0, 0, 0, 0, 0x00, 0x10, 0x00, 0x40]
    );
}

#[test]
fn command_value_is_little_endian() {
    let frame = Command::new(Opcode::MemData, vec![])
        .with_value(0x1234_5678)
        .to_frame()
        .unwrap();
    let packet = slip::decode(&frame).unwrap();
    assert_eq!(&packet[4..8], &[0x78, 0x56, 0x34, 0x12]);
}

#[test]
fn command_payload_is_escaped() {
    let frame = build_command(Opcode::MemData, 0, &[slip::END]).unwrap();
    assert!(!frame[1..frame.len() - 1].contains(&slip::END));
    assert_eq!(slip::decode(&frame).unwrap()[8..], [slip::END]);
}

#[test]
fn oversized_payload_is_rejected() {
    let payload = vec![0u8; u16::MAX as usize + 1];
    let err = build_command(Opcode::MemData, 0, &payload).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
}

#[test]
fn parse_rom_response_with_status() {
    let frame = build_response(0x0A, 0xDEAD_BEEF, &[], &[0, 0, 0, 0]);
    let response = parse_response(&frame, LoaderMode::Rom).unwrap();
    assert!(response.is_response());
    assert!(response.is_for(Opcode::ReadReg));
    assert_eq!(response.value, 0xDEAD_BEEF);
    assert!(response.data.is_empty());
    assert!(response.status.unwrap().is_success());
}

#[test]
fn parse_stub_response_splits_two_status_bytes() {
    let frame = build_response(0x14, 0, &[1, 2, 3], &[1, 5]);
    let response = parse_response(&frame, LoaderMode::Stub).unwrap();
    assert_eq!(response.data, vec![1, 2, 3]);
    let status = response.status.unwrap();
    assert_eq!(status.status(), 1);
    assert_eq!(status.detail(), 5);
}

#[test]
fn parse_response_without_status_block() {
    let frame = build_response(0x08, 0, &[0x01], &[]);
    let response = parse_response(&frame, LoaderMode::Rom).unwrap();
    assert_eq!(response.data, vec![0x01]);
    assert_eq!(response.status, None);
}

#[test]
fn parse_rejects_short_packet() {
    let frame = slip::encode(b"OHAI");
    match parse_response(&frame, LoaderMode::Stub) {
        Err(ProtocolError::Framing(FramingError::TooShort { len: 4, min: 8 })) => {}
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn unknown_opcode_parses() {
    let frame = build_response(0x42, 7, &[], &[0, 0]);
    let response = parse_response(&frame, LoaderMode::Stub).unwrap();
    assert_eq!(response.opcode, 0x42);
    assert_eq!(Opcode::try_from(0x42), Err(0x42));
}

#[test]
fn checksum_matches_reference() {
    assert_eq!(checksum(&[]), 0xEF);
    assert_eq!(checksum(&[0xEF]), 0x00);
    assert_eq!(checksum(&[0x01, 0x02, 0x04]), 0xEF ^ 0x07);
}

#[test]
fn short_status_blocks_do_not_panic() {
    let empty = StatusBlock::new(vec![]);
    assert!(!empty.is_success());
    assert_eq!(empty.detail(), 0);

    let status_only = StatusBlock::new(vec![0x00]);
    assert!(status_only.is_success());
    assert_eq!(status_only.detail(), 0);

    let failed = StatusBlock::new(vec![0x01, 0x07]);
    assert_eq!((failed.status(), failed.detail()), (0x01, 0x07));
    assert_eq!(failed.bytes(), &[0x01, 0x07]);
}
