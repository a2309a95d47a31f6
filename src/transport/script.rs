//! Transcript replay transport.
//!
//! A [`ScriptedTransport`] answers every command written to it with the next
//! step of a transcript, the way a bootloader would answer on the wire. It is
//! what the handshake and correlator tests run against, and it is a plain
//! value built by the test: there is no recorder state shared between tests.
//!
//! ```ignore
//! let script = ScriptedTransport::new(vec![
//!     Step::rom(Opcode::Sync, 0, &[]),
//!     Step::rom(Opcode::ReadReg, 0x9, &[]),
//! ]);
//! let mut session = Session::new(Box::new(script.clone()), settings);
//! session.connect_and_handshake()?;
//! script.assert_no_pending_steps();
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::trace;

use super::{Incoming, Transport};
use crate::error::{ProtocolError, Result};
use crate::packet::{build_response, Opcode};
use crate::slip;

// =============================================================================
// Public Interface
// =============================================================================

/// One entry of a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Answer the next command, which must carry `opcode`.
    Response {
        opcode: u8,
        value: u32,
        data: Vec<u8>,
        status: Vec<u8>,
    },
    /// Swallow the next command, which must carry `opcode`, without answering.
    Timeout { opcode: u8 },
    /// A SLIP frame carrying `payload`, emitted right after the preceding
    /// answer (or at open time when leading the transcript).
    Raw(Vec<u8>),
    /// Unframed bytes, emitted like [`Step::Raw`].
    Bytes(Vec<u8>),
    /// End the stream once everything before it has been read.
    Close,
}

impl Step {
    /// A successful answer from the ROM loader (four byte status block).
    pub fn rom(opcode: Opcode, value: u32, data: &[u8]) -> Step {
        Step::response(opcode, value, data, &[0, 0, 0, 0])
    }

    /// A successful answer from the stub loader (two byte status block).
    pub fn stub(opcode: Opcode, value: u32, data: &[u8]) -> Step {
        Step::response(opcode, value, data, &[0, 0])
    }

    pub fn response(opcode: Opcode, value: u32, data: &[u8], status: &[u8]) -> Step {
        Step::Response {
            opcode: opcode.code(),
            value,
            data: data.to_vec(),
            status: status.to_vec(),
        }
    }

    pub fn timeout(opcode: Opcode) -> Step {
        Step::Timeout {
            opcode: opcode.code(),
        }
    }

    fn is_unsolicited(&self) -> bool {
        matches!(self, Step::Raw(_) | Step::Bytes(_) | Step::Close)
    }
}

/// A call the protocol client made on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(u32),
    /// The SLIP-decoded packet that was written.
    Write(Vec<u8>),
    SetBaud(u32),
    SetSignals { dtr: bool, rts: bool },
    DiscardInput,
    Close,
}

/// Replays a transcript. Clones share the same transcript, so a test keeps one
/// handle for assertions while the session owns the other.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        ScriptedTransport {
            inner: Arc::new(Mutex::new(Inner {
                steps: steps.into(),
                pending: VecDeque::new(),
                chunk_size: usize::MAX,
                end_of_stream: false,
                is_open: false,
                calls: vec![],
            })),
        }
    }

    /// Deliver incoming bytes at most `size` at a time.
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.lock().chunk_size = size.max(1);
        self
    }

    /// Number of transcript steps not consumed yet.
    pub fn remaining(&self) -> usize {
        self.lock().steps.len()
    }

    /// Panics when the transcript still holds steps.
    pub fn assert_no_pending_steps(&self) {
        let remaining = self.remaining();
        assert_eq!(
            remaining, 0,
            "transcript has {} unconsumed step(s)",
            remaining
        );
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// Opcodes of the written commands, in order.
    pub fn written_opcodes(&self) -> Vec<u8> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write(packet) => packet.get(1).copied(),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(TransportCall::Open(baud_rate));
        inner.is_open = true;
        inner.end_of_stream = false;
        inner.emit_unsolicited();
        Ok(())
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Incoming> {
        {
            let mut inner = self.lock();
            if !inner.is_open {
                return Err(ProtocolError::TransportClosed);
            }
            if !inner.pending.is_empty() {
                let count = inner.chunk_size.min(inner.pending.len());
                let chunk: Vec<u8> = inner.pending.drain(..count).collect();
                trace!("script <= {:02x?}", chunk);
                return Ok(Incoming::Bytes(chunk));
            }
            if inner.end_of_stream {
                return Ok(Incoming::EndOfStream);
            }
        }
        // Nothing scripted: behave like a silent line for the whole timeout.
        thread::sleep(timeout);
        Ok(Incoming::Idle)
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if !inner.is_open {
            return Err(ProtocolError::TransportClosed);
        }
        let packet = slip::decode(data)?;
        inner.calls.push(TransportCall::Write(packet.clone()));

        let opcode = *packet
            .get(1)
            .ok_or_else(|| script_error("command frame too short to carry an opcode"))?;
        let step = inner.steps.pop_front().ok_or_else(|| {
            script_error(&format!("transcript exhausted (opcode 0x{:02x})", opcode))
        })?;

        match step {
            Step::Response {
                opcode: expected,
                value,
                data,
                status,
            } => {
                check_opcode(expected, opcode)?;
                let frame = build_response(expected, value, &data, &status);
                inner.pending.extend(frame);
            }
            Step::Timeout { opcode: expected } => check_opcode(expected, opcode)?,
            other => {
                return Err(script_error(&format!(
                    "unexpected {:?} before opcode 0x{:02x}",
                    other, opcode
                )))
            }
        }
        inner.emit_unsolicited();
        Ok(())
    }

    fn set_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.lock().calls.push(TransportCall::SetBaud(baud_rate));
        Ok(())
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.lock()
            .calls
            .push(TransportCall::SetSignals { dtr, rts });
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(TransportCall::DiscardInput);
        inner.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(TransportCall::Close);
        inner.is_open = false;
        inner.pending.clear();
        Ok(())
    }

    fn name(&self) -> String {
        "script".into()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug)]
struct Inner {
    steps: VecDeque<Step>,
    pending: VecDeque<u8>,
    chunk_size: usize,
    end_of_stream: bool,
    is_open: bool,
    calls: Vec<TransportCall>,
}

impl Inner {
    /// Move the unsolicited steps at the head of the transcript to the output.
    fn emit_unsolicited(&mut self) {
        while self.steps.front().map_or(false, Step::is_unsolicited) {
            match self.steps.pop_front() {
                Some(Step::Raw(payload)) => self.pending.extend(slip::encode(&payload)),
                Some(Step::Bytes(bytes)) => self.pending.extend(bytes),
                Some(Step::Close) => self.end_of_stream = true,
                _ => {}
            }
        }
    }
}

fn check_opcode(expected: u8, written: u8) -> Result<()> {
    if expected == written {
        Ok(())
    } else {
        Err(script_error(&format!(
            "transcript opcode mismatch (expected 0x{:02x}, got 0x{:02x})",
            expected, written
        )))
    }
}

fn script_error(message: &str) -> ProtocolError {
    io::Error::new(io::ErrorKind::Other, message.to_string()).into()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn answers_in_order_and_records_calls() {
    let mut script = ScriptedTransport::new(vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::Raw(b"OHAI".to_vec()),
    ]);
    script.open(115_200).unwrap();

    let sync = crate::packet::build_command(Opcode::Sync, 0, &[]).unwrap();
    script.write_chunk(&sync).unwrap();

    let mut received = vec![];
    while let Incoming::Bytes(chunk) = script.read_chunk(Duration::from_millis(1)).unwrap() {
        received.extend(chunk);
    }
    let mut expected = build_response(0x08, 0, &[], &[0, 0, 0, 0]);
    expected.extend(slip::encode(b"OHAI"));
    assert_eq!(received, expected);

    script.assert_no_pending_steps();
    assert_eq!(script.written_opcodes(), vec![0x08]);
    assert_eq!(script.calls()[0], TransportCall::Open(115_200));
}

#[test]
fn chunk_size_limits_reads() {
    let mut script = ScriptedTransport::new(vec![Step::Bytes(vec![1, 2, 3, 4, 5])]).with_chunk_size(2);
    script.open(115_200).unwrap();
    let timeout = Duration::from_millis(1);
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::Bytes(vec![1, 2]));
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::Bytes(vec![3, 4]));
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::Bytes(vec![5]));
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::Idle);
}

#[test]
fn opcode_mismatch_is_reported() {
    let mut script = ScriptedTransport::new(vec![Step::timeout(Opcode::Sync)]);
    script.open(115_200).unwrap();
    let read_reg = crate::packet::build_command(Opcode::ReadReg, 0, &[0; 4]).unwrap();
    let err = script.write_chunk(&read_reg).unwrap_err();
    assert!(err.to_string().contains("transcript opcode mismatch"));
}

#[test]
fn close_step_ends_the_stream() {
    let mut script = ScriptedTransport::new(vec![Step::Bytes(vec![0xC0]), Step::Close]);
    script.open(115_200).unwrap();
    let timeout = Duration::from_millis(1);
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::Bytes(vec![0xC0]));
    assert_eq!(script.read_chunk(timeout).unwrap(), Incoming::EndOfStream);
}
