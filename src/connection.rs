//! Request/response correlation over a [`Transport`].
//!
//! The bootloader answers every command with a response carrying the same
//! opcode, but the line also carries things nobody asked for: the seven extra
//! SYNC answers of the ROM loader, late answers to commands that already
//! timed out, boot messages. [`Connection::await_response`] reads frames until
//! one matches the awaited opcode and discards the rest. That leniency is
//! deliberate; `strict` mode turns a foreign response into
//! [`ProtocolError::OpcodeMismatch`] instead.
//!
//! Every wait is bounded by a wall-clock deadline. Partial frames are kept
//! across reads, and a partial frame at end of stream is a framing error.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{FramingError, ProtocolError, Result};
use crate::packet::{parse_packet, Command, LoaderMode, Opcode, Response};
use crate::slip::SlipDecoder;
use crate::transport::{Incoming, Transport};

// =============================================================================
// Public Interface
// =============================================================================

/// Owns the transport and the receive state of one session.
pub struct Connection {
    transport: Box<dyn Transport>,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
    mode: LoaderMode,
    strict: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            frames: VecDeque::new(),
            mode: LoaderMode::Rom,
            strict: false,
        }
    }

    /// Which loader the responses are parsed for.
    pub fn mode(&self) -> LoaderMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: LoaderMode) {
        debug!("Talking to the {}", mode);
        self.mode = mode;
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Open the transport and forget anything received before.
    pub fn open(&mut self, baud_rate: u32) -> Result<()> {
        self.clear_input();
        self.mode = LoaderMode::Rom;
        self.transport.open(baud_rate)
    }

    pub fn close(&mut self) -> Result<()> {
        self.clear_input();
        self.transport.close()
    }

    /// Frame and send `command`.
    pub fn write_command(&mut self, command: &Command) -> Result<()> {
        debug!(
            "=> {} value=0x{:08x} ({} bytes)",
            command.opcode,
            command.value,
            command.payload.len()
        );
        let frame = command.to_frame()?;
        self.transport.write_chunk(&frame)
    }

    /// Send `command` and wait for its response.
    pub fn command(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        self.write_command(command)?;
        self.await_response(command.opcode, timeout)
    }

    /// Wait up to `timeout` for the response to `expected`.
    ///
    /// Frames that are not responses, and responses to other opcodes, are
    /// discarded (or rejected in strict mode). A non-zero status in the
    /// matching response fails with [`ProtocolError::Status`].
    pub fn await_response(&mut self, expected: Opcode, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = match self.next_frame(deadline)? {
                Some(frame) => frame,
                None => {
                    debug!("timed out after {:?} waiting for {}", timeout, expected);
                    return Err(ProtocolError::Timeout { opcode: expected });
                }
            };

            let response = parse_packet(&frame, self.mode)?;
            if !response.is_response() {
                debug!(
                    "discarding frame with direction 0x{:02x} while waiting for {}",
                    response.direction, expected
                );
                continue;
            }
            if !response.is_for(expected) {
                if self.strict {
                    return Err(ProtocolError::OpcodeMismatch {
                        expected,
                        received: response.opcode,
                    });
                }
                debug!(
                    "discarding response to opcode 0x{:02x} while waiting for {}",
                    response.opcode, expected
                );
                continue;
            }

            if let Some(status) = &response.status {
                if !status.is_success() {
                    return Err(ProtocolError::Status {
                        opcode: expected,
                        status: status.status(),
                        detail: status.detail(),
                        status_bytes: status.bytes().to_vec(),
                    });
                }
            }
            trace!("<= {} value=0x{:08x} data={:02x?}", expected, response.value, response.data);
            return Ok(response);
        }
    }

    /// Wait up to `timeout` for the next raw frame, whatever it carries.
    pub fn await_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.next_frame(Instant::now() + timeout)
    }

    /// Read and drop everything arriving until the line stays quiet for
    /// `window`. Returns the number of discarded frames.
    pub fn drain(&mut self, window: Duration) -> Result<usize> {
        let mut discarded = 0;
        while self.await_frame(window)?.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("drained {} stale frame(s)", discarded);
        }
        Ok(discarded)
    }

    /// Drop buffered frames and any partially received one.
    pub fn clear_input(&mut self) {
        self.frames.clear();
        self.decoder.reset();
    }

    // -------------------------------------------------------------------------

    fn next_frame(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            match self.transport.read_chunk(deadline - now)? {
                Incoming::Bytes(chunk) => self.decoder.feed(&chunk, &mut self.frames)?,
                Incoming::Idle => {}
                Incoming::EndOfStream => {
                    return if self.decoder.has_partial() {
                        self.decoder.reset();
                        Err(FramingError::Incomplete.into())
                    } else {
                        Err(ProtocolError::TransportClosed)
                    };
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
use crate::{
    error::ErrorKind,
    transport::{ScriptedTransport, Step},
};

#[cfg(test)]
fn open_connection(script: &ScriptedTransport) -> Connection {
    let mut connection = Connection::new(Box::new(script.clone()));
    connection.open(115_200).unwrap();
    connection
}

#[cfg(test)]
fn read_reg(address: u32) -> Command {
    Command::new(Opcode::ReadReg, address.to_le_bytes().to_vec())
}

#[test]
fn request_echoes_are_skipped() {
    // A frame with the request direction byte, as looped back by some adapters.
    let echo = crate::slip::encode(&[0x00, 0x0A, 0x04, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
    let script = ScriptedTransport::new(vec![
        Step::Bytes(echo),
        Step::rom(Opcode::ReadReg, 0x9, &[]),
    ]);
    let mut connection = open_connection(&script);
    connection.write_command(&read_reg(0x4000_1000)).unwrap();

    let response = connection
        .await_response(Opcode::ReadReg, Duration::from_millis(200))
        .unwrap();
    assert_eq!(response.value, 0x9);
    script.assert_no_pending_steps();
}

#[test]
fn unsolicited_frames_are_skipped() {
    let mut sync_answer = crate::packet::build_response(0x08, 0, &[], &[0, 0, 0, 0]);
    sync_answer.extend(crate::packet::build_response(0x42, 0, &[], &[0, 0, 0, 0]));
    let script = ScriptedTransport::new(vec![
        Step::Bytes(sync_answer),
        Step::rom(Opcode::ReadReg, 0x1234, &[]),
    ])
    .with_chunk_size(3);
    let mut connection = open_connection(&script);

    let response = connection
        .command(&read_reg(0x4000_1000), Duration::from_millis(200))
        .unwrap();
    assert_eq!(response.value, 0x1234);
}

#[test]
fn strict_mode_rejects_other_opcodes() {
    let script = ScriptedTransport::new(vec![
        Step::Bytes(crate::packet::build_response(0x08, 0, &[], &[0, 0, 0, 0])),
        Step::rom(Opcode::ReadReg, 0x1234, &[]),
    ]);
    let mut connection = open_connection(&script);
    connection.set_strict(true);

    match connection.command(&read_reg(0x4000_1000), Duration::from_millis(200)) {
        Err(ProtocolError::OpcodeMismatch {
            expected: Opcode::ReadReg,
            received: 0x08,
        }) => {}
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn timeout_names_awaited_opcode_and_respects_deadline() {
    let script = ScriptedTransport::new(vec![Step::timeout(Opcode::ReadReg)]);
    let mut connection = open_connection(&script);

    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    let err = connection.command(&read_reg(0), timeout).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        ProtocolError::Timeout {
            opcode: Opcode::ReadReg
        }
    ));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
    script.assert_no_pending_steps();
}

#[test]
fn failure_status_is_reported_verbatim() {
    let script = ScriptedTransport::new(vec![Step::response(
        Opcode::MemData,
        0,
        &[],
        &[0x01, 0x07, 0xAA, 0xBB],
    )]);
    let mut connection = open_connection(&script);

    let err = connection
        .command(
            &Command::new(Opcode::MemData, vec![0; 16]),
            Duration::from_millis(200),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumOrStatus);
    match err {
        ProtocolError::Status {
            opcode,
            status,
            detail,
            status_bytes,
        } => {
            assert_eq!(opcode, Opcode::MemData);
            assert_eq!(status, 0x01);
            assert_eq!(detail, 0x07);
            assert_eq!(status_bytes, vec![0x01, 0x07, 0xAA, 0xBB]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn stub_mode_uses_two_status_bytes() {
    let script = ScriptedTransport::new(vec![Step::response(
        Opcode::ReadReg,
        0,
        &[],
        &[0x01, 0x05],
    )]);
    let mut connection = open_connection(&script);
    connection.set_mode(LoaderMode::Stub);

    match connection.command(&read_reg(0), Duration::from_millis(200)) {
        Err(ProtocolError::Status { status_bytes, .. }) => assert_eq!(status_bytes, vec![1, 5]),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn partial_frame_at_end_of_stream_is_a_framing_error() {
    let script = ScriptedTransport::new(vec![
        Step::timeout(Opcode::ReadReg),
        Step::Bytes(vec![0xC0, 0x01, 0x0A]),
        Step::Close,
    ]);
    let mut connection = open_connection(&script);

    let err = connection
        .command(&read_reg(0), Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Framing(FramingError::Incomplete)
    ));
}

#[test]
fn clean_end_of_stream_is_transport_closed() {
    let script = ScriptedTransport::new(vec![Step::timeout(Opcode::ReadReg), Step::Close]);
    let mut connection = open_connection(&script);

    let err = connection
        .command(&read_reg(0), Duration::from_millis(200))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportClosed);
}

#[test]
fn drain_discards_stale_frames() {
    let mut stale = vec![];
    for _ in 0..3 {
        stale.extend(crate::packet::build_response(0x08, 0, &[], &[0, 0, 0, 0]));
    }
    let script = ScriptedTransport::new(vec![Step::Bytes(stale)]);
    let mut connection = open_connection(&script);

    assert_eq!(connection.drain(Duration::from_millis(10)).unwrap(), 3);
    assert_eq!(connection.drain(Duration::from_millis(10)).unwrap(), 0);
}
