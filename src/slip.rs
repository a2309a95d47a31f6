//! SLIP framing.
//!
//! Packets travel over the serial line delimited by [`END`] on both sides.
//! Occurrences of [`END`] and [`ESC`] inside the payload are replaced by a two
//! byte escape sequence, so a decoded payload never contains a raw delimiter.
//!
//! [`encode`] and [`decode`] work on whole frames. The [`SlipDecoder`] is the
//! incremental variant used on live streams, where chunk boundaries have no
//! relation to frame boundaries.

use std::collections::VecDeque;

use crate::error::FramingError;

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape byte.
pub const ESC: u8 = 0xDB;
/// Escaped [`END`].
pub const ESC_END: u8 = 0xDC;
/// Escaped [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

// =============================================================================
// Public Interface
// =============================================================================

/// Wrap `payload` into a SLIP frame. Never fails.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(END);
    for &byte in payload {
        match byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(byte),
        }
    }
    frame.push(END);
    frame
}

/// Decode the first frame found in `input`.
///
/// Bytes before the opening delimiter are ignored, since the remote may emit
/// boot messages before it starts talking SLIP. Fails with
/// [`FramingError::Incomplete`] when the input runs out before a complete
/// frame was seen.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut started = false;
    let mut escape = false;
    let mut payload = Vec::with_capacity(input.len());

    for &byte in input {
        if !started {
            started = byte == END;
            continue;
        }
        if escape {
            escape = false;
            payload.push(unescape(byte)?);
            continue;
        }
        match byte {
            END => return Ok(payload),
            ESC => escape = true,
            _ => payload.push(byte),
        }
    }

    Err(FramingError::Incomplete)
}

/// Incremental SLIP decoder.
///
/// Feed it whatever the transport returns; completed frames are appended to
/// the caller's queue and a partially received frame is kept for the next
/// call.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    escape: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `data`, pushing every completed frame onto `frames`.
    ///
    /// On an invalid escape sequence the partial frame is dropped, the decoder
    /// resynchronises on the next delimiter, and the error is returned. Frames
    /// completed earlier in the same chunk are still delivered.
    pub fn feed(&mut self, data: &[u8], frames: &mut VecDeque<Vec<u8>>) -> Result<(), FramingError> {
        for &byte in data {
            if !self.in_frame {
                if byte == END {
                    self.in_frame = true;
                }
                continue;
            }
            if self.escape {
                self.escape = false;
                match unescape(byte) {
                    Ok(b) => self.buffer.push(b),
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                }
                continue;
            }
            match byte {
                // Back-to-back delimiters: the closing END of one frame
                // followed by the opening END of the next. Stay in frame.
                END if self.buffer.is_empty() => {}
                END => {
                    frames.push_back(std::mem::take(&mut self.buffer));
                    self.in_frame = false;
                }
                ESC => self.escape = true,
                _ => self.buffer.push(byte),
            }
        }
        Ok(())
    }

    /// `true` when bytes of an unfinished frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || self.escape
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.escape = false;
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn unescape(byte: u8) -> Result<u8, FramingError> {
    match byte {
        ESC_END => Ok(END),
        ESC_ESC => Ok(ESC),
        other => Err(FramingError::InvalidEscape(other)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn encode_escapes_reserved_bytes() {
    let frame = encode(&[0x01, END, 0x02, ESC, 0x03]);
    assert_eq!(
        frame,
        vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
    );
    assert!(!frame[1..frame.len() - 1].contains(&END));
}

#[test]
fn round_trip_all_byte_values() {
    let payload: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
    let frame = encode(&payload);
    assert!(!frame[1..frame.len() - 1].contains(&END));
    assert_eq!(decode(&frame).unwrap(), payload);
}

#[test]
fn round_trip_empty_payload() {
    assert_eq!(encode(&[]), vec![END, END]);
    assert_eq!(decode(&[END, END]).unwrap(), Vec::<u8>::new());
}

#[test]
fn decode_skips_leading_noise() {
    let mut input = b"ets Jun  8 2016\r\n".to_vec();
    input.extend(encode(&[0x01, 0x08]));
    assert_eq!(decode(&input).unwrap(), vec![0x01, 0x08]);
}

#[test]
fn decode_rejects_bad_escape() {
    assert_eq!(
        decode(&[END, 0x01, ESC, 0x42, END]),
        Err(FramingError::InvalidEscape(0x42))
    );
}

#[test]
fn decode_rejects_missing_delimiters() {
    assert_eq!(decode(&[0x01, 0x02]), Err(FramingError::Incomplete));
    assert_eq!(decode(&[END, 0x01, 0x02]), Err(FramingError::Incomplete));
    assert_eq!(decode(&[]), Err(FramingError::Incomplete));
}

#[test]
fn decoder_reassembles_across_chunks() {
    let mut stream = encode(&[0x01, END, 0x02]);
    stream.extend(encode(&[ESC, 0x03]));

    let mut decoder = SlipDecoder::new();
    let mut frames = VecDeque::new();
    for chunk in stream.chunks(1) {
        decoder.feed(chunk, &mut frames).unwrap();
    }

    assert_eq!(frames.pop_front().unwrap(), vec![0x01, END, 0x02]);
    assert_eq!(frames.pop_front().unwrap(), vec![ESC, 0x03]);
    assert!(frames.is_empty());
    assert!(!decoder.has_partial());
}

#[test]
fn decoder_keeps_partial_frame() {
    let mut decoder = SlipDecoder::new();
    let mut frames = VecDeque::new();
    decoder.feed(&[0x33, END, 0x01, 0x02], &mut frames).unwrap();
    assert!(frames.is_empty());
    assert!(decoder.has_partial());

    decoder.feed(&[0x03, END], &mut frames).unwrap();
    assert_eq!(frames.pop_front().unwrap(), vec![0x01, 0x02, 0x03]);
}

#[test]
fn decoder_recovers_after_bad_escape() {
    let mut decoder = SlipDecoder::new();
    let mut frames = VecDeque::new();
    let result = decoder.feed(&[END, 0x01, ESC, 0x00], &mut frames);
    assert_eq!(result, Err(FramingError::InvalidEscape(0x00)));
    assert!(!decoder.has_partial());

    decoder.feed(&encode(&[0x07]), &mut frames).unwrap();
    assert_eq!(frames.pop_front().unwrap(), vec![0x07]);
}
