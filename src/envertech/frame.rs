use crate::prelude::*;
use crate::envertech::inverter::MalformedSerial;

use {
    bytes::{Bytes, BytesMut},
    num_enum::{IntoPrimitive, TryFromPrimitive},
    tokio_util::codec::Decoder,
};

pub const START_MARKER: u8 = 0x68;
pub const END_MARKER: u8 = 0x16;
/// Nothing shorter than this can be judged either way.
pub const MIN_FRAME_LEN: usize = 16;
pub const CHALLENGE_LEN: usize = 32;
pub const HANDSHAKE_REPLY_LEN: usize = 32;

const CHECKSUM_BIAS: u32 = 85;
const HEADER_LEN: usize = 6;
const TRAILER_LEN: usize = 2;

// ControlCode {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlCode {
    Data = 0x1051,           // telemetry, one register block per module
    HandshakeReply = 0x1077, // our answer to the 32-byte challenge
}
// }}}

// FrameError {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("bad start markers {0:#04x}/{1:#04x}")]
    BadStartMarker(u8, u8),
    #[error("declared length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("bad end marker {0:#04x}")]
    BadEndMarker(u8),
    #[error("checksum mismatch - got {got:#04x}, expected {expected:#04x}")]
    BadChecksum { got: u8, expected: u8 },
}
// }}}

// Frame {{{
/// One complete, validated frame. Register offsets index into `data()`,
/// which holds every byte from the first start marker to the end marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn length(&self) -> u16 {
        Utils::be_u16ify(&self.data, 1).unwrap_or_default()
    }

    pub fn control_code(&self) -> u16 {
        Utils::be_u16ify(&self.data, 4).unwrap_or_default()
    }

    pub fn control(&self) -> Option<ControlCode> {
        ControlCode::try_from(self.control_code()).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..self.data.len() - TRAILER_LEN]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_challenge(&self) -> bool {
        self.len() == CHALLENGE_LEN
    }

    pub fn is_data(&self) -> bool {
        self.control() == Some(ControlCode::Data) && self.len() > CHALLENGE_LEN
    }
} // }}}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsedFrame {
    Frame(Frame),
    Incomplete,
    Invalid(FrameError),
}

pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
    ((sum + CHECKSUM_BIAS) % 256) as u8
}

/// Validates `buffer` as exactly one frame, end marker and checksum included.
pub fn try_parse_frame(buffer: &[u8]) -> ParsedFrame {
    match Parser::check(buffer, true) {
        Ok(None) => ParsedFrame::Incomplete,
        Ok(Some(())) => ParsedFrame::Frame(Frame {
            data: Bytes::copy_from_slice(buffer),
        }),
        Err(e) => ParsedFrame::Invalid(e),
    }
}

pub fn build_handshake_reply(serial_hex: &str) -> Result<[u8; HANDSHAKE_REPLY_LEN], MalformedSerial> {
    let serial = Serial::from_str(serial_hex)?;
    Ok(FrameFactory::handshake_reply(&serial))
}

struct Parser;
impl Parser {
    // Ok(None) means more bytes could still make this a frame.
    fn check(buffer: &[u8], strict: bool) -> Result<Option<()>, FrameError> {
        let len = buffer.len();

        if len >= 1 && buffer[0] != START_MARKER {
            return Err(FrameError::BadStartMarker(buffer[0], buffer.get(3).copied().unwrap_or_default()));
        }
        if len >= 4 && buffer[3] != START_MARKER {
            return Err(FrameError::BadStartMarker(buffer[0], buffer[3]));
        }
        if let Some(declared) = Utils::be_u16ify(buffer, 1) {
            // no amount of further reading can shrink the buffer back down
            if len > declared as usize || (declared as usize) < MIN_FRAME_LEN {
                return Err(FrameError::LengthMismatch { declared, actual: len });
            }
        }
        if len < MIN_FRAME_LEN {
            return Ok(None);
        }

        let declared = Utils::be_u16ify(buffer, 1).unwrap_or_default();
        if declared as usize != len {
            return Err(FrameError::LengthMismatch { declared, actual: len });
        }

        if strict {
            if buffer[len - 1] != END_MARKER {
                return Err(FrameError::BadEndMarker(buffer[len - 1]));
            }
            let expected = checksum(&buffer[..len - TRAILER_LEN]);
            let got = buffer[len - TRAILER_LEN];
            if got != expected {
                return Err(FrameError::BadChecksum { got, expected });
            }
        }

        Ok(Some(()))
    }
}

pub struct FrameFactory;
impl FrameFactory {
    /// Wraps `body` in start markers, length, control code, checksum and end marker.
    pub fn build(control_code: u16, body: &[u8]) -> Vec<u8> {
        let frame_length = HEADER_LEN + body.len() + TRAILER_LEN;

        let mut r = Vec::with_capacity(frame_length);
        r.push(START_MARKER);
        r.extend_from_slice(&(frame_length as u16).to_be_bytes());
        r.push(START_MARKER);
        r.extend_from_slice(&control_code.to_be_bytes());
        r.extend_from_slice(body);
        r.push(checksum(&r));
        r.push(END_MARKER);

        r
    }

    pub fn handshake_reply(serial: &Serial) -> [u8; HANDSHAKE_REPLY_LEN] {
        let mut body = [0u8; HANDSHAKE_REPLY_LEN - HEADER_LEN - TRAILER_LEN];
        body[0..4].copy_from_slice(serial.as_bytes());

        let mut r = [0u8; HANDSHAKE_REPLY_LEN];
        r.copy_from_slice(&Self::build(ControlCode::HandshakeReply.into(), &body));
        r
    }
}

// FrameDecoder {{{
/// Decides on the whole read buffer at once: the protocol never splits a
/// frame across reads, so every decision consumes everything buffered.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    strict: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FrameDecoder {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl Decoder for FrameDecoder {
    type Item = ParsedFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ParsedFrame>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        match Parser::check(&buf[..], self.strict) {
            Ok(None) => Ok(None),
            Ok(Some(())) => Ok(Some(ParsedFrame::Frame(Frame {
                data: buf.split().freeze(),
            }))),
            Err(e) => {
                buf.clear();
                Ok(Some(ParsedFrame::Invalid(e)))
            }
        }
    }
} // }}}
