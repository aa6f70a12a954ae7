use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::wire_constants::{CRC_SIZE, FRAME_OVERHEAD, MAX_PAYLOAD};
use crate::utils::crc16_kermit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the header plus the declared payload require.
    ShortFrame { needed: usize, got: usize },
    /// Payload would not fit in a single frame.
    PayloadTooLong { len: usize },
    /// Received CRC does not match the one computed over the frame.
    BadCrc { expected: u16, got: u16 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortFrame { needed, got } => {
                write!(f, "short frame: need {needed} bytes, got {got}")
            }
            FrameError::PayloadTooLong { len } => {
                write!(f, "payload of {len} bytes exceeds {MAX_PAYLOAD}")
            }
            FrameError::BadCrc { expected, got } => {
                write!(f, "bad crc: expected 0x{expected:04X}, got 0x{got:04X}")
            }
        }
    }
}

impl core::error::Error for FrameError {}

/// One frame body as it travels on the bus, preamble excluded:
/// `[destination][source][sequence_nr LE][command][length BE][payload][crc LE]`.
///
/// The sequence number is little-endian while the length is big-endian; the
/// element firmware expects exactly this mix. CRC-16/KERMIT covers everything
/// before the CRC itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub destination: u8,
    pub source: u8,
    pub sequence_nr: u16,
    /// Raw command byte. Replies may carry the bitwise complement of the
    /// request's code, which no `Command` variant covers.
    pub command: u8,
    payload: Vec<u8>,
    crc: u16,
}

impl Frame {
    /// Builds a frame and computes its CRC.
    pub fn new(
        destination: u8,
        source: u8,
        sequence_nr: u16,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong { len: payload.len() });
        }
        let mut frame = Self {
            destination,
            source,
            sequence_nr,
            command,
            payload,
            crc: 0,
        };
        frame.crc = crc16_kermit(&frame.covered_bytes());
        Ok(frame)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Everything the CRC covers: header and payload, in wire order.
    fn covered_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_OVERHEAD - CRC_SIZE + self.payload.len());
        out.push(self.destination);
        out.push(self.source);
        out.extend_from_slice(&self.sequence_nr.to_le_bytes());
        out.push(self.command);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Serializes the frame body. Callers prepend the preamble.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.covered_bytes();
        out.extend_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Parses a frame body (no preamble) from `bytes`.
    ///
    /// `bytes` must hold at least the header plus the declared payload and
    /// CRC; anything beyond that is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameError::ShortFrame {
                needed: FRAME_OVERHEAD,
                got: bytes.len(),
            });
        }

        let length = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
        let needed = FRAME_OVERHEAD + length;
        if bytes.len() < needed {
            return Err(FrameError::ShortFrame {
                needed,
                got: bytes.len(),
            });
        }

        let crc_start = needed - CRC_SIZE;
        let got = u16::from_le_bytes([bytes[crc_start], bytes[crc_start + 1]]);
        let expected = crc16_kermit(&bytes[..crc_start]);
        if got != expected {
            return Err(FrameError::BadCrc { expected, got });
        }

        Ok(Self {
            destination: bytes[0],
            source: bytes[1],
            sequence_nr: u16::from_le_bytes([bytes[2], bytes[3]]),
            command: bytes[4],
            payload: bytes[7..crc_start].to_vec(),
            crc: got,
        })
    }

    /// Whether this frame is the reply to `request`: same sequence number,
    /// and either the same command code or its bitwise complement (the
    /// error signal).
    pub fn answers(&self, request: &Frame) -> bool {
        self.sequence_nr == request.sequence_nr
            && (self.command == request.command || self.command == !request.command)
    }

    /// Whether a matched reply flags the request as failed.
    pub fn is_error_reply_to(&self, request: &Frame) -> bool {
        self.command == !request.command
    }
}
