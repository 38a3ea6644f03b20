//! PLC binary framing
//!
//! Protocol:
//! - Fixed 8-byte frames: [0xF9][Func][SeqHi][SeqLo][Reserved][Error][Chute][0xFF]
//! - 0x10 sequence notice (PLC → engine), a package passed the entry sensor
//! - 0x11 sort command (engine → PLC), sequence number + target chute
//! - 0x12 actuation feedback (PLC → engine), error code + chute actually used
//! - The trailing byte is a fixed 0xFF marker, not a computed checksum

use crate::io::error::{Decoded, ProtocolError};

pub const START_BYTE: u8 = 0xF9;
pub const END_BYTE: u8 = 0xFF;
pub const FRAME_LEN: usize = 8;

const FUNC_SEQUENCE_NOTICE: u8 = 0x10;
const FUNC_SORT_COMMAND: u8 = 0x11;
const FUNC_FEEDBACK: u8 = 0x12;

/// Feedback error code meaning "diverted as commanded"
pub const FEEDBACK_OK: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcFrame {
    SequenceNotice { seq: u16 },
    SortCommand { seq: u16, chute: u8 },
    Feedback { seq: u16, error: u8, chute: u8 },
}

impl PlcFrame {
    pub fn seq(&self) -> u16 {
        match *self {
            PlcFrame::SequenceNotice { seq }
            | PlcFrame::SortCommand { seq, .. }
            | PlcFrame::Feedback { seq, .. } => seq,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let (func, error, chute) = match *self {
            PlcFrame::SequenceNotice { .. } => (FUNC_SEQUENCE_NOTICE, 0, 0),
            PlcFrame::SortCommand { chute, .. } => (FUNC_SORT_COMMAND, 0, chute),
            PlcFrame::Feedback { error, chute, .. } => (FUNC_FEEDBACK, error, chute),
        };
        let [seq_hi, seq_lo] = self.seq().to_be_bytes();
        [START_BYTE, func, seq_hi, seq_lo, 0x00, error, chute, END_BYTE]
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Bytes before a start byte are dropped. A frame with a bad trailing marker
    /// or unknown function code is rejected as a whole.
    pub fn parse(buf: &[u8]) -> Option<(Decoded<PlcFrame>, usize)> {
        if buf.is_empty() {
            return None;
        }

        if buf[0] != START_BYTE {
            let skip = buf.iter().position(|&b| b == START_BYTE).unwrap_or(buf.len());
            return Some((Decoded::Invalid(ProtocolError::BadStartByte(buf[0])), skip));
        }

        if buf.len() < FRAME_LEN {
            return None;
        }

        let frame = &buf[..FRAME_LEN];
        if frame[7] != END_BYTE {
            return Some((Decoded::Invalid(ProtocolError::BadChecksum(frame[7])), FRAME_LEN));
        }

        let seq = u16::from_be_bytes([frame[2], frame[3]]);
        let decoded = match frame[1] {
            FUNC_SEQUENCE_NOTICE => PlcFrame::SequenceNotice { seq },
            FUNC_SORT_COMMAND => PlcFrame::SortCommand { seq, chute: frame[6] },
            FUNC_FEEDBACK => PlcFrame::Feedback { seq, error: frame[5], chute: frame[6] },
            other => {
                return Some((Decoded::Invalid(ProtocolError::UnknownFunction(other)), FRAME_LEN))
            }
        };

        Some((Decoded::Frame(decoded), FRAME_LEN))
    }
}
