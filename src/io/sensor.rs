//! Photoelectric sensor pulse notation and pendulum actuator commands
//!
//! Protocol:
//! - Sensor → engine: ASCII `+OCCH<channel>:<state>`, optional CR/LF after it
//! - State `1` = beam interrupted (pulse), `0` = idle
//! - Engine → actuator: fixed raw byte sequences, one per logical action.
//!   The actuator never answers, so commands are write-only.

use crate::domain::types::Direction;
use crate::io::error::{Decoded, ProtocolError};

const PULSE_PREFIX: &[u8] = b"+OCCH";
const PULSE_START: u8 = b'+';
const MAX_CHANNEL_DIGITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSignal {
    pub channel: u16,
    pub triggered: bool,
}

impl SensorSignal {
    pub fn triggered(channel: u16) -> Self {
        Self { channel, triggered: true }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("+OCCH{}:{}\r\n", self.channel, u8::from(self.triggered)).into_bytes()
    }

    /// Parse one signal from the front of `buf`.
    ///
    /// Returns `None` when more bytes are needed, otherwise the outcome and the
    /// number of bytes to drop from the buffer.
    pub fn parse(buf: &[u8]) -> Option<(Decoded<SensorSignal>, usize)> {
        if buf.is_empty() {
            return None;
        }

        // Resync to the next '+'
        let start = buf.iter().position(|&b| b == PULSE_START).unwrap_or(buf.len());
        if start > 0 {
            let filler = buf[..start].iter().all(|b| b.is_ascii_whitespace());
            let outcome =
                if filler { Decoded::Skip } else { Decoded::Invalid(ProtocolError::Garbage(start)) };
            return Some((outcome, start));
        }

        if buf.len() < PULSE_PREFIX.len() {
            if PULSE_PREFIX.starts_with(buf) {
                return None;
            }
            return Some((Decoded::Invalid(ProtocolError::BadPrefix), 1));
        }
        if &buf[..PULSE_PREFIX.len()] != PULSE_PREFIX {
            return Some((Decoded::Invalid(ProtocolError::BadPrefix), 1));
        }

        let digits_start = PULSE_PREFIX.len();
        let mut idx = digits_start;
        while idx < buf.len() && buf[idx].is_ascii_digit() {
            idx += 1;
            if idx - digits_start > MAX_CHANNEL_DIGITS {
                return Some((Decoded::Invalid(ProtocolError::BadChannel), idx));
            }
        }
        if idx == buf.len() {
            return None; // Need more data
        }
        if idx == digits_start {
            return Some((Decoded::Invalid(ProtocolError::BadChannel), idx));
        }

        if buf[idx] != b':' {
            return Some((Decoded::Invalid(ProtocolError::MissingSeparator), idx));
        }
        let Some(&state) = buf.get(idx + 1) else {
            return None;
        };
        let consumed = idx + 2;

        let triggered = match state {
            b'1' => true,
            b'0' => false,
            other => return Some((Decoded::Invalid(ProtocolError::BadState(other)), consumed)),
        };

        // At most three ASCII digits, always fits
        let channel = buf[digits_start..idx]
            .iter()
            .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));

        Some((Decoded::Frame(SensorSignal { channel, triggered }), consumed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorCommand {
    Start,
    Stop,
    SwingLeft,
    ResetLeft,
    SwingRight,
    ResetRight,
}

impl ActuatorCommand {
    pub const ALL: [ActuatorCommand; 6] = [
        ActuatorCommand::Start,
        ActuatorCommand::Stop,
        ActuatorCommand::SwingLeft,
        ActuatorCommand::ResetLeft,
        ActuatorCommand::SwingRight,
        ActuatorCommand::ResetRight,
    ];

    pub fn swing(direction: Direction) -> Self {
        match direction {
            Direction::Left => ActuatorCommand::SwingLeft,
            Direction::Right => ActuatorCommand::SwingRight,
        }
    }

    pub fn reset(direction: Direction) -> Self {
        match direction {
            Direction::Left => ActuatorCommand::ResetLeft,
            Direction::Right => ActuatorCommand::ResetRight,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorCommand::Start => "start",
            ActuatorCommand::Stop => "stop",
            ActuatorCommand::SwingLeft => "swing_left",
            ActuatorCommand::ResetLeft => "reset_left",
            ActuatorCommand::SwingRight => "swing_right",
            ActuatorCommand::ResetRight => "reset_right",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Raw byte frames for every actuator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    frames: [Vec<u8>; 6],
}

pub const DEFAULT_START_HEX: &str = "A5 01 01 5A";
pub const DEFAULT_STOP_HEX: &str = "A5 01 00 5A";
pub const DEFAULT_SWING_LEFT_HEX: &str = "A5 02 01 5A";
pub const DEFAULT_RESET_LEFT_HEX: &str = "A5 02 00 5A";
pub const DEFAULT_SWING_RIGHT_HEX: &str = "A5 03 01 5A";
pub const DEFAULT_RESET_RIGHT_HEX: &str = "A5 03 00 5A";

impl CommandTable {
    /// Build from hex strings in `ActuatorCommand::ALL` order
    pub fn from_hex(hex_frames: [&str; 6]) -> Result<Self, ProtocolError> {
        let mut frames: [Vec<u8>; 6] = Default::default();
        for (slot, text) in frames.iter_mut().zip(hex_frames) {
            *slot = decode_hex_frame(text)?;
        }
        Ok(Self { frames })
    }

    #[inline]
    pub fn frame(&self, command: ActuatorCommand) -> &[u8] {
        &self.frames[command.slot()]
    }

    /// Reverse lookup used by fake devices and tests
    pub fn identify(&self, bytes: &[u8]) -> Option<ActuatorCommand> {
        ActuatorCommand::ALL.into_iter().find(|cmd| self.frame(*cmd) == bytes)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        let frames = [
            DEFAULT_START_HEX,
            DEFAULT_STOP_HEX,
            DEFAULT_SWING_LEFT_HEX,
            DEFAULT_RESET_LEFT_HEX,
            DEFAULT_SWING_RIGHT_HEX,
            DEFAULT_RESET_RIGHT_HEX,
        ]
        .map(|text| {
            text.split_ascii_whitespace()
                .filter_map(|byte| u8::from_str_radix(byte, 16).ok())
                .collect::<Vec<u8>>()
        });
        Self { frames }
    }
}

/// Decode a command written as hex, with or without separating whitespace
pub fn decode_hex_frame(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = hex::decode(&compact).map_err(|_| ProtocolError::InvalidHex(text.to_string()))?;
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(bytes)
}
