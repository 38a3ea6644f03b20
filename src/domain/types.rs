//! Shared types for the sorting line

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Newtype wrapper for package sequence indices to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PackageId(pub u64);

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination chute number (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Chute(pub u16);

impl Chute {
    /// Even chutes sit on the right of their pendulum, odd chutes on the left
    #[inline]
    pub fn direction(self) -> Direction {
        if self.0 % 2 == 0 {
            Direction::Right
        } else {
            Direction::Left
        }
    }

    /// Lane serving this chute, or None for chute 0
    #[inline]
    pub fn lane_index(self, chutes_per_lane: u16) -> Option<usize> {
        if self.0 == 0 || chutes_per_lane == 0 {
            return None;
        }
        Some(((self.0 - 1) / chutes_per_lane) as usize)
    }
}

impl std::fmt::Display for Chute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pendulum swing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

/// Physical pendulum position of one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PendulumPosition {
    #[default]
    Neutral,
    Swung(Direction),
}

impl PendulumPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendulumPosition::Neutral => "neutral",
            PendulumPosition::Swung(Direction::Left) => "swung_left",
            PendulumPosition::Swung(Direction::Right) => "swung_right",
        }
    }
}

/// Identified package as handed over by the identification subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub index: PackageId,
    #[serde(default)]
    pub barcode: String,
}

impl Package {
    pub fn new(index: u64, barcode: impl Into<String>) -> Self {
        Self { index: PackageId(index), barcode: barcode.into() }
    }
}

/// Package waiting for its lane sensor pulse
#[derive(Debug, Clone)]
pub struct PendingPackage {
    pub index: PackageId,
    pub barcode: String,
    pub chute: Chute,
    pub lane: usize,
    pub direction: Direction,
    /// Instant the package passed (or is estimated to have passed) the entry sensor
    pub trigger_at: Instant,
    /// Entry pulse to identification delay observed at assignment
    pub processing_delay: Duration,
    pub estimated: bool,
    /// PLC sequence number (PLC mode only)
    pub plc_seq: Option<u16>,
    /// Timeout eviction deadline
    pub deadline: Instant,
}

impl PendingPackage {
    /// Time travelled since the entry sensor
    #[inline]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.trigger_at)
    }
}

/// Inclusive `[lower, upper]` delay window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub lower: Duration,
    pub upper: Duration,
}

impl DelayWindow {
    pub fn from_millis(lower_ms: u64, upper_ms: u64) -> Self {
        Self { lower: Duration::from_millis(lower_ms), upper: Duration::from_millis(upper_ms) }
    }

    #[inline]
    pub fn contains(&self, delay: Duration) -> bool {
        self.lower <= delay && delay <= self.upper
    }

    pub fn midpoint(&self) -> Duration {
        self.lower + (self.upper.saturating_sub(self.lower)) / 2
    }

    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.lower, self.upper)
    }
}

/// Device connectivity transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatusEvent {
    pub device: String,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chute_direction() {
        assert_eq!(Chute(1).direction(), Direction::Left);
        assert_eq!(Chute(2).direction(), Direction::Right);
        assert_eq!(Chute(7).direction(), Direction::Left);
    }

    #[test]
    fn test_chute_lane_index() {
        assert_eq!(Chute(1).lane_index(2), Some(0));
        assert_eq!(Chute(2).lane_index(2), Some(0));
        assert_eq!(Chute(3).lane_index(2), Some(1));
        assert_eq!(Chute(6).lane_index(2), Some(2));
        assert_eq!(Chute(0).lane_index(2), None);
    }

    #[test]
    fn test_delay_window() {
        let window = DelayWindow::from_millis(100, 300);
        assert!(window.contains(Duration::from_millis(100)));
        assert!(window.contains(Duration::from_millis(300)));
        assert!(!window.contains(Duration::from_millis(301)));
        assert_eq!(window.midpoint(), Duration::from_millis(200));
        assert_eq!(window.clamp(Duration::from_millis(20)), Duration::from_millis(100));
        assert_eq!(window.clamp(Duration::from_millis(900)), Duration::from_millis(300));
    }

    #[test]
    fn test_pendulum_position_as_str() {
        assert_eq!(PendulumPosition::default().as_str(), "neutral");
        assert_eq!(PendulumPosition::Swung(Direction::Left).as_str(), "swung_left");
    }
}
