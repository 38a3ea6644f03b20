//! Domain models - core sorting types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Package` / `PendingPackage` - identified packages before and after trigger assignment
//! - `Chute` / `Direction` / `PendulumPosition` - where a package goes and how it gets there
//! - `DelayWindow` - inclusive timing windows for matching pulses
//! - `DelayHistory` - bounded sample history behind the fallback estimator

pub mod history;
pub mod types;

// Re-export commonly used types at module level
pub use history::DelayHistory;
pub use types::{
    Chute, DelayWindow, DeviceStatusEvent, Direction, Package, PackageId, PendingPackage,
    PendulumPosition,
};
