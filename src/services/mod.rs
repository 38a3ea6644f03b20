//! Services - business logic and state management
//!
//! - `correlator` - Matches identified packages to entry sensor pulses
//! - `registry` - Pending packages, processing marks and timeout eviction
//! - `actuator` - Per-lane pendulum swing/reset sequencing
//! - `device_state` - Device connectivity map and status events
//! - `line` - Connection lifecycle, receive loops and event dispatch
//! - `sorter` - Public engine facade

pub mod actuator;
pub mod correlator;
pub mod device_state;
pub mod line;
pub mod registry;
pub mod sorter;

// Re-export commonly used types
pub use correlator::{CorrelationError, TriggerAssignment, TriggerCorrelator};
pub use device_state::DeviceStates;
pub use line::StartupError;
pub use registry::{PendingRegistry, ProcessingMarks, RegistryError};
pub use sorter::{SortError, Sorter, SorterDiagnostics};
