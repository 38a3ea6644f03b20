//! IO modules - device links, codecs and external endpoints
//!
//! This module contains all external IO operations:
//! - `link` - Persistent TCP links to line devices
//! - `sensor` - `+OCCH` pulse notation and actuator command frames
//! - `plc` - 8-byte binary PLC frames
//! - `error` - Transport and codec errors
//! - `ingest` - TCP listener for identified packages
//! - `prometheus` - Prometheus metrics and device status HTTP endpoint

pub mod error;
pub mod ingest;
pub mod link;
#[cfg(test)]
pub mod mock_link;
pub mod plc;
pub mod prometheus;
pub mod sensor;

// Re-export commonly used types
pub use error::{Decoded, LinkError, ProtocolError};
pub use ingest::{start_ingest_listener, IngestConfig};
pub use link::{DeviceEndpoint, DeviceLink, DeviceMessage, LinkFactory, LinkSettings, TcpLinkFactory, WireProtocol};
pub use plc::PlcFrame;
pub use sensor::{ActuatorCommand, CommandTable, SensorSignal};
