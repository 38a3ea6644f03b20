//! Persistent TCP links to line devices
//!
//! Every physical endpoint (entry sensor, lane sensor/actuator, PLC) gets one
//! link. A link decodes its own wire protocol so `receive()` always hands back
//! a complete application message; malformed bytes are dropped with a warning
//! and never reach the caller.
//!
//! Connectivity is published through a `watch` channel that changes exactly on
//! connect/disconnect transitions.

use crate::io::error::{Decoded, LinkError};
use crate::io::plc::PlcFrame;
use crate::io::sensor::SensorSignal;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 512;

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(device: &str, e: &LinkError) {
    warn!(device = %device, error = %e, "device_connect_failed");
}

/// Log read error (cold path)
#[cold]
fn log_read_error(device: &str, e: &std::io::Error) {
    warn!(device = %device, error = %e, "device_read_error");
}

/// Wire format spoken on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// `+OCCH` sensor notation inbound, raw actuator frames outbound
    SensorAscii,
    /// Fixed 8-byte PLC frames both ways
    PlcBinary,
}

/// One decoded inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMessage {
    Sensor(SensorSignal),
    Plc(PlcFrame),
}

/// Where and how to reach a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub name: String,
    pub addr: String,
    pub protocol: WireProtocol,
}

#[async_trait]
pub trait DeviceLink: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the connection within the configured timeout
    async fn connect(&self) -> Result<(), LinkError>;

    /// Write raw bytes; fails when not connected
    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Block until one complete message is decoded or the link fails.
    ///
    /// Must be cancel safe: partially received bytes survive a dropped future.
    async fn receive(&self) -> Result<DeviceMessage, LinkError>;

    /// Idempotent
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Connected flag, changes on every transition
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Builds links for endpoints; swapped for fakes in tests
pub trait LinkFactory: Send + Sync {
    fn create(&self, endpoint: &DeviceEndpoint) -> Arc<dyn DeviceLink>;
}

/// Decode the next message for a protocol from the front of `buf`
pub fn decode_message(protocol: WireProtocol, buf: &[u8]) -> Option<(Decoded<DeviceMessage>, usize)> {
    match protocol {
        WireProtocol::SensorAscii => SensorSignal::parse(buf).map(|(outcome, consumed)| {
            (map_decoded(outcome, DeviceMessage::Sensor), consumed)
        }),
        WireProtocol::PlcBinary => PlcFrame::parse(buf)
            .map(|(outcome, consumed)| (map_decoded(outcome, DeviceMessage::Plc), consumed)),
    }
}

fn map_decoded<T>(outcome: Decoded<T>, f: impl FnOnce(T) -> DeviceMessage) -> Decoded<DeviceMessage> {
    match outcome {
        Decoded::Frame(frame) => Decoded::Frame(f(frame)),
        Decoded::Skip => Decoded::Skip,
        Decoded::Invalid(e) => Decoded::Invalid(e),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(3), write_timeout: Duration::from_secs(1) }
    }
}

/// Read side state; the accumulator lives here so a cancelled `receive()`
/// keeps whatever bytes already arrived.
#[derive(Default)]
struct ReaderState {
    half: Option<ReadHalf<TcpStream>>,
    acc: BytesMut,
}

pub struct TcpDeviceLink {
    endpoint: DeviceEndpoint,
    settings: LinkSettings,
    reader: Mutex<ReaderState>,
    writer: Mutex<Option<WriteHalf<TcpStream>>>,
    connected_tx: watch::Sender<bool>,
}

impl TcpDeviceLink {
    pub fn new(endpoint: DeviceEndpoint, settings: LinkSettings) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            endpoint,
            settings,
            reader: Mutex::new(ReaderState::default()),
            writer: Mutex::new(None),
            connected_tx,
        }
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    fn set_connected(&self, connected: bool) {
        let changed = self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
        if changed {
            info!(device = %self.endpoint.name, connected = connected, "device_connectivity_changed");
        }
    }

    async fn open_stream(&self) -> Result<TcpStream, LinkError> {
        let addr = &self.endpoint.addr;
        let stream =
            match tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(LinkError::Connect { addr: addr.clone(), source }),
                Err(_) => {
                    return Err(LinkError::ConnectTimeout {
                        addr: addr.clone(),
                        timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                    })
                }
            };

        // Low latency matters more than throughput for pulses and swings
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl DeviceLink for TcpDeviceLink {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn connect(&self) -> Result<(), LinkError> {
        info!(device = %self.endpoint.name, addr = %self.endpoint.addr, "device_connecting");

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                log_connect_failed(&self.endpoint.name, &e);
                self.set_connected(false);
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        {
            let mut reader = self.reader.lock().await;
            reader.half = Some(read_half);
            reader.acc.clear();
        }
        *self.writer.lock().await = Some(write_half);

        info!(device = %self.endpoint.name, addr = %self.endpoint.addr, "device_connected");
        self.set_connected(true);
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        match tokio::time::timeout(self.settings.write_timeout, half.write_all(bytes)).await {
            Ok(Ok(())) => {
                debug!(
                    device = %self.endpoint.name,
                    len = bytes.len(),
                    hex = %hex::encode_upper(bytes),
                    "device_frame_sent"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => Err(LinkError::WriteTimeout),
        }
    }

    async fn receive(&self) -> Result<DeviceMessage, LinkError> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            while let Some((outcome, consumed)) = decode_message(self.endpoint.protocol, &state.acc) {
                state.acc.advance(consumed);
                match outcome {
                    Decoded::Frame(message) => return Ok(message),
                    Decoded::Skip => {}
                    Decoded::Invalid(e) => {
                        warn!(device = %self.endpoint.name, error = %e, "device_invalid_frame");
                    }
                }
            }

            let Some(half) = state.half.as_mut() else {
                return Err(LinkError::NotConnected);
            };

            match half.read(&mut buf).await {
                Ok(0) => {
                    warn!(device = %self.endpoint.name, "device_connection_closed");
                    state.half = None;
                    self.set_connected(false);
                    return Err(LinkError::Disconnected);
                }
                Ok(n) => state.acc.extend_from_slice(&buf[..n]),
                Err(e) => {
                    log_read_error(&self.endpoint.name, &e);
                    state.half = None;
                    self.set_connected(false);
                    return Err(LinkError::Io(e));
                }
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(mut half) = self.writer.lock().await.take() {
            let _ = half.shutdown().await;
        }
        {
            let mut reader = self.reader.lock().await;
            reader.half = None;
            reader.acc.clear();
        }
        self.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }
}

/// Creates real TCP links
#[derive(Debug, Clone, Default)]
pub struct TcpLinkFactory {
    settings: LinkSettings,
}

impl TcpLinkFactory {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }
}

impl LinkFactory for TcpLinkFactory {
    fn create(&self, endpoint: &DeviceEndpoint) -> Arc<dyn DeviceLink> {
        Arc::new(TcpDeviceLink::new(endpoint.clone(), self.settings))
    }
}
