//! Connection lifecycle and event dispatch for a running line
//!
//! Every device link gets its own receive loop that stamps decoded messages
//! on arrival and pushes them as `LineEvent`s into one bounded channel. A
//! single dispatcher consumes that channel, so correlation and actuation see
//! events in one order and a silent device never holds up the others.
//!
//! Any link failure is a line fault: all receive loops are stopped, every link
//! is disconnected, and every link is connected again (lanes get their start
//! command once per attempt) until that succeeds or the line is stopped.

use crate::domain::history::DelayHistory;
use crate::infra::config::{Config, LineMode, PLC_DEVICE, TRIGGER_DEVICE};
use crate::infra::metrics::Metrics;
use crate::io::error::LinkError;
use crate::io::link::{DeviceEndpoint, DeviceLink, DeviceMessage, LinkFactory, WireProtocol};
use crate::io::plc::{PlcFrame, FEEDBACK_OK};
use crate::io::sensor::{ActuatorCommand, CommandTable};
use crate::services::actuator::LaneActuator;
use crate::services::correlator::TriggerCorrelator;
use crate::services::device_state::{spawn_status_forwarder, DeviceStates};
use crate::services::registry::{PendingRegistry, ProcessingMarks};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("sorter is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to connect {device}: {source}")]
    Connect {
        device: String,
        #[source]
        source: LinkError,
    },

    #[error("failed to send start command to {device}: {source}")]
    StartCommand {
        device: String,
        #[source]
        source: LinkError,
    },
}

/// Typed message from a receive loop to the dispatcher
#[derive(Debug)]
pub enum LineEvent {
    EntryPulse { at: Instant },
    LanePulse { lane: usize, at: Instant },
    Plc { frame: PlcFrame, at: Instant },
    LinkFailed { device: String, error: LinkError },
}

/// What a receive loop reports as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventSource {
    Entry,
    Lane(usize),
    Plc,
}

/// State shared by the dispatcher, the lanes and the public facade
pub struct LineShared {
    pub correlator: TriggerCorrelator,
    pub registry: Arc<PendingRegistry>,
    pub marks: Arc<ProcessingMarks>,
    /// Lane processing latency history
    pub lane_latency: Arc<Mutex<DelayHistory>>,
    pub devices: Arc<DeviceStates>,
    pub metrics: Arc<Metrics>,
}

impl LineShared {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            correlator: TriggerCorrelator::new(
                config.trigger_window(),
                config.slack(),
                Arc::clone(&metrics),
            ),
            registry: Arc::new(PendingRegistry::new()),
            marks: Arc::new(ProcessingMarks::new()),
            lane_latency: Arc::new(Mutex::new(DelayHistory::new())),
            devices: Arc::new(DeviceStates::new()),
            metrics,
        }
    }

    /// Forget every package, claim, pulse and sample
    pub fn reset(&self) {
        self.registry.clear();
        self.marks.clear();
        self.correlator.clear();
        self.lane_latency.lock().clear();
    }
}

/// All links of one line, in connect order
pub struct DeviceSet {
    pub entry: Option<Arc<dyn DeviceLink>>,
    pub lanes: Vec<Arc<dyn DeviceLink>>,
    pub plc: Option<Arc<dyn DeviceLink>>,
}

impl DeviceSet {
    pub fn build(config: &Config, factory: &dyn LinkFactory) -> Self {
        match config.mode() {
            LineMode::Pendulum => {
                let entry = factory.create(&DeviceEndpoint {
                    name: TRIGGER_DEVICE.to_string(),
                    addr: config.trigger_addr().to_string(),
                    protocol: WireProtocol::SensorAscii,
                });
                let lanes = config
                    .lanes()
                    .iter()
                    .map(|lane| {
                        factory.create(&DeviceEndpoint {
                            name: lane.name.clone(),
                            addr: lane.addr.clone(),
                            protocol: WireProtocol::SensorAscii,
                        })
                    })
                    .collect();
                Self { entry: Some(entry), lanes, plc: None }
            }
            LineMode::Plc => {
                let plc = factory.create(&DeviceEndpoint {
                    name: PLC_DEVICE.to_string(),
                    addr: config.plc_addr().to_string(),
                    protocol: WireProtocol::PlcBinary,
                });
                Self { entry: None, lanes: Vec::new(), plc: Some(plc) }
            }
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn DeviceLink>> {
        self.entry.iter().chain(self.lanes.iter()).chain(self.plc.iter())
    }

    pub fn names(&self) -> Vec<String> {
        self.all().map(|link| link.name().to_string()).collect()
    }

    /// Connect everything in order, starting each lane right after its connect
    ///
    /// On failure whatever was connected is disconnected again.
    pub async fn connect_all(&self, commands: &CommandTable) -> Result<(), StartupError> {
        let result = self.try_connect_all(commands).await;
        if result.is_err() {
            self.disconnect_all().await;
        }
        result
    }

    async fn try_connect_all(&self, commands: &CommandTable) -> Result<(), StartupError> {
        for link in self.entry.iter().chain(self.plc.iter()) {
            link.connect().await.map_err(|source| StartupError::Connect {
                device: link.name().to_string(),
                source,
            })?;
        }

        for link in &self.lanes {
            link.connect().await.map_err(|source| StartupError::Connect {
                device: link.name().to_string(),
                source,
            })?;
            link.send(commands.frame(ActuatorCommand::Start)).await.map_err(|source| {
                StartupError::StartCommand { device: link.name().to_string(), source }
            })?;
            debug!(lane = %link.name(), "lane_started");
        }

        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for link in self.all() {
            link.disconnect().await;
        }
    }

    /// Best effort stop command to every connected lane
    pub async fn stop_lanes(&self, commands: &CommandTable) {
        for link in &self.lanes {
            if !link.is_connected() {
                continue;
            }
            if let Err(e) = link.send(commands.frame(ActuatorCommand::Stop)).await {
                warn!(lane = %link.name(), error = %e, "lane_stop_failed");
            }
        }
    }

    /// Mirror each link's connected flag into the device map
    pub fn spawn_status_forwarders(&self, states: &Arc<DeviceStates>) -> Vec<JoinHandle<()>> {
        self.all()
            .map(|link| {
                spawn_status_forwarder(link.name().to_string(), link.subscribe(), Arc::clone(states))
            })
            .collect()
    }

    /// Copy current flags into the device map right away
    pub fn publish_states(&self, states: &DeviceStates) {
        for link in self.all() {
            states.set(link.name(), link.is_connected());
        }
    }

    fn spawn_readers(&self, tx: &mpsc::Sender<LineEvent>) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(self.lanes.len() + 1);
        if let Some(entry) = &self.entry {
            readers.push(spawn_reader(Arc::clone(entry), EventSource::Entry, tx.clone()));
        }
        for (lane, link) in self.lanes.iter().enumerate() {
            readers.push(spawn_reader(Arc::clone(link), EventSource::Lane(lane), tx.clone()));
        }
        if let Some(plc) = &self.plc {
            readers.push(spawn_reader(Arc::clone(plc), EventSource::Plc, tx.clone()));
        }
        readers
    }
}

/// Receive loop for one link; ends after reporting a failure
fn spawn_reader(
    link: Arc<dyn DeviceLink>,
    source: EventSource,
    tx: mpsc::Sender<LineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match link.receive().await {
                Ok(message) => {
                    let at = Instant::now();
                    match (source, message) {
                        (EventSource::Entry, DeviceMessage::Sensor(signal)) if signal.triggered => {
                            LineEvent::EntryPulse { at }
                        }
                        (EventSource::Lane(lane), DeviceMessage::Sensor(signal))
                            if signal.triggered =>
                        {
                            LineEvent::LanePulse { lane, at }
                        }
                        (EventSource::Plc, DeviceMessage::Plc(frame)) => LineEvent::Plc { frame, at },
                        // Idle transitions carry no information
                        (_, DeviceMessage::Sensor(_)) => continue,
                        (_, other) => {
                            warn!(device = %link.name(), message = ?other, "device_unexpected_message");
                            continue;
                        }
                    }
                }
                Err(error) => {
                    let _ = tx.send(LineEvent::LinkFailed { device: link.name().to_string(), error }).await;
                    return;
                }
            };

            if tx.send(event).await.is_err() {
                return;
            }
        }
    })
}

/// Resolve once the shutdown flag is true or its sender is gone
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

enum DispatchOutcome {
    Shutdown,
    Fault { device: String, error: LinkError },
}

/// Everything the supervisor task owns for one run
pub struct LineTask {
    pub devices: DeviceSet,
    pub lanes: Vec<Arc<LaneActuator>>,
    pub commands: CommandTable,
    pub shared: Arc<LineShared>,
    pub reconnect_delay: Duration,
    pub channel_capacity: usize,
}

impl LineTask {
    fn on_event(&self, event: LineEvent) -> Option<DispatchOutcome> {
        match event {
            LineEvent::EntryPulse { at } => {
                self.shared.correlator.record_pulse(at, None);
                self.shared.metrics.record_entry_pulse();
                debug!(queued = self.shared.correlator.pending_pulses(), "entry_pulse");
            }
            LineEvent::LanePulse { lane, at } => {
                let Some(actuator) = self.lanes.get(lane) else {
                    warn!(lane = lane, "lane_pulse_unknown_lane");
                    return None;
                };
                let matched = actuator.on_pulse(at);
                self.shared.metrics.record_lane_pulse(matched);
            }
            LineEvent::Plc { frame, at } => self.on_plc_frame(frame, at),
            LineEvent::LinkFailed { device, error } => {
                return Some(DispatchOutcome::Fault { device, error });
            }
        }
        None
    }

    fn on_plc_frame(&self, frame: PlcFrame, at: Instant) {
        match frame {
            PlcFrame::SequenceNotice { seq } => {
                self.shared.correlator.record_pulse(at, Some(seq));
                self.shared.metrics.record_entry_pulse();
                debug!(seq = seq, "plc_sequence_notice");
            }
            PlcFrame::Feedback { seq, error, chute } => {
                let ok = error == FEEDBACK_OK;
                self.shared.metrics.record_plc_feedback(ok);
                let Some(pkg) = self.shared.registry.remove_by_seq(seq) else {
                    warn!(seq = seq, error = error, chute = chute, "plc_feedback_unknown_seq");
                    return;
                };
                let elapsed = pkg.age(at);
                if ok {
                    self.shared.metrics.record_sorted(elapsed.as_millis() as u64);
                    info!(
                        index = %pkg.index,
                        seq = seq,
                        chute = chute,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "package_sorted"
                    );
                } else {
                    warn!(
                        index = %pkg.index,
                        seq = seq,
                        error = error,
                        requested_chute = %pkg.chute,
                        chute = chute,
                        "plc_feedback_error"
                    );
                }
            }
            PlcFrame::SortCommand { seq, .. } => {
                warn!(seq = seq, "plc_unexpected_sort_command");
            }
        }
    }

    async fn dispatch(
        &self,
        rx: &mut mpsc::Receiver<LineEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DispatchOutcome {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return DispatchOutcome::Shutdown,
                event = rx.recv() => {
                    let Some(event) = event else {
                        return DispatchOutcome::Fault {
                            device: "line".to_string(),
                            error: LinkError::NotConnected,
                        };
                    };
                    if let Some(outcome) = self.on_event(event) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Disconnect and reconnect every link until it works; false on shutdown
    async fn reconnect_all(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            self.devices.disconnect_all().await;
            self.shared.metrics.record_reconnect();

            tokio::select! {
                _ = shutdown_signalled(shutdown) => return false,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            let result = tokio::select! {
                _ = shutdown_signalled(shutdown) => return false,
                result = self.devices.connect_all(&self.commands) => result,
            };

            match result {
                Ok(()) => {
                    info!(devices = self.devices.names().len(), "line_reconnected");
                    return true;
                }
                Err(e) => warn!(error = %e, "line_reconnect_failed"),
            }
        }
    }

    /// Supervisor body: dispatch, reconnect-all on faults, stop on shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(devices = ?self.devices.names(), "line_supervisor_started");

        loop {
            // Fresh channel per connection round so no event from a dead round leaks in
            let (tx, mut rx) = mpsc::channel(self.channel_capacity);
            let readers = self.devices.spawn_readers(&tx);
            drop(tx);

            let outcome = self.dispatch(&mut rx, &mut shutdown).await;
            for reader in &readers {
                reader.abort();
            }

            match outcome {
                DispatchOutcome::Shutdown => break,
                DispatchOutcome::Fault { device, error: e } => {
                    error!(device = %device, error = %e, "line_fault_reconnecting_all");
                    if !self.reconnect_all(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.devices.stop_lanes(&self.commands).await;
        self.devices.disconnect_all().await;
        info!("line_supervisor_stopped");
    }
}
