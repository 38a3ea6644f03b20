//! Public sorting engine facade
//!
//! `Sorter` owns configuration, the shared correlation state and, while
//! running, the line supervisor task. The identification subsystem calls
//! `process_package`; status consumers read device connectivity or subscribe
//! to its changes.

use crate::domain::types::{Chute, DeviceStatusEvent, Package, PackageId, PendingPackage};
use crate::infra::config::{Config, LineMode};
use crate::infra::metrics::{Metrics, RejectReason};
use crate::io::error::LinkError;
use crate::io::link::{DeviceLink, LinkFactory};
use crate::io::plc::PlcFrame;
use crate::services::actuator::LaneActuator;
use crate::services::correlator::{CorrelationError, TriggerAssignment};
use crate::services::line::{DeviceSet, LineShared, LineTask, StartupError};
use crate::services::registry::{run_timeout_supervisor, RegistryError};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("sorter is not running")]
    NotRunning,

    #[error("chute {0} is not served by this line")]
    UnknownChute(Chute),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("package {0} has no PLC sequence number (trigger was estimated)")]
    NoSequence(PackageId),

    #[error("sort command for package {index} not sent: {source}")]
    Send {
        index: PackageId,
        #[source]
        source: LinkError,
    },
}

impl SortError {
    pub fn reason(&self) -> RejectReason {
        match self {
            SortError::NotRunning => RejectReason::NotRunning,
            SortError::UnknownChute(_) => RejectReason::UnknownChute,
            SortError::Correlation(CorrelationError::Ambiguous { .. }) => RejectReason::Ambiguous,
            SortError::Correlation(CorrelationError::OutOfWindow { .. }) => RejectReason::Timing,
            SortError::Registry(RegistryError::Duplicate(_)) => RejectReason::Duplicate,
            SortError::NoSequence(_) => RejectReason::NoSequence,
            SortError::Send { .. } => RejectReason::SendFailed,
        }
    }
}

/// Log package rejection (cold path)
#[cold]
fn log_package_rejected(index: PackageId, chute: Chute, e: &SortError) {
    warn!(index = %index, chute = %chute, reason = e.reason().as_str(), error = %e, "package_rejected");
}

/// Per-lane view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct LaneDiagnostics {
    pub name: String,
    pub position: &'static str,
    pub last_index: Option<u64>,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct SorterDiagnostics {
    pub running: bool,
    pub mode: &'static str,
    /// RFC 3339 wall-clock time of the last successful start
    pub started_at: Option<String>,
    pub pending_packages: usize,
    pub queued_pulses: usize,
    pub marks_in_flight: usize,
    pub trigger_delay_median_ms: Option<u64>,
    pub lane_latency_median_ms: Option<u64>,
    pub lanes: Vec<LaneDiagnostics>,
}

/// What `process_package` needs from the current run
struct ActiveLine {
    config: Arc<Config>,
    lanes: Vec<Arc<LaneActuator>>,
    plc: Option<Arc<dyn DeviceLink>>,
    started_at: OffsetDateTime,
}

/// Handles owned while running
struct RunningLine {
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    timeouts: JoinHandle<()>,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct Sorter {
    config: RwLock<Arc<Config>>,
    factory: Arc<dyn LinkFactory>,
    shared: Arc<LineShared>,
    active: RwLock<Option<Arc<ActiveLine>>>,
    /// Serialises start/stop/reconfigure
    line: tokio::sync::Mutex<Option<RunningLine>>,
    running: AtomicBool,
}

impl Sorter {
    pub fn new(config: Config, factory: Arc<dyn LinkFactory>, metrics: Arc<Metrics>) -> Self {
        let shared = Arc::new(LineShared::new(&config, metrics));
        Self {
            config: RwLock::new(Arc::new(config)),
            factory,
            shared,
            active: RwLock::new(None),
            line: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Connect every device and start dispatching
    ///
    /// Fails fast: if any device cannot be connected or started nothing is
    /// left running.
    pub async fn start(&self) -> Result<(), StartupError> {
        let mut line = self.line.lock().await;
        if line.is_some() {
            return Err(StartupError::AlreadyRunning);
        }

        let config = Arc::clone(&self.config.read());
        config.validate().map_err(|e| StartupError::InvalidConfig(format!("{e:#}")))?;
        self.shared.correlator.reconfigure(config.trigger_window(), config.slack());

        let devices = DeviceSet::build(&config, self.factory.as_ref());
        let names = devices.names();
        self.shared.devices.register(names.iter().map(String::as_str));
        let forwarders = devices.spawn_status_forwarders(&self.shared.devices);

        info!(mode = config.mode().as_str(), devices = ?names, "sorter_starting");
        if let Err(e) = devices.connect_all(config.commands()).await {
            for forwarder in &forwarders {
                forwarder.abort();
            }
            self.shared.devices.mark_all_disconnected();
            return Err(e);
        }
        devices.publish_states(&self.shared.devices);

        let lanes: Vec<Arc<LaneActuator>> = devices
            .lanes
            .iter()
            .zip(config.lanes())
            .enumerate()
            .map(|(idx, (link, lane))| {
                Arc::new(LaneActuator::new(
                    idx,
                    lane.clone(),
                    Arc::clone(link),
                    config.commands().clone(),
                    Arc::clone(&self.shared.registry),
                    Arc::clone(&self.shared.marks),
                    Arc::clone(&self.shared.lane_latency),
                    Arc::clone(&self.shared.metrics),
                ))
            })
            .collect();
        let plc = devices.plc.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeouts = tokio::spawn(run_timeout_supervisor(
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.marks),
            Arc::clone(&self.shared.metrics),
            shutdown_rx.clone(),
        ));

        let task = LineTask {
            devices,
            lanes: lanes.clone(),
            commands: config.commands().clone(),
            shared: Arc::clone(&self.shared),
            reconnect_delay: config.reconnect_delay(),
            channel_capacity: config.event_channel_capacity(),
        };
        let supervisor = tokio::spawn(task.run(shutdown_rx));

        *self.active.write() = Some(Arc::new(ActiveLine {
            config,
            lanes,
            plc,
            started_at: OffsetDateTime::now_utc(),
        }));
        self.running.store(true, Ordering::SeqCst);
        *line = Some(RunningLine { shutdown_tx, supervisor, timeouts, forwarders });

        info!("sorter_started");
        Ok(())
    }

    /// Stop lanes, disconnect everything and forget all in-memory state
    ///
    /// Actuation already in progress finishes on its own; its sends fail once
    /// the links are down.
    pub async fn stop(&self) {
        let mut line = self.line.lock().await;
        let Some(running) = line.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        *self.active.write() = None;

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.supervisor.await {
            warn!(error = %e, "line_supervisor_join_failed");
        }
        if let Err(e) = running.timeouts.await {
            warn!(error = %e, "timeout_supervisor_join_failed");
        }
        for forwarder in running.forwarders {
            forwarder.abort();
        }

        self.shared.devices.mark_all_disconnected();
        self.shared.reset();
        info!("sorter_stopped");
    }

    /// Swap the configuration; a running line is stopped and started again
    pub async fn update_configuration(&self, config: Config) -> Result<(), StartupError> {
        config.validate().map_err(|e| StartupError::InvalidConfig(format!("{e:#}")))?;

        let was_running = self.is_running();
        if was_running {
            self.stop().await;
        }

        info!(
            config_file = %config.config_file(),
            lanes = config.lanes().len(),
            restart = was_running,
            "sorter_reconfigured"
        );
        *self.config.write() = Arc::new(config);

        if was_running {
            self.start().await?;
        }
        Ok(())
    }

    /// Correlate an identified package with its entry pulse and queue it
    pub async fn process_package(
        &self,
        package: Package,
        chute: Chute,
    ) -> Result<TriggerAssignment, SortError> {
        let now = Instant::now();
        let index = package.index;
        let result = self.try_process(package, chute, now).await;

        let metrics = &self.shared.metrics;
        metrics.record_package_received(now.elapsed().as_micros() as u64);
        match &result {
            Ok(assignment) => {
                metrics.record_package_queued(assignment.estimated, assignment.delay.as_millis() as u64)
            }
            Err(e) => {
                metrics.record_rejected(e.reason());
                log_package_rejected(index, chute, e);
            }
        }
        result
    }

    async fn try_process(
        &self,
        package: Package,
        chute: Chute,
        now: Instant,
    ) -> Result<TriggerAssignment, SortError> {
        let active = self.active.read().clone();
        let Some(active) = active else {
            return Err(SortError::NotRunning);
        };
        let config = &active.config;

        let (lane, travel) = match config.mode() {
            LineMode::Pendulum => {
                let lane = config.lane_for_chute(chute).ok_or(SortError::UnknownChute(chute))?;
                (lane, config.lanes()[lane].window.upper)
            }
            LineMode::Plc => {
                if chute.0 == 0 || chute.0 > u16::from(u8::MAX) {
                    return Err(SortError::UnknownChute(chute));
                }
                (config.lane_for_chute(chute).unwrap_or(0), config.plc_feedback_timeout())
            }
        };

        // Checked before correlating so a duplicate does not consume a pulse
        if self.shared.registry.contains(package.index) {
            return Err(RegistryError::Duplicate(package.index).into());
        }

        let assignment = self.shared.correlator.assign(now)?;
        if config.mode() == LineMode::Plc && assignment.plc_seq.is_none() {
            return Err(SortError::NoSequence(package.index));
        }

        let pending = PendingPackage {
            index: package.index,
            barcode: package.barcode,
            chute,
            lane,
            direction: chute.direction(),
            trigger_at: assignment.trigger_at,
            processing_delay: assignment.delay,
            estimated: assignment.estimated,
            plc_seq: assignment.plc_seq,
            deadline: now + travel + config.slack(),
        };
        let index = pending.index;
        self.shared.registry.insert(pending)?;

        if let (Some(plc), Some(seq)) = (&active.plc, assignment.plc_seq) {
            // Range checked above
            let frame = PlcFrame::SortCommand { seq, chute: chute.0 as u8 }.encode();
            if let Err(source) = plc.send(&frame).await {
                self.shared.registry.remove(index);
                return Err(SortError::Send { index, source });
            }
        }

        debug!(
            index = %index,
            chute = %chute,
            lane = lane,
            delay_ms = assignment.delay.as_millis() as u64,
            estimated = assignment.estimated,
            plc_seq = ?assignment.plc_seq,
            "package_queued"
        );
        Ok(assignment)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn device_connection_state(&self, name: &str) -> Option<bool> {
        self.shared.devices.get(name)
    }

    /// Every known device sorted by name
    pub fn all_device_connection_states(&self) -> Vec<(String, bool)> {
        self.shared.devices.snapshot()
    }

    pub fn subscribe_device_status(&self) -> broadcast::Receiver<DeviceStatusEvent> {
        self.shared.devices.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn queued_pulses(&self) -> usize {
        self.shared.correlator.pending_pulses()
    }

    pub fn diagnostics(&self) -> SorterDiagnostics {
        let active = self.active.read().clone();
        let lanes = active
            .as_ref()
            .map(|line| {
                line.lanes
                    .iter()
                    .map(|lane| {
                        let state = lane.state();
                        LaneDiagnostics {
                            name: lane.name().to_string(),
                            position: state.position.as_str(),
                            last_index: state.last_index.map(|idx| idx.0),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        SorterDiagnostics {
            running: self.is_running(),
            mode: self.config.read().mode().as_str(),
            started_at: active.as_ref().and_then(|line| line.started_at.format(&Rfc3339).ok()),
            pending_packages: self.shared.registry.len(),
            queued_pulses: self.shared.correlator.pending_pulses(),
            marks_in_flight: self.shared.marks.len(),
            trigger_delay_median_ms: self
                .shared
                .correlator
                .history_median()
                .map(|d| d.as_millis() as u64),
            lane_latency_median_ms: self
                .shared
                .lane_latency
                .lock()
                .median()
                .map(|d| d.as_millis() as u64),
            lanes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PendulumPosition;
    use crate::infra::config::{LaneConfig, PLC_DEVICE, TRIGGER_DEVICE};
    use crate::io::link::DeviceMessage;
    use crate::io::mock_link::MockLinkFactory;
    use crate::io::sensor::{ActuatorCommand, SensorSignal};
    use std::time::Duration;

    fn config() -> Config {
        Config::default()
            .with_lanes(vec![
                LaneConfig::new("lane-1", "mock", 1000, 2000).with_delays(20, 100),
                LaneConfig::new("lane-2", "mock", 1500, 3000).with_delays(20, 100),
            ])
            .with_trigger_window(100, 600)
            .with_reconnect_delay_ms(100)
    }

    fn sorter(config: Config) -> (Sorter, Arc<MockLinkFactory>) {
        let factory = Arc::new(MockLinkFactory::default());
        let sorter = Sorter::new(config, factory.clone(), Arc::new(Metrics::new()));
        (sorter, factory)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn pulse() -> DeviceMessage {
        DeviceMessage::Sensor(SensorSignal::triggered(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_package_before_start_fails() {
        let (sorter, _) = sorter(config());
        let err = sorter.process_package(Package::new(1, "A"), Chute(1)).await.unwrap_err();
        assert!(matches!(err, SortError::NotRunning));
        assert_eq!(sorter.metrics().rejected(RejectReason::NotRunning), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_publishes_device_states() {
        let (sorter, _) = sorter(config());
        let mut events = sorter.subscribe_device_status();
        sorter.start().await.unwrap();

        assert!(sorter.is_running());
        assert_eq!(sorter.device_connection_state(TRIGGER_DEVICE), Some(true));
        assert_eq!(
            sorter.all_device_connection_states(),
            vec![
                ("lane-1".to_string(), true),
                ("lane-2".to_string(), true),
                (TRIGGER_DEVICE.to_string(), true),
            ]
        );
        assert!(events.recv().await.unwrap().connected);

        sorter.stop().await;
        assert!(!sorter.is_running());
        assert_eq!(sorter.device_connection_state("lane-1"), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_fast() {
        let (sorter, factory) = sorter(config());
        factory.link("lane-2").set_fail_connect(true);

        let err = sorter.start().await.unwrap_err();
        assert!(matches!(err, StartupError::Connect { .. }));
        assert!(!sorter.is_running());
        assert!(!factory.link(TRIGGER_DEVICE).is_connected());
        assert!(!factory.link("lane-1").is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_rejected() {
        let (sorter, _) = sorter(config());
        sorter.start().await.unwrap();
        assert!(matches!(sorter.start().await, Err(StartupError::AlreadyRunning)));
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_package_sorted_end_to_end() {
        let (sorter, factory) = sorter(config());
        sorter.start().await.unwrap();
        let trigger = factory.link(TRIGGER_DEVICE);
        let lane = factory.link("lane-1");
        lane.clear_sent();

        trigger.push_message(pulse());
        settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let assignment = sorter.process_package(Package::new(4, "A4"), Chute(2)).await.unwrap();
        assert!(!assignment.estimated);
        assert_eq!(assignment.delay, Duration::from_millis(300));
        assert_eq!(sorter.pending_count(), 1);
        assert_eq!(sorter.queued_pulses(), 0);

        // Package reaches lane 1 after 1500 ms of travel
        tokio::time::sleep(Duration::from_millis(1200)).await;
        lane.push_message(pulse());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let commands = sorter.config().commands().clone();
        let sent: Vec<_> = lane.sent().iter().filter_map(|b| commands.identify(b)).collect();
        assert_eq!(sent, vec![ActuatorCommand::SwingRight, ActuatorCommand::ResetRight]);
        assert_eq!(sorter.pending_count(), 0);

        let diag = sorter.diagnostics();
        assert_eq!(diag.lanes[0].last_index, Some(4));
        assert_eq!(diag.lanes[0].position, PendulumPosition::Neutral.as_str());
        assert_eq!(diag.trigger_delay_median_ms, Some(300));
        assert!(diag.started_at.is_some());
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_chute_rejected() {
        let (sorter, _) = sorter(config());
        sorter.start().await.unwrap();

        let err = sorter.process_package(Package::new(1, ""), Chute(5)).await.unwrap_err();
        assert!(matches!(err, SortError::UnknownChute(Chute(5))));
        let err = sorter.process_package(Package::new(2, ""), Chute(0)).await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::UnknownChute);
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_does_not_consume_pulse() {
        let (sorter, factory) = sorter(config());
        sorter.start().await.unwrap();
        let trigger = factory.link(TRIGGER_DEVICE);

        // First package estimated (no pulses yet, history empty)
        let first = sorter.process_package(Package::new(9, "first"), Chute(1)).await.unwrap();
        assert!(first.estimated);

        trigger.push_message(pulse());
        settle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = sorter.process_package(Package::new(9, "again"), Chute(1)).await.unwrap_err();
        assert!(matches!(err, SortError::Registry(RegistryError::Duplicate(PackageId(9)))));
        assert_eq!(sorter.queued_pulses(), 1);
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_package_rejected() {
        let (sorter, factory) = sorter(config());
        sorter.start().await.unwrap();

        factory.link(TRIGGER_DEVICE).push_message(pulse());
        settle().await;
        // Pulse is only 10 ms old, below the 100 ms lower bound
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = sorter.process_package(Package::new(1, ""), Chute(1)).await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Ambiguous);
        assert_eq!(sorter.pending_count(), 0);
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_package_times_out() {
        let (sorter, _) = sorter(config());
        sorter.start().await.unwrap();

        sorter.process_package(Package::new(1, ""), Chute(3)).await.unwrap();
        // lane-2 upper 3000 + slack 500
        tokio::time::sleep(Duration::from_millis(3400)).await;
        assert_eq!(sorter.pending_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sorter.pending_count(), 0);
        assert_eq!(sorter.metrics().timeouts(), 1);

        sorter.process_package(Package::new(1, ""), Chute(3)).await.unwrap();
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_state_and_stops_lanes() {
        let (sorter, factory) = sorter(config());
        sorter.start().await.unwrap();
        factory.link(TRIGGER_DEVICE).push_message(pulse());
        settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        sorter.process_package(Package::new(1, ""), Chute(1)).await.unwrap();
        factory.link(TRIGGER_DEVICE).push_message(pulse());
        settle().await;

        sorter.stop().await;
        assert_eq!(sorter.pending_count(), 0);
        assert_eq!(sorter.queued_pulses(), 0);
        assert_eq!(sorter.diagnostics().trigger_delay_median_ms, None);

        let commands = sorter.config().commands().clone();
        let lane = factory.link("lane-1");
        assert_eq!(lane.sent().last().and_then(|b| commands.identify(b)), Some(ActuatorCommand::Stop));
        assert!(!lane.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_configuration_restarts_with_new_lanes() {
        let (sorter, factory) = sorter(config());
        sorter.start().await.unwrap();

        let next = config().with_lanes(vec![LaneConfig::new("lane-9", "mock", 1000, 2000)]);
        sorter.update_configuration(next).await.unwrap();

        assert!(sorter.is_running());
        assert_eq!(sorter.device_connection_state("lane-9"), Some(true));
        assert_eq!(sorter.device_connection_state("lane-1"), None);
        assert_eq!(factory.link(TRIGGER_DEVICE).connect_calls(), 2);
        sorter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_configuration_rejects_invalid() {
        let (sorter, _) = sorter(config());
        let err = sorter.update_configuration(config().with_lanes(vec![])).await.unwrap_err();
        assert!(matches!(err, StartupError::InvalidConfig(_)));
        assert_eq!(sorter.config().lanes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plc_mode_sends_sort_command() {
        let (sorter, factory) = sorter(config().with_mode(LineMode::Plc));
        sorter.start().await.unwrap();
        let plc = factory.link(PLC_DEVICE);

        // No notice yet: estimated trigger has no sequence number
        let err = sorter.process_package(Package::new(1, ""), Chute(3)).await.unwrap_err();
        assert!(matches!(err, SortError::NoSequence(PackageId(1))));

        plc.push_message(DeviceMessage::Plc(PlcFrame::SequenceNotice { seq: 0x0102 }));
        settle().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let assignment = sorter.process_package(Package::new(2, ""), Chute(3)).await.unwrap();
        assert_eq!(assignment.plc_seq, Some(0x0102));
        assert_eq!(
            plc.sent(),
            vec![PlcFrame::SortCommand { seq: 0x0102, chute: 3 }.encode().to_vec()]
        );

        plc.push_message(DeviceMessage::Plc(PlcFrame::Feedback { seq: 0x0102, error: 0, chute: 3 }));
        settle().await;
        assert_eq!(sorter.pending_count(), 0);
        sorter.stop().await;
    }
}
