//! Lane actuation state machine
//!
//! One `LaneActuator` per lane. Every lane sensor pulse selects the pending
//! packages expected at this lane right now and actuates them one after the
//! other in a spawned task:
//!
//! claim → swing delay → swing → reset delay → reset (or keep swung) → remove
//!
//! The reset is skipped when the next package for this lane swings the same
//! way, so back-to-back packages for one side do not make the pendulum flutter.

use crate::domain::history::DelayHistory;
use crate::domain::types::{PackageId, PendingPackage, PendulumPosition};
use crate::infra::config::LaneConfig;
use crate::infra::metrics::Metrics;
use crate::io::error::LinkError;
use crate::io::link::DeviceLink;
use crate::io::sensor::{ActuatorCommand, CommandTable};
use crate::services::registry::{PendingRegistry, ProcessingMarks};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Log actuator send failure (cold path)
#[cold]
fn log_send_failed(lane: &str, command: ActuatorCommand, index: PackageId, e: &LinkError) {
    warn!(lane = %lane, command = command.as_str(), index = %index, error = %e, "lane_command_failed");
}

/// Pendulum position and last package handled, per lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendulumState {
    pub position: PendulumPosition,
    pub last_index: Option<PackageId>,
}

/// Everything a lane needs to actuate packages
pub struct LaneActuator {
    lane: usize,
    config: LaneConfig,
    link: Arc<dyn DeviceLink>,
    commands: CommandTable,
    registry: Arc<PendingRegistry>,
    marks: Arc<ProcessingMarks>,
    /// Shared lane processing latency history
    latency: Arc<Mutex<DelayHistory>>,
    metrics: Arc<Metrics>,
    state: Mutex<PendulumState>,
}

impl LaneActuator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lane: usize,
        config: LaneConfig,
        link: Arc<dyn DeviceLink>,
        commands: CommandTable,
        registry: Arc<PendingRegistry>,
        marks: Arc<ProcessingMarks>,
        latency: Arc<Mutex<DelayHistory>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            lane,
            config,
            link,
            commands,
            registry,
            marks,
            latency,
            metrics,
            state: Mutex::new(PendulumState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> PendulumState {
        *self.state.lock()
    }

    /// Pending packages expected at this lane at `now`, oldest trigger first
    pub fn candidates(&self, now: Instant) -> Vec<PendingPackage> {
        let mut candidates: Vec<PendingPackage> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|pkg| {
                pkg.lane == self.lane
                    && !self.marks.is_marked(pkg.index)
                    && self.config.window.contains(pkg.age(now))
            })
            .collect();
        candidates.sort_by_key(|pkg| (pkg.trigger_at, pkg.index));
        candidates
    }

    /// Handle one lane sensor pulse; false when nothing was expected here
    pub fn on_pulse(self: &Arc<Self>, at: Instant) -> bool {
        if self.spawn_actuation(at).is_some() {
            return true;
        }
        debug!(lane = %self.config.name, pending = self.registry.len(), "lane_pulse_unmatched");
        false
    }

    /// Spawn the actuation task for a pulse, if any package is expected
    pub fn spawn_actuation(self: &Arc<Self>, at: Instant) -> Option<JoinHandle<()>> {
        let candidates = self.candidates(at);
        if candidates.is_empty() {
            return None;
        }
        debug!(lane = %self.config.name, candidates = candidates.len(), "lane_pulse_matched");
        let actuator = Arc::clone(self);
        Some(tokio::spawn(async move { actuator.actuate(candidates, at).await }))
    }

    /// Actuate candidates strictly in order
    pub async fn actuate(&self, candidates: Vec<PendingPackage>, pulse_at: Instant) {
        for pkg in candidates {
            let Some(_mark) =
                self.registry.claim(pkg.index, &self.config.name, &self.marks, Instant::now())
            else {
                debug!(lane = %self.config.name, index = %pkg.index, "lane_candidate_taken");
                continue;
            };

            tokio::time::sleep(self.config.swing_delay).await;
            if self.send(ActuatorCommand::swing(pkg.direction), pkg.index).await {
                self.metrics.record_swing();
            }

            tokio::time::sleep(self.config.reset_delay).await;
            let keep_swung = self.next_swings_same_way(&pkg);
            let position = if keep_swung {
                self.metrics.record_reset(true);
                PendulumPosition::Swung(pkg.direction)
            } else if self.send(ActuatorCommand::reset(pkg.direction), pkg.index).await {
                self.metrics.record_reset(false);
                PendulumPosition::Neutral
            } else {
                // Reset not delivered, assume the pendulum stayed out
                PendulumPosition::Swung(pkg.direction)
            };

            {
                let mut state = self.state.lock();
                state.position = position;
                state.last_index = Some(pkg.index);
            }

            self.registry.remove(pkg.index);
            let elapsed = pulse_at.elapsed();
            self.latency.lock().push(elapsed);
            self.metrics.record_sorted(elapsed.as_millis() as u64);

            info!(
                lane = %self.config.name,
                index = %pkg.index,
                chute = %pkg.chute,
                direction = pkg.direction.as_str(),
                reset_skipped = keep_swung,
                estimated = pkg.estimated,
                elapsed_ms = elapsed.as_millis() as u64,
                "package_sorted"
            );
            // `_mark` drops here, also on early exit
        }
    }

    /// Next unclaimed package for this lane, after `current`, swings the same way
    fn next_swings_same_way(&self, current: &PendingPackage) -> bool {
        self.next_for_lane(current).is_some_and(|next| next.direction == current.direction)
    }

    fn next_for_lane(&self, current: &PendingPackage) -> Option<PendingPackage> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|pkg| {
                pkg.lane == self.lane
                    && pkg.trigger_at > current.trigger_at
                    && pkg.index > current.index
                    && !self.marks.is_marked(pkg.index)
            })
            .min_by_key(|pkg| (pkg.trigger_at, pkg.index))
    }

    /// Send a command; failures are logged and counted, never propagated
    async fn send(&self, command: ActuatorCommand, index: PackageId) -> bool {
        match self.link.send(self.commands.frame(command)).await {
            Ok(()) => {
                debug!(lane = %self.config.name, command = command.as_str(), index = %index, "lane_command_sent");
                true
            }
            Err(e) => {
                log_send_failed(&self.config.name, command, index, &e);
                self.metrics.record_send_failure();
                false
            }
        }
    }
}
