//! Entry pulse to package correlation
//!
//! Entry sensor pulses queue up in arrival order. When a package is identified
//! the queue is drained once under a single lock: the oldest pulse whose age
//! lies inside the trigger window is taken, pulses that may still belong to a
//! later package go back in their original order, and pulses older than
//! `upper + slack` are dropped.
//!
//! With no pulse queued at all the trigger instant is estimated from the
//! median of recently observed delays, clamped into the window.

use crate::domain::history::DelayHistory;
use crate::domain::types::DelayWindow;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPulse {
    pub at: Instant,
    /// Sequence number announced by the PLC, if any
    pub plc_seq: Option<u16>,
}

/// Trigger instant chosen for one package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerAssignment {
    pub trigger_at: Instant,
    /// `now - trigger_at` at assignment
    pub delay: Duration,
    pub estimated: bool,
    pub plc_seq: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("{pending} entry pulse(s) pending but none within {lower_ms}-{upper_ms} ms")]
    Ambiguous { pending: usize, lower_ms: u64, upper_ms: u64 },

    #[error("trigger delay {delay_ms} ms outside window {lower_ms}-{upper_ms} ms")]
    OutOfWindow { delay_ms: u64, lower_ms: u64, upper_ms: u64 },
}

struct CorrelatorState {
    window: DelayWindow,
    slack: Duration,
    pulses: VecDeque<TriggerPulse>,
    history: DelayHistory,
}

impl CorrelatorState {
    #[inline]
    fn expiry(&self) -> Duration {
        self.window.upper + self.slack
    }
}

pub struct TriggerCorrelator {
    state: Mutex<CorrelatorState>,
    metrics: Arc<Metrics>,
}

impl TriggerCorrelator {
    pub fn new(window: DelayWindow, slack: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(CorrelatorState {
                window,
                slack,
                pulses: VecDeque::new(),
                history: DelayHistory::new(),
            }),
            metrics,
        }
    }

    /// Swap window and slack (pulses and history are kept)
    pub fn reconfigure(&self, window: DelayWindow, slack: Duration) {
        let mut state = self.state.lock();
        state.window = window;
        state.slack = slack;
    }

    /// Queue an entry pulse, dropping expired ones from the front
    pub fn record_pulse(&self, at: Instant, plc_seq: Option<u16>) {
        let mut state = self.state.lock();
        let expiry = state.expiry();

        let mut expired = 0u64;
        while let Some(front) = state.pulses.front() {
            if at.saturating_duration_since(front.at) <= expiry {
                break;
            }
            state.pulses.pop_front();
            expired += 1;
        }
        if expired > 0 {
            self.metrics.record_expired_pulses(expired);
        }

        state.pulses.push_back(TriggerPulse { at, plc_seq });
    }

    /// Choose the trigger instant for a package identified at `now`
    pub fn assign(&self, now: Instant) -> Result<TriggerAssignment, CorrelationError> {
        let mut state = self.state.lock();
        let window = state.window;
        let expiry = state.expiry();

        let queued = std::mem::take(&mut state.pulses);
        let mut requeued = VecDeque::with_capacity(queued.len());
        let mut matched = None;
        let mut expired = 0u64;

        for pulse in queued {
            let delay = now.saturating_duration_since(pulse.at);
            if matched.is_none() && window.contains(delay) {
                matched = Some((pulse, delay));
            } else if delay <= expiry {
                requeued.push_back(pulse);
            } else {
                expired += 1;
            }
        }
        state.pulses = requeued;

        if expired > 0 {
            self.metrics.record_expired_pulses(expired);
            debug!(expired = expired, "trigger_pulses_expired");
        }

        let assignment = match matched {
            Some((pulse, delay)) => {
                state.history.push(delay);
                TriggerAssignment {
                    trigger_at: pulse.at,
                    delay,
                    estimated: false,
                    plc_seq: pulse.plc_seq,
                }
            }
            None if !state.pulses.is_empty() => {
                return Err(CorrelationError::Ambiguous {
                    pending: state.pulses.len(),
                    lower_ms: window.lower.as_millis() as u64,
                    upper_ms: window.upper.as_millis() as u64,
                });
            }
            None => {
                let estimate = state
                    .history
                    .median()
                    .map(|median| window.clamp(median))
                    .unwrap_or_else(|| window.midpoint());
                // Right after boot the monotonic clock may be younger than the estimate
                let trigger_at = now.checked_sub(estimate).unwrap_or(now);
                TriggerAssignment { trigger_at, delay: estimate, estimated: true, plc_seq: None }
            }
        };

        let delay = now.saturating_duration_since(assignment.trigger_at);
        if !window.contains(delay) {
            return Err(CorrelationError::OutOfWindow {
                delay_ms: delay.as_millis() as u64,
                lower_ms: window.lower.as_millis() as u64,
                upper_ms: window.upper.as_millis() as u64,
            });
        }

        Ok(assignment)
    }

    pub fn pending_pulses(&self) -> usize {
        self.state.lock().pulses.len()
    }

    /// Queued pulse instants, oldest first
    pub fn queued(&self) -> Vec<TriggerPulse> {
        self.state.lock().pulses.iter().copied().collect()
    }

    pub fn history_median(&self) -> Option<Duration> {
        self.state.lock().history.median()
    }

    /// Drop queued pulses and delay history
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pulses.clear();
        state.history.clear();
    }

    #[cfg(test)]
    fn seed_history(&self, samples_ms: &[u64]) {
        let mut state = self.state.lock();
        for &ms in samples_ms {
            state.history.push(Duration::from_millis(ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn correlator(lower: u64, upper: u64) -> TriggerCorrelator {
        TriggerCorrelator::new(DelayWindow::from_millis(lower, upper), ms(500), Arc::new(Metrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_within_window_is_assigned_exactly() {
        let correlator = correlator(100, 300);
        let pulse_at = Instant::now();
        correlator.record_pulse(pulse_at, None);

        tokio::time::advance(ms(200)).await;
        let assignment = correlator.assign(Instant::now()).unwrap();

        assert_eq!(assignment.trigger_at, pulse_at);
        assert_eq!(assignment.delay, ms(200));
        assert!(!assignment.estimated);
        assert_eq!(correlator.pending_pulses(), 0);
        assert_eq!(correlator.history_median(), Some(ms(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bounds_are_inclusive() {
        let correlator = correlator(100, 300);
        let base = Instant::now();
        tokio::time::advance(ms(1000)).await;

        correlator.record_pulse(base + ms(700), None); // age 300 at now
        correlator.record_pulse(base + ms(900), None); // age 100 at now

        let now = Instant::now();
        assert_eq!(correlator.assign(now).unwrap().trigger_at, base + ms(700));
        assert_eq!(correlator.assign(now).unwrap().trigger_at, base + ms(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_pulses_keep_fifo_order() {
        let correlator = correlator(100, 300);
        let base = Instant::now();
        tokio::time::advance(ms(1000)).await;

        // Ages at now: 250 (match), 150, 80 (too fresh), 50 (too fresh)
        let pulses = [base + ms(750), base + ms(850), base + ms(920), base + ms(950)];
        for at in pulses {
            correlator.record_pulse(at, None);
        }

        let assignment = correlator.assign(Instant::now()).unwrap();
        assert_eq!(assignment.trigger_at, pulses[0]);

        let remaining: Vec<Instant> = correlator.queued().iter().map(|p| p.at).collect();
        assert_eq!(remaining, pulses[1..].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_pulses_without_match_are_ambiguous() {
        let correlator = correlator(100, 300);
        correlator.record_pulse(Instant::now(), None);

        tokio::time::advance(ms(20)).await;
        let err = correlator.assign(Instant::now()).unwrap_err();
        assert_eq!(err, CorrelationError::Ambiguous { pending: 1, lower_ms: 100, upper_ms: 300 });

        // Pulse stays for the next package
        assert_eq!(correlator.pending_pulses(), 1);
        tokio::time::advance(ms(100)).await;
        assert!(!correlator.assign(Instant::now()).unwrap().estimated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pulses_are_discarded() {
        let correlator = correlator(100, 300);
        correlator.record_pulse(Instant::now(), None);

        // Older than upper + slack
        tokio::time::advance(ms(801)).await;
        let assignment = correlator.assign(Instant::now()).unwrap();
        assert!(assignment.estimated);
        assert_eq!(correlator.pending_pulses(), 0);
        assert_eq!(correlator.metrics.snapshot(0, 0).expired_pulses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_but_not_expired_pulse_is_requeued() {
        let correlator = correlator(100, 300);
        correlator.record_pulse(Instant::now(), None);

        // Past upper, within slack
        tokio::time::advance(ms(600)).await;
        assert!(matches!(
            correlator.assign(Instant::now()),
            Err(CorrelationError::Ambiguous { pending: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_median_fallback_ignores_outlier() {
        let correlator = correlator(40, 400);
        correlator.seed_history(&[50, 52, 48, 300]);
        tokio::time::advance(ms(5000)).await;

        let now = Instant::now();
        let assignment = correlator.assign(now).unwrap();
        assert!(assignment.estimated);
        assert_eq!(assignment.plc_seq, None);
        assert_eq!(assignment.delay, ms(51));
        assert_eq!(assignment.trigger_at, now - ms(51));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_is_clamped_into_window() {
        let correlator = correlator(100, 300);
        correlator.seed_history(&[50, 52, 48, 300]);
        tokio::time::advance(ms(5000)).await;

        let assignment = correlator.assign(Instant::now()).unwrap();
        assert_eq!(assignment.delay, ms(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_without_history_uses_midpoint() {
        let correlator = correlator(100, 300);
        tokio::time::advance(ms(5000)).await;

        let assignment = correlator.assign(Instant::now()).unwrap();
        assert!(assignment.estimated);
        assert_eq!(assignment.delay, ms(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plc_sequence_travels_with_pulse() {
        let correlator = correlator(100, 300);
        correlator.record_pulse(Instant::now(), Some(42));

        tokio::time::advance(ms(150)).await;
        assert_eq!(correlator.assign(Instant::now()).unwrap().plc_seq, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_pulse_prunes_expired_front() {
        let correlator = correlator(100, 300);
        correlator.record_pulse(Instant::now(), None);
        tokio::time::advance(ms(900)).await;
        correlator.record_pulse(Instant::now(), None);

        assert_eq!(correlator.pending_pulses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_pulses_and_history() {
        let correlator = correlator(100, 300);
        correlator.seed_history(&[120]);
        correlator.record_pulse(Instant::now(), None);

        correlator.clear();
        assert_eq!(correlator.pending_pulses(), 0);
        assert_eq!(correlator.history_median(), None);
    }
}
