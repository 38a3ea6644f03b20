//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!



use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Actuation / travel time bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
const DELAY_MS_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn delay_bucket_index(delay_ms: u64) -> usize {
    DELAY_MS_BOUNDS.partition_point(|&bound| bound < delay_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], bounds: &[u64; 10], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports 2x the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Why `process_package` refused a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Valid pulses pending but none inside the window
    Ambiguous,
    /// Assigned trigger failed final window validation
    Timing,
    Duplicate,
    UnknownChute,
    NotRunning,
    /// PLC mode needs a real sequence notice
    NoSequence,
    /// PLC sort command could not be sent
    SendFailed,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::Ambiguous,
        RejectReason::Timing,
        RejectReason::Duplicate,
        RejectReason::UnknownChute,
        RejectReason::NotRunning,
        RejectReason::NoSequence,
        RejectReason::SendFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Ambiguous => "ambiguous",
            RejectReason::Timing => "timing",
            RejectReason::Duplicate => "duplicate",
            RejectReason::UnknownChute => "unknown_chute",
            RejectReason::NotRunning => "not_running",
            RejectReason::NoSequence => "no_sequence",
            RejectReason::SendFailed => "send_failed",
        }
    }
}

const NUM_REASONS: usize = RejectReason::ALL.len();

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Packages handed to `process_package` (monotonic)
    packages_total: AtomicU64,
    /// Packages since last report (reset on report)
    packages_since_report: AtomicU64,
    /// Packages that entered the pending registry (monotonic)
    packages_queued: AtomicU64,
    /// Rejections by reason (monotonic)
    rejected: [AtomicU64; NUM_REASONS],
    /// Packages queued with an estimated trigger (monotonic)
    estimated_triggers: AtomicU64,
    /// Packages evicted by the timeout supervisor (monotonic)
    timeouts: AtomicU64,
    /// Packages actuated and removed (monotonic)
    packages_sorted: AtomicU64,
    entry_pulses: AtomicU64,
    /// Entry pulses discarded unmatched after upper + slack
    expired_pulses: AtomicU64,
    lane_pulses: AtomicU64,
    /// Lane pulses with no candidate package
    unmatched_lane_pulses: AtomicU64,
    swings_sent: AtomicU64,
    resets_sent: AtomicU64,
    resets_skipped: AtomicU64,
    send_failures: AtomicU64,
    reconnects: AtomicU64,
    plc_feedback_ok: AtomicU64,
    plc_feedback_errors: AtomicU64,
    /// `process_package` latency histogram, µs (reset on report)
    process_latency_buckets: [AtomicU64; NUM_BUCKETS],
    process_latency_sum_us: AtomicU64,
    process_latency_max_us: AtomicU64,
    /// Pulse-to-actuation-complete histogram, ms (cumulative)
    actuation_buckets: [AtomicU64; NUM_BUCKETS],
    actuation_sum_ms: AtomicU64,
    /// Observed entry pulse to identification delay, ms (cumulative)
    trigger_delay_buckets: [AtomicU64; NUM_BUCKETS],
    trigger_delay_sum_ms: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packages_total: AtomicU64::new(0),
            packages_since_report: AtomicU64::new(0),
            packages_queued: AtomicU64::new(0),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            estimated_triggers: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            packages_sorted: AtomicU64::new(0),
            entry_pulses: AtomicU64::new(0),
            expired_pulses: AtomicU64::new(0),
            lane_pulses: AtomicU64::new(0),
            unmatched_lane_pulses: AtomicU64::new(0),
            swings_sent: AtomicU64::new(0),
            resets_sent: AtomicU64::new(0),
            resets_skipped: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            plc_feedback_ok: AtomicU64::new(0),
            plc_feedback_errors: AtomicU64::new(0),
            process_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            process_latency_sum_us: AtomicU64::new(0),
            process_latency_max_us: AtomicU64::new(0),
            actuation_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            actuation_sum_ms: AtomicU64::new(0),
            trigger_delay_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            trigger_delay_sum_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a `process_package` call and its latency (lock-free)
    #[inline]
    pub fn record_package_received(&self, latency_us: u64) {
        self.packages_total.fetch_add(1, Ordering::Relaxed);
        self.packages_since_report.fetch_add(1, Ordering::Relaxed);
        self.process_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.process_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.process_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_package_queued(&self, estimated: bool, trigger_delay_ms: u64) {
        self.packages_queued.fetch_add(1, Ordering::Relaxed);
        if estimated {
            self.estimated_triggers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.trigger_delay_buckets[delay_bucket_index(trigger_delay_ms)]
                .fetch_add(1, Ordering::Relaxed);
            self.trigger_delay_sum_ms.fetch_add(trigger_delay_ms, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_rejected(&self, reason: RejectReason) {
        self.rejected[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a package whose actuation sequence completed
    #[inline]
    pub fn record_sorted(&self, actuation_ms: u64) {
        self.packages_sorted.fetch_add(1, Ordering::Relaxed);
        self.actuation_buckets[delay_bucket_index(actuation_ms)].fetch_add(1, Ordering::Relaxed);
        self.actuation_sum_ms.fetch_add(actuation_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry_pulse(&self) {
        self.entry_pulses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expired_pulses(&self, count: u64) {
        self.expired_pulses.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lane_pulse(&self, matched: bool) {
        self.lane_pulses.fetch_add(1, Ordering::Relaxed);
        if !matched {
            self.unmatched_lane_pulses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_swing(&self) {
        self.swings_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reset(&self, skipped: bool) {
        if skipped {
            self.resets_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.resets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plc_feedback(&self, ok: bool) {
        if ok {
            self.plc_feedback_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plc_feedback_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn packages_total(&self) -> u64 {
        self.packages_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn packages_queued(&self) -> u64 {
        self.packages_queued.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected[reason as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn swings_sent(&self) -> u64 {
        self.swings_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn resets_sent(&self) -> u64 {
        self.resets_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn resets_skipped(&self) -> u64 {
        self.resets_skipped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, pending: usize, queued_pulses: usize) -> MetricsSummary {
        let packages_count = self.packages_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.process_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.process_latency_max_us.swap(0, Ordering::Relaxed);
        let latency_buckets = swap_buckets(&self.process_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let packages_per_min = if elapsed.as_secs_f64() > 0.0 {
            packages_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut summary = self.snapshot(pending, queued_pulses);
        summary.packages_per_min = packages_per_min;
        summary.process_latency_buckets = latency_buckets;
        summary.process_latency_avg_us =
            if packages_count > 0 { latency_sum / packages_count } else { 0 };
        summary.process_latency_max_us = latency_max;
        summary.process_latency_p99_us =
            percentile_from_buckets(&latency_buckets, &BUCKET_BOUNDS, 0.99);
        summary
    }

    /// Read every counter without resetting anything (used by scrapes)
    pub fn snapshot(&self, pending: usize, queued_pulses: usize) -> MetricsSummary {
        let rejected = std::array::from_fn(|i| self.rejected[i].load(Ordering::Relaxed));

        let process_latency_buckets = load_buckets(&self.process_latency_buckets);
        let process_count: u64 = process_latency_buckets.iter().sum();
        let process_latency_sum = self.process_latency_sum_us.load(Ordering::Relaxed);

        let actuation_buckets = load_buckets(&self.actuation_buckets);
        let actuation_count: u64 = actuation_buckets.iter().sum();
        let actuation_sum = self.actuation_sum_ms.load(Ordering::Relaxed);

        let trigger_delay_buckets = load_buckets(&self.trigger_delay_buckets);
        let trigger_count: u64 = trigger_delay_buckets.iter().sum();
        let trigger_sum = self.trigger_delay_sum_ms.load(Ordering::Relaxed);

        MetricsSummary {
            packages_total: self.packages_total.load(Ordering::Relaxed),
            packages_per_min: 0.0,
            packages_queued: self.packages_queued.load(Ordering::Relaxed),
            packages_sorted: self.packages_sorted.load(Ordering::Relaxed),
            rejected,
            estimated_triggers: self.estimated_triggers.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            entry_pulses: self.entry_pulses.load(Ordering::Relaxed),
            expired_pulses: self.expired_pulses.load(Ordering::Relaxed),
            lane_pulses: self.lane_pulses.load(Ordering::Relaxed),
            unmatched_lane_pulses: self.unmatched_lane_pulses.load(Ordering::Relaxed),
            swings_sent: self.swings_sent.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            resets_skipped: self.resets_skipped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            plc_feedback_ok: self.plc_feedback_ok.load(Ordering::Relaxed),
            plc_feedback_errors: self.plc_feedback_errors.load(Ordering::Relaxed),
            process_latency_buckets,
            process_latency_avg_us: if process_count > 0 {
                process_latency_sum / process_count
            } else {
                0
            },
            process_latency_max_us: self.process_latency_max_us.load(Ordering::Relaxed),
            process_latency_p99_us: percentile_from_buckets(
                &process_latency_buckets,
                &BUCKET_BOUNDS,
                0.99,
            ),
            actuation_buckets,
            actuation_avg_ms: if actuation_count > 0 { actuation_sum / actuation_count } else { 0 },
            actuation_p99_ms: percentile_from_buckets(&actuation_buckets, &DELAY_MS_BOUNDS, 0.99),
            trigger_delay_buckets,
            trigger_delay_avg_ms: if trigger_count > 0 { trigger_sum / trigger_count } else { 0 },
            pending,
            queued_pulses,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_DELAY_MS_BOUNDS: [u64; 10] = DELAY_MS_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub packages_total: u64,
    /// Only filled by `report()`
    pub packages_per_min: f64,
    pub packages_queued: u64,
    pub packages_sorted: u64,
    /// Indexed by `RejectReason as usize`
    pub rejected: [u64; NUM_REASONS],
    pub estimated_triggers: u64,
    pub timeouts: u64,
    pub entry_pulses: u64,
    pub expired_pulses: u64,
    pub lane_pulses: u64,
    pub unmatched_lane_pulses: u64,
    pub swings_sent: u64,
    pub resets_sent: u64,
    pub resets_skipped: u64,
    pub send_failures: u64,
    pub reconnects: u64,
    pub plc_feedback_ok: u64,
    pub plc_feedback_errors: u64,
    /// `process_package` latency buckets (µs)
    pub process_latency_buckets: [u64; NUM_BUCKETS],
    pub process_latency_avg_us: u64,
    pub process_latency_max_us: u64,
    pub process_latency_p99_us: u64,
    /// Actuation duration buckets (ms)
    pub actuation_buckets: [u64; NUM_BUCKETS],
    pub actuation_avg_ms: u64,
    pub actuation_p99_ms: u64,
    /// Matched trigger delay buckets (ms)
    pub trigger_delay_buckets: [u64; NUM_BUCKETS],
    pub trigger_delay_avg_ms: u64,
    /// Packages waiting for a lane pulse (snapshot)
    pub pending: usize,
    /// Entry pulses waiting for a package (snapshot)
    pub queued_pulses: usize,
}

impl MetricsSummary {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.iter().sum()
    }

    pub fn log(&self) {
        info!(
            packages_total = %self.packages_total,
            packages_per_min = format!("{:.1}", self.packages_per_min),
            queued = %self.packages_queued,
            sorted = %self.packages_sorted,
            rejected = %self.rejected_total(),
            estimated = %self.estimated_triggers,
            timeouts = %self.timeouts,
            pending = %self.pending,
            queued_pulses = %self.queued_pulses,
            swings = %self.swings_sent,
            resets = %self.resets_sent,
            resets_skipped = %self.resets_skipped,
            send_failures = %self.send_failures,
            reconnects = %self.reconnects,
            process_p99_us = %self.process_latency_p99_us,
            actuation_p99_ms = %self.actuation_p99_ms,
            "metrics"
        );
    }
}
