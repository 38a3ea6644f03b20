//! Pending-sort registry, processing marks and the timeout supervisor
//!
//! Packages wait here between trigger assignment and their lane pulse. Each
//! insert pushes its eviction deadline onto one min-heap; a single supervisor
//! task sleeps until the earliest deadline instead of running a timer per
//! package.
//!
//! Lock order is registry then marks, never the reverse.

use crate::domain::types::{PackageId, PendingPackage};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Housekeeping interval for dropping heap entries of packages already gone
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("package {0} is already pending")]
    Duplicate(PackageId),
}

#[derive(Default)]
struct RegistryInner {
    packages: FxHashMap<PackageId, PendingPackage>,
    deadlines: BinaryHeap<Reverse<(Instant, PackageId)>>,
}

impl RegistryInner {
    /// Heap entry still refers to a live package with that deadline
    #[inline]
    fn is_live(&self, deadline: Instant, index: PackageId) -> bool {
        self.packages.get(&index).is_some_and(|pkg| pkg.deadline == deadline)
    }
}

#[derive(Default)]
pub struct PendingRegistry {
    inner: Mutex<RegistryInner>,
    wake: Notify,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, package: PendingPackage) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock();
            if inner.packages.contains_key(&package.index) {
                return Err(RegistryError::Duplicate(package.index));
            }
            inner.deadlines.push(Reverse((package.deadline, package.index)));
            inner.packages.insert(package.index, package);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Idempotent
    pub fn remove(&self, index: PackageId) -> Option<PendingPackage> {
        self.inner.lock().packages.remove(&index)
    }

    /// Remove the package announced under a PLC sequence number
    pub fn remove_by_seq(&self, seq: u16) -> Option<PendingPackage> {
        let mut inner = self.inner.lock();
        let index = inner.packages.values().find(|pkg| pkg.plc_seq == Some(seq)).map(|pkg| pkg.index)?;
        inner.packages.remove(&index)
    }

    pub fn get(&self, index: PackageId) -> Option<PendingPackage> {
        self.inner.lock().packages.get(&index).cloned()
    }

    pub fn contains(&self, index: PackageId) -> bool {
        self.inner.lock().packages.contains_key(&index)
    }

    pub fn snapshot(&self) -> Vec<PendingPackage> {
        self.inner.lock().packages.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().packages.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.packages.clear();
        inner.deadlines.clear();
    }

    /// Claim a package for actuation if it is still pending
    pub fn claim(
        &self,
        index: PackageId,
        lane: &str,
        marks: &Arc<ProcessingMarks>,
        now: Instant,
    ) -> Option<MarkGuard> {
        let inner = self.inner.lock();
        if !inner.packages.contains_key(&index) {
            return None;
        }
        marks.try_mark(index, lane, now)
    }

    /// Earliest deadline still backed by a live package
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        while let Some(&Reverse((deadline, index))) = inner.deadlines.peek() {
            if inner.is_live(deadline, index) {
                return Some(deadline);
            }
            inner.deadlines.pop();
        }
        None
    }

    /// Remove every unclaimed package whose deadline passed
    ///
    /// Packages currently marked for actuation are left to their lane, which
    /// removes them when it finishes.
    pub fn evict_expired(&self, now: Instant, marks: &ProcessingMarks) -> Vec<PendingPackage> {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::new();

        while let Some(&Reverse((deadline, index))) = inner.deadlines.peek() {
            if deadline > now {
                break;
            }
            inner.deadlines.pop();
            if !inner.is_live(deadline, index) || marks.is_marked(index) {
                continue;
            }
            if let Some(pkg) = inner.packages.remove(&index) {
                evicted.push(pkg);
            }
        }

        evicted
    }

    /// Drop heap entries whose package already left; returns how many
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.deadlines.len();
        let RegistryInner { packages, deadlines } = &mut *inner;
        deadlines.retain(|Reverse((deadline, index))| {
            packages.get(index).is_some_and(|pkg| pkg.deadline == *deadline)
        });
        before - inner.deadlines.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }
}

/// Active claim on a package
#[derive(Debug, Clone)]
pub struct ProcessingMark {
    pub lane: String,
    pub started_at: Instant,
    token: u64,
}

/// At most one mark per package index
#[derive(Default)]
pub struct ProcessingMarks {
    marks: Mutex<FxHashMap<PackageId, ProcessingMark>>,
    next_token: AtomicU64,
}

impl ProcessingMarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert; `None` when already claimed
    pub fn try_mark(self: &Arc<Self>, index: PackageId, lane: &str, now: Instant) -> Option<MarkGuard> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut marks = self.marks.lock();
        if marks.contains_key(&index) {
            return None;
        }
        marks.insert(index, ProcessingMark { lane: lane.to_string(), started_at: now, token });
        Some(MarkGuard { marks: Arc::clone(self), index, token })
    }

    pub fn is_marked(&self, index: PackageId) -> bool {
        self.marks.lock().contains_key(&index)
    }

    pub fn get(&self, index: PackageId) -> Option<ProcessingMark> {
        self.marks.lock().get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.marks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.lock().is_empty()
    }

    pub fn clear(&self) {
        self.marks.lock().clear();
    }

    fn release(&self, index: PackageId, token: u64) {
        let mut marks = self.marks.lock();
        // A cleared and re-claimed index belongs to someone else now
        if marks.get(&index).is_some_and(|mark| mark.token == token) {
            marks.remove(&index);
        }
    }
}

/// Releases its mark on drop, whatever happened during actuation
#[must_use = "dropping the guard releases the mark immediately"]
pub struct MarkGuard {
    marks: Arc<ProcessingMarks>,
    index: PackageId,
    token: u64,
}

impl MarkGuard {
    pub fn index(&self) -> PackageId {
        self.index
    }
}

impl Drop for MarkGuard {
    fn drop(&mut self) {
        self.marks.release(self.index, self.token);
    }
}

/// Log package timeout (cold path)
#[cold]
fn log_package_timeout(pkg: &PendingPackage, now: Instant) {
    warn!(
        index = %pkg.index,
        chute = %pkg.chute,
        lane = pkg.lane,
        barcode = %pkg.barcode,
        age_ms = pkg.age(now).as_millis() as u64,
        estimated = pkg.estimated,
        "package_timeout"
    );
}

/// Evict packages that never saw their lane pulse
///
/// Runs until the shutdown flag turns true. Timed-out packages are dropped
/// with a log line and a counter; nobody upstream is told.
pub async fn run_timeout_supervisor(
    registry: Arc<PendingRegistry>,
    marks: Arc<ProcessingMarks>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("timeout_supervisor_started");
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let next = registry.next_deadline();
        let expiry = async {
            match next {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            // New earliest deadline possible, recompute
            _ = registry.wake.notified() => {}
            _ = expiry => {
                let now = Instant::now();
                for pkg in registry.evict_expired(now, &marks) {
                    log_package_timeout(&pkg, now);
                    metrics.record_timeout();
                }
            }
            _ = sweep.tick() => {
                let dropped = registry.sweep();
                if dropped > 0 {
                    debug!(dropped = dropped, "timeout_heap_swept");
                }
            }
        }
    }

    info!("timeout_supervisor_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Chute, Direction};

    fn pending(index: u64, deadline: Instant) -> PendingPackage {
        PendingPackage {
            index: PackageId(index),
            barcode: format!("PKG{index}"),
            chute: Chute(2),
            lane: 0,
            direction: Direction::Right,
            trigger_at: Instant::now(),
            processing_delay: Duration::from_millis(200),
            estimated: false,
            plc_seq: None,
            deadline,
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected_first_untouched() {
        let registry = PendingRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        registry.insert(pending(7, deadline)).unwrap();
        let mut dup = pending(7, deadline + Duration::from_secs(1));
        dup.barcode = "other".to_string();

        assert_eq!(registry.insert(dup), Err(RegistryError::Duplicate(PackageId(7))));
        let kept = registry.get(PackageId(7)).unwrap();
        assert_eq!(kept.barcode, "PKG7");
        assert_eq!(kept.deadline, deadline);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = PendingRegistry::new();
        registry.insert(pending(1, Instant::now())).unwrap();

        assert!(registry.remove(PackageId(1)).is_some());
        assert!(registry.remove(PackageId(1)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_seq() {
        let registry = PendingRegistry::new();
        let mut pkg = pending(3, Instant::now());
        pkg.plc_seq = Some(900);
        registry.insert(pkg).unwrap();

        assert!(registry.remove_by_seq(901).is_none());
        assert_eq!(registry.remove_by_seq(900).map(|p| p.index), Some(PackageId(3)));
    }

    #[tokio::test]
    async fn test_marks_are_exclusive_and_released_on_drop() {
        let marks = Arc::new(ProcessingMarks::new());
        let now = Instant::now();

        let guard = marks.try_mark(PackageId(4), "lane-1", now).unwrap();
        assert!(marks.try_mark(PackageId(4), "lane-2", now).is_none());
        assert_eq!(marks.get(PackageId(4)).unwrap().lane, "lane-1");

        drop(guard);
        assert!(marks.is_empty());
        assert!(marks.try_mark(PackageId(4), "lane-2", now).is_some());
    }

    #[tokio::test]
    async fn test_stale_guard_does_not_release_new_mark() {
        let marks = Arc::new(ProcessingMarks::new());
        let now = Instant::now();

        let old = marks.try_mark(PackageId(9), "lane-1", now).unwrap();
        marks.clear();
        let _new = marks.try_mark(PackageId(9), "lane-1", now).unwrap();

        drop(old);
        assert!(marks.is_marked(PackageId(9)));
    }

    #[tokio::test]
    async fn test_claim_requires_pending_package() {
        let registry = PendingRegistry::new();
        let marks = Arc::new(ProcessingMarks::new());
        let now = Instant::now();

        assert!(registry.claim(PackageId(5), "lane-1", &marks, now).is_none());
        registry.insert(pending(5, now)).unwrap();
        let guard = registry.claim(PackageId(5), "lane-1", &marks, now).unwrap();
        assert_eq!(guard.index(), PackageId(5));
        assert!(registry.claim(PackageId(5), "lane-2", &marks, now).is_none());
    }

    #[tokio::test]
    async fn test_evict_expired_skips_marked_and_stale_entries() {
        let registry = PendingRegistry::new();
        let marks = Arc::new(ProcessingMarks::new());
        let now = Instant::now();

        registry.insert(pending(1, now)).unwrap();
        registry.insert(pending(2, now)).unwrap();
        registry.insert(pending(3, now + Duration::from_secs(10))).unwrap();
        let _guard = marks.try_mark(PackageId(2), "lane-1", now).unwrap();

        // Reinsert 4 with a later deadline; the first heap entry is stale
        registry.insert(pending(4, now)).unwrap();
        registry.remove(PackageId(4));
        registry.insert(pending(4, now + Duration::from_secs(10))).unwrap();

        let evicted: Vec<PackageId> =
            registry.evict_expired(now, &marks).into_iter().map(|p| p.index).collect();
        assert_eq!(evicted, vec![PackageId(1)]);
        assert!(registry.contains(PackageId(2)));
        assert!(registry.contains(PackageId(4)));
    }

    #[tokio::test]
    async fn test_sweep_and_next_deadline_skip_departed() {
        let registry = PendingRegistry::new();
        let now = Instant::now();
        registry.insert(pending(1, now + Duration::from_secs(1))).unwrap();
        registry.insert(pending(2, now + Duration::from_secs(2))).unwrap();
        registry.insert(pending(3, now + Duration::from_secs(3))).unwrap();

        registry.remove(PackageId(2));
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.heap_len(), 2);

        registry.remove(PackageId(1));
        assert_eq!(registry.next_deadline(), Some(now + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_evicts_after_deadline_and_index_is_reusable() {
        let registry = Arc::new(PendingRegistry::new());
        let marks = Arc::new(ProcessingMarks::new());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_timeout_supervisor(
            registry.clone(),
            marks.clone(),
            metrics.clone(),
            shutdown_rx,
        ));

        // Lane upper 2000 ms + 500 ms slack
        let deadline = Instant::now() + Duration::from_millis(2500);
        registry.insert(pending(11, deadline)).unwrap();

        tokio::time::sleep(Duration::from_millis(2400)).await;
        assert!(registry.contains(PackageId(11)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.contains(PackageId(11)));
        assert_eq!(metrics.timeouts(), 1);

        // Same index accepted again afterwards
        registry.insert(pending(11, Instant::now() + Duration::from_secs(30))).unwrap();
        assert!(registry.contains(PackageId(11)));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(metrics.timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_picks_up_earlier_deadline() {
        let registry = Arc::new(PendingRegistry::new());
        let marks = Arc::new(ProcessingMarks::new());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        registry.insert(pending(1, Instant::now() + Duration::from_secs(60))).unwrap();
        let handle = tokio::spawn(run_timeout_supervisor(
            registry.clone(),
            marks,
            metrics.clone(),
            shutdown_rx,
        ));
        tokio::task::yield_now().await;

        registry.insert(pending(2, Instant::now() + Duration::from_millis(300))).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(!registry.contains(PackageId(2)));
        assert!(registry.contains(PackageId(1)));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
