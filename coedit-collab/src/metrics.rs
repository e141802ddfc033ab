//! Read-only metrics rollup, recomputed on a fixed tick.
//!
//! The edit path records into lock-free atomics (and a `try_lock`ed RTT
//! ring that simply drops a sample under contention), so a slow metrics
//! tick can never delay `apply_local`/`apply_remote`. A background task
//! folds the counters into a [`SessionMetrics`] snapshot; callers read a
//! clone of the latest snapshot and can never block the aggregator either.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::transport::Transport;

/// Number of acknowledged-operation round trips kept for the latency rollup.
const RTT_WINDOW: usize = 32;

/// Derived observability state. Never mutated directly by callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMetrics {
    /// Collaborators currently classified `Active`, local user included.
    pub active_users: usize,
    /// Operations applied per second over the last tick window.
    pub ops_per_second: f64,
    /// Mean round-trip of recently acknowledged operations, milliseconds.
    pub sync_latency_ms: f64,
    /// Conflicts detected and resolved since the session started.
    pub conflicts_resolved: u64,
    /// Bytes through the transport, both directions.
    pub bytes_transferred: u64,
}

/// Hot-path recording surface, shared with the session actor.
///
/// Everything here is a relaxed atomic except the RTT ring, which is only
/// ever `try_lock`ed from the recording side.
pub struct MetricsRecorder {
    ops_applied: AtomicU64,
    conflicts_resolved: AtomicU64,
    active_users: AtomicUsize,
    rtt_samples: Mutex<VecDeque<u64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            ops_applied: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
            active_users: AtomicUsize::new(1),
            rtt_samples: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
        }
    }

    /// One operation applied to content (local or remote).
    pub fn record_op(&self) {
        self.ops_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflicts(&self, n: u64) {
        self.conflicts_resolved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_active_users(&self, n: usize) {
        self.active_users.store(n, Ordering::Relaxed);
    }

    /// Round-trip time of an acknowledged operation. Dropped without
    /// blocking if the aggregator holds the ring.
    pub fn record_rtt(&self, millis: u64) {
        if let Ok(mut ring) = self.rtt_samples.try_lock() {
            if ring.len() == RTT_WINDOW {
                ring.pop_front();
            }
            ring.push_back(millis);
        }
    }

    pub fn ops_applied(&self) -> u64 {
        self.ops_applied.load(Ordering::Relaxed)
    }

    pub fn conflicts_resolved(&self) -> u64 {
        self.conflicts_resolved.load(Ordering::Relaxed)
    }

    fn mean_rtt(&self) -> f64 {
        match self.rtt_samples.try_lock() {
            Ok(ring) if !ring.is_empty() => {
                ring.iter().sum::<u64>() as f64 / ring.len() as f64
            }
            _ => 0.0,
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the aggregation task plus the latest snapshot.
pub struct MetricsAggregator {
    snapshot: Arc<RwLock<SessionMetrics>>,
    task: JoinHandle<()>,
}

impl MetricsAggregator {
    /// Spawn the tick task. It recomputes the snapshot every `interval`
    /// from the recorder and the transport byte counters.
    pub fn spawn(
        recorder: Arc<MetricsRecorder>,
        transport: Arc<dyn Transport>,
        interval: Duration,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(SessionMetrics::default()));
        let snap = snapshot.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_ops = recorder.ops_applied();
            loop {
                tick.tick().await;
                let ops = recorder.ops_applied();
                let metrics = SessionMetrics {
                    active_users: recorder.active_users.load(Ordering::Relaxed),
                    ops_per_second: (ops - last_ops) as f64 / interval.as_secs_f64(),
                    sync_latency_ms: recorder.mean_rtt(),
                    conflicts_resolved: recorder.conflicts_resolved(),
                    bytes_transferred: transport.bytes_sent() + transport.bytes_received(),
                };
                last_ops = ops;
                if let Ok(mut s) = snap.write() {
                    *s = metrics;
                }
            }
        });

        Self { snapshot, task }
    }

    /// Latest rollup. Read-only; always returns immediately.
    pub fn metrics(&self) -> SessionMetrics {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Stop the tick task. Called on session leave.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;

    #[test]
    fn test_recorder_counters() {
        let r = MetricsRecorder::new();
        r.record_op();
        r.record_op();
        r.record_conflicts(3);
        assert_eq!(r.ops_applied(), 2);
        assert_eq!(r.conflicts_resolved(), 3);
    }

    #[test]
    fn test_rtt_ring_bounded() {
        let r = MetricsRecorder::new();
        for i in 0..100 {
            r.record_rtt(i);
        }
        let ring = r.rtt_samples.try_lock().unwrap();
        assert_eq!(ring.len(), RTT_WINDOW);
        // Oldest samples were evicted.
        assert_eq!(*ring.front().unwrap(), 100 - RTT_WINDOW as u64);
    }

    #[test]
    fn test_mean_rtt() {
        let r = MetricsRecorder::new();
        r.record_rtt(10);
        r.record_rtt(30);
        assert_eq!(r.mean_rtt(), 20.0);
    }

    #[tokio::test]
    async fn test_aggregator_ticks_and_snapshots() {
        let recorder = Arc::new(MetricsRecorder::new());
        let transport: Arc<dyn Transport> = Arc::new(LocalAuthority::new());

        recorder.record_op();
        recorder.record_op();
        recorder.record_conflicts(1);
        recorder.set_active_users(3);
        recorder.record_rtt(12);

        let agg = MetricsAggregator::spawn(
            recorder.clone(),
            transport,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let m = agg.metrics();
        assert_eq!(m.active_users, 3);
        assert_eq!(m.conflicts_resolved, 1);
        assert_eq!(m.sync_latency_ms, 12.0);
        agg.shutdown();
    }

    #[tokio::test]
    async fn test_callers_never_mutate_metrics() {
        let recorder = Arc::new(MetricsRecorder::new());
        let transport: Arc<dyn Transport> = Arc::new(LocalAuthority::new());
        let agg =
            MetricsAggregator::spawn(recorder, transport, Duration::from_millis(10));

        let mut m = agg.metrics();
        m.conflicts_resolved = 999;
        // The snapshot handed out was a copy.
        assert_ne!(agg.metrics().conflicts_resolved, 999);
        agg.shutdown();
    }
}
