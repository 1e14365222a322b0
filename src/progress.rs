//! Progress telemetry for archive operations.
//!
//! Every rank owns a pair of atomic counters (bytes moved, items completed);
//! a shared tracker aggregates them on a configured period and logs rate,
//! percent done and an ETA. Disabled tracking costs two relaxed loads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::info;

use crate::comm::Group;

/// Per-rank counters, updated without cross-rank contention.
pub struct RankMetrics {
    bytes: AtomicU64,
    items: AtomicU64,
}

impl RankMetrics {
    fn new() -> Self {
        RankMetrics { bytes: AtomicU64::new(0), items: AtomicU64::new(0) }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_items(&self, n: u64) {
        self.items.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }
}

/// Which operation the messages describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressKind {
    Pack,
    Extract,
}

/// Shared, interval-gated progress aggregator.
pub struct ProgressTracker {
    kind: ProgressKind,
    metrics: Vec<Arc<RankMetrics>>,
    total_bytes: AtomicU64,
    total_items: AtomicU64,
    start: Instant,
    last_emit: Mutex<Instant>,
    interval: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(ranks: usize, kind: ProgressKind) -> Self {
        let metrics = (0..ranks).map(|_| Arc::new(RankMetrics::new())).collect();
        ProgressTracker {
            kind,
            metrics,
            total_bytes: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
            start: Instant::now(),
            last_emit: Mutex::new(Instant::now()),
            interval: interval_from_env(),
        }
    }

    /// Create on rank 0 and hand every rank the same tracker.
    pub fn shared(group: &Group, kind: ProgressKind) -> Arc<Self> {
        let tracker = if group.rank() == 0 {
            Some(Arc::new(ProgressTracker::new(group.size(), kind)))
        } else {
            None
        };
        group.broadcast(tracker, 0)
    }

    pub fn set_totals(&self, bytes: u64, items: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_items.store(items, Ordering::Relaxed);
    }

    pub fn rank_metrics(&self, rank: usize) -> Arc<RankMetrics> {
        Arc::clone(&self.metrics[rank])
    }

    /// Sum of all rank counters: (bytes, items).
    pub fn aggregate(&self) -> (u64, u64) {
        self.metrics
            .iter()
            .fold((0, 0), |(b, i), m| (b + m.bytes(), i + m.items()))
    }

    /// Emit a progress line if the configured period has elapsed.
    pub fn maybe_emit(&self) {
        let interval = match self.interval {
            Some(interval) => interval,
            None => return,
        };
        let now = Instant::now();
        {
            let mut last = self.last_emit.lock().unwrap();
            if now.duration_since(*last) < interval {
                return;
            }
            *last = now;
        }
        self.emit(false);
    }

    /// Emit a final line, but only if periodic lines were ever wanted.
    pub fn emit_done(&self) {
        if let Some(interval) = self.interval {
            if self.start.elapsed() >= interval {
                self.emit(true);
            }
        }
    }

    fn emit(&self, done: bool) {
        let (bytes, items) = self.aggregate();
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let secs = self.start.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        let percent = if total_bytes > 0 {
            bytes as f64 * 100.0 / total_bytes as f64
        } else {
            0.0
        };
        let secs_left = if rate > 0.0 {
            (total_bytes.saturating_sub(bytes)) as f64 / rate
        } else {
            0.0
        };
        let (bytes_val, bytes_units) = format_bytes(bytes as f64);
        let (rate_val, rate_units) = format_bw(rate);
        match (self.kind, done) {
            (ProgressKind::Pack, false) => info!(
                "Tarred {:.3} {} ({:.0}%) in {:.3} secs ({:.3} {}) {:.0} secs left ...",
                bytes_val, bytes_units, percent, secs, rate_val, rate_units, secs_left
            ),
            (ProgressKind::Pack, true) => info!(
                "Tarred {:.3} {} ({:.0}%) in {:.3} secs ({:.3} {}) done",
                bytes_val, bytes_units, percent, secs, rate_val, rate_units
            ),
            (ProgressKind::Extract, false) => {
                let item_rate = if secs > 0.0 { items as f64 / secs } else { 0.0 };
                info!(
                    "Extracted {} items and {:.3} {} ({:.0}%) in {:.3} secs ({:.3} items/sec, {:.3} {}) {:.0} secs left ...",
                    items, bytes_val, bytes_units, percent, secs, item_rate, rate_val, rate_units, secs_left
                )
            }
            (ProgressKind::Extract, true) => {
                let item_rate = if secs > 0.0 { items as f64 / secs } else { 0.0 };
                info!(
                    "Extracted {} items and {:.3} {} ({:.0}%) in {:.3} secs ({:.3} items/sec, {:.3} {}) done",
                    items, bytes_val, bytes_units, percent, secs, item_rate, rate_val, rate_units
                )
            }
        }
    }
}

/// Period between progress lines, from the PARTAR_PROGRESS environment
/// variable in seconds. Zero disables periodic output.
pub fn interval_from_env() -> Option<Duration> {
    let secs = match std::env::var("PARTAR_PROGRESS") {
        Ok(v) => v.trim().parse::<u64>().unwrap_or(10),
        Err(_) => 10,
    };
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Scale a byte count into a human unit.
pub fn format_bytes(val: f64) -> (f64, &'static str) {
    scale(val, &["B", "KiB", "MiB", "GiB", "TiB", "PiB"])
}

/// Scale a bandwidth into a human unit.
pub fn format_bw(rate: f64) -> (f64, &'static str) {
    scale(rate, &["B/s", "KiB/s", "MiB/s", "GiB/s", "TiB/s", "PiB/s"])
}

fn scale(mut val: f64, units: &[&'static str]) -> (f64, &'static str) {
    let mut idx = 0;
    while val >= 1024.0 && idx + 1 < units.len() {
        val /= 1024.0;
        idx += 1;
    }
    (val, units[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_scale_binary() {
        assert_eq!(format_bytes(512.0), (512.0, "B"));
        let (v, u) = format_bytes(3.0 * 1024.0 * 1024.0);
        assert_eq!(u, "MiB");
        assert!((v - 3.0).abs() < 1e-9);
        let (_, u) = format_bw(2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(u, "GiB/s");
    }

    #[test]
    fn counters_aggregate_across_ranks() {
        let tracker = ProgressTracker::new(2, ProgressKind::Extract);
        tracker.rank_metrics(0).add_bytes(100);
        tracker.rank_metrics(1).add_bytes(50);
        tracker.rank_metrics(1).add_items(3);
        assert_eq!(tracker.aggregate(), (150, 3));
    }
}
