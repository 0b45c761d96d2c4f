//! Block connection metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    connect_us: AtomicU64,
    connect_blocks: AtomicU64,
    disconnect_us: AtomicU64,
    disconnect_blocks: AtomicU64,
    script_us: AtomicU64,
    script_checks: AtomicU64,
    undo_us: AtomicU64,
    undo_bytes: AtomicU64,
    index_us: AtomicU64,
    index_ops: AtomicU64,
    flush_us: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMetricsSnapshot {
    pub connect_us: u64,
    pub connect_blocks: u64,
    pub disconnect_us: u64,
    pub disconnect_blocks: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub undo_us: u64,
    pub undo_bytes: u64,
    pub index_us: u64,
    pub index_ops: u64,
    pub flush_us: u64,
    pub flushes: u64,
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros() as u64
}

impl ConnectMetrics {
    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.connect_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, elapsed: Duration) {
        self.disconnect_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
        self.disconnect_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scripts(&self, elapsed: Duration, checks: u64) {
        self.script_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.script_checks.fetch_add(checks, Ordering::Relaxed);
    }

    pub fn record_undo(&self, elapsed: Duration, bytes: u64) {
        self.undo_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.undo_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_index(&self, elapsed: Duration, ops: u64) {
        self.index_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.index_ops.fetch_add(ops, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connect_blocks: self.connect_blocks.load(Ordering::Relaxed),
            disconnect_us: self.disconnect_us.load(Ordering::Relaxed),
            disconnect_blocks: self.disconnect_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_checks: self.script_checks.load(Ordering::Relaxed),
            undo_us: self.undo_us.load(Ordering::Relaxed),
            undo_bytes: self.undo_bytes.load(Ordering::Relaxed),
            index_us: self.index_us.load(Ordering::Relaxed),
            index_ops: self.index_ops.load(Ordering::Relaxed),
            flush_us: self.flush_us.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accumulates() {
        let metrics = ConnectMetrics::default();
        metrics.record_connect(Duration::from_micros(40));
        metrics.record_connect(Duration::from_micros(2));
        metrics.record_scripts(Duration::from_micros(5), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_us, 42);
        assert_eq!(snapshot.connect_blocks, 2);
        assert_eq!(snapshot.script_checks, 3);
        assert_eq!(snapshot.flushes, 0);
    }
}
