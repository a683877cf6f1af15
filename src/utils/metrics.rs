use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters updated by the engine as tasks and items move through it
#[derive(Debug)]
pub struct CrawlStats {
    start_time: RwLock<DateTime<Utc>>,
    tasks_added: AtomicU64,
    tasks_dropped: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
    items_emitted: AtomicU64,
    items_processed: AtomicU64,
}

/// Point-in-time copy of [`CrawlStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub start_time: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub tasks_added: u64,
    pub tasks_dropped: u64,
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub panics: u64,
    pub items_emitted: u64,
    pub items_processed: u64,
    /// Responses per second since start
    pub current_rps: f64,
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(Utc::now()),
            tasks_added: AtomicU64::new(0),
            tasks_dropped: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            items_emitted: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
        }
    }

    /// Measure elapsed time and throughput from now on
    pub fn restart(&self) {
        *self.start_time.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    pub fn record_task_added(&self) {
        self.tasks_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_dropped(&self) {
        self.tasks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_emitted(&self, count: usize) {
        self.items_emitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_item_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let start_time = *self.start_time.read().unwrap_or_else(|e| e.into_inner());
        let elapsed_secs = (Utc::now() - start_time).num_milliseconds().max(0) as f64 / 1000.0;
        let responses = self.responses.load(Ordering::Relaxed);

        StatsSnapshot {
            start_time,
            elapsed_secs,
            tasks_added: self.tasks_added.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses,
            errors: self.errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            current_rps: responses as f64 / elapsed_secs.max(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = CrawlStats::new();
        stats.record_task_added();
        stats.record_task_added();
        stats.record_task_dropped();
        stats.record_request();
        stats.record_response();
        stats.record_items_emitted(3);
        stats.record_item_processed();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_added, 2);
        assert_eq!(snap.tasks_dropped, 1);
        assert_eq!(snap.responses, 1);
        assert_eq!(snap.items_emitted, 3);
        assert_eq!(snap.items_processed, 1);
        assert_eq!(snap.errors, 0);
        assert!(snap.current_rps <= 1.0);
    }

    #[test]
    fn test_restart_resets_elapsed_time() {
        let stats = CrawlStats::new();
        std::thread::sleep(std::time::Duration::from_millis(120));
        assert!(stats.snapshot().elapsed_secs >= 0.1);

        stats.restart();
        let snap = stats.snapshot();
        assert!(snap.elapsed_secs < 0.1);
        assert!(snap.start_time > Utc::now() - chrono::Duration::milliseconds(100));
    }
}
