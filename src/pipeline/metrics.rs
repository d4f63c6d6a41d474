//! Run metrics: item counters, per-phase timing, and store handle accounting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Items that reached `Cleaned` without error
    pub items_completed: AtomicU64,

    /// Items whose post-processing stage ran
    pub items_post_processed: AtomicU64,

    /// Items whose post-processing was skipped because the terminal marker existed
    pub items_post_process_skipped: AtomicU64,

    /// Items abandoned after a stage failure (fault isolation only)
    pub items_failed: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent in the inference stage (microseconds)
    pub inference_us: AtomicU64,

    /// Time spent in the post-processing stage (microseconds)
    pub post_process_us: AtomicU64,

    /// Time spent staging items in the cache (microseconds)
    pub cache_us: AtomicU64,

    /// Total bytes copied or downloaded into the cache
    pub bytes_cached: AtomicU64,

    // Store handle accounting
    /// Array store handles opened or created
    pub stores_opened: AtomicU64,

    /// Array store handles closed, explicitly or on drop
    pub stores_closed: AtomicU64,

    /// Intermediate raw stores removed after post-processing
    pub raw_stores_deleted: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_item_completed(&self) {
        self.items_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_post_processed(&self) {
        self.items_post_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_post_process_skipped(&self) {
        self.items_post_process_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in inference (in microseconds).
    pub fn add_inference_time(&self, duration: Duration) {
        self.inference_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in post-processing (in microseconds).
    pub fn add_post_process_time(&self, duration: Duration) {
        self.post_process_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent staging an item (in microseconds).
    pub fn add_cache_time(&self, duration: Duration) {
        self.cache_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_cached(&self, bytes: u64) {
        self.bytes_cached.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_store_opened(&self) {
        self.stores_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_store_closed(&self) {
        self.stores_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_raw_store_deleted(&self) {
        self.raw_stores_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Store handles currently open.
    pub fn open_stores(&self) -> u64 {
        self.stores_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.stores_closed.load(Ordering::Relaxed))
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get completed items per hour.
    pub fn items_per_hour(&self) -> f64 {
        let items = self.items_completed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed * 3600.0
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inference_us = self.inference_us.load(Ordering::Relaxed);
        let post_process_us = self.post_process_us.load(Ordering::Relaxed);
        let cache_us = self.cache_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_post_processed: self.items_post_processed.load(Ordering::Relaxed),
            items_post_process_skipped: self.items_post_process_skipped.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_hour: self.items_per_hour(),
            inference_secs: inference_us as f64 / 1_000_000.0,
            post_process_secs: post_process_us as f64 / 1_000_000.0,
            cache_secs: cache_us as f64 / 1_000_000.0,
            bytes_cached: self.bytes_cached.load(Ordering::Relaxed),
            stores_opened: self.stores_opened.load(Ordering::Relaxed),
            stores_closed: self.stores_closed.load(Ordering::Relaxed),
            raw_stores_deleted: self.raw_stores_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_completed: u64,
    pub items_post_processed: u64,
    pub items_post_process_skipped: u64,
    pub items_failed: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_hour: f64,
    /// Wall time spent in inference (seconds)
    pub inference_secs: f64,
    /// Wall time spent in post-processing (seconds)
    pub post_process_secs: f64,
    /// Wall time spent staging items (seconds)
    pub cache_secs: f64,
    pub bytes_cached: u64,
    pub stores_opened: u64,
    pub stores_closed: u64,
    pub raw_stores_deleted: u64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", self.elapsed.as_secs_f64());
        println!("Items completed: {}", self.items_completed);
        println!("Post-processed: {}", self.items_post_processed);
        println!("Post-processing skipped (already done): {}", self.items_post_process_skipped);
        println!("Items failed: {}", self.items_failed);
        if self.bytes_cached > 0 {
            println!(
                "Data cached: {:.2} GB in {:.1}s",
                self.bytes_cached as f64 / (1024.0 * 1024.0 * 1024.0),
                self.cache_secs
            );
        }

        let total_phase = self.inference_secs + self.post_process_secs;
        if total_phase > 0.0 {
            println!("\n--- Phase Time Breakdown ---");
            println!(
                "Inference:        {:>8.1}s ({:>5.1}%)",
                self.inference_secs,
                self.inference_secs / total_phase * 100.0
            );
            println!(
                "Post-processing:  {:>8.1}s ({:>5.1}%)",
                self.post_process_secs,
                self.post_process_secs / total_phase * 100.0
            );
        }

        println!(
            "\nStores: {} opened, {} closed, {} raw deleted",
            self.stores_opened, self.stores_closed, self.raw_stores_deleted
        );
        println!("========================\n");
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_phase = self.inference_secs + self.post_process_secs;
        let (inf_pct, pp_pct) = if total_phase > 0.0 {
            (
                self.inference_secs / total_phase * 100.0,
                self.post_process_secs / total_phase * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        write!(
            f,
            "Items: {} completed, {} failed | Post-process: {} run, {} skipped | \
             Rate: {:.1} items/h | Elapsed: {:.1}s | Time: Inference {:.0}% | Post {:.0}% | \
             Stores: {} opened, {} closed",
            self.items_completed,
            self.items_failed,
            self.items_post_processed,
            self.items_post_process_skipped,
            self.items_per_hour,
            self.elapsed.as_secs_f64(),
            inf_pct,
            pp_pct,
            self.stores_opened,
            self.stores_closed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_bytes_cached(1000);
        metrics.add_bytes_cached(500);

        assert_eq!(metrics.bytes_cached.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_item_completed();
        metrics.add_item_completed();
        metrics.add_item_post_processed();
        metrics.add_item_post_process_skipped();
        metrics.add_item_failed();
        metrics.add_raw_store_deleted();
        metrics.add_raw_store_deleted();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.items_completed, 2);
        assert_eq!(snapshot.items_post_processed, 1);
        assert_eq!(snapshot.items_post_process_skipped, 1);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.raw_stores_deleted, 2);
    }

    #[test]
    fn test_open_store_accounting() {
        let metrics = Metrics::new();

        metrics.add_store_opened();
        metrics.add_store_opened();
        metrics.add_store_closed();
        assert_eq!(metrics.open_stores(), 1);

        metrics.add_store_closed();
        assert_eq!(metrics.open_stores(), 0);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_inference_time(Duration::from_millis(100));
        metrics.add_post_process_time(Duration::from_millis(50));
        metrics.add_cache_time(Duration::from_millis(25));

        let snapshot = metrics.snapshot();

        assert!((snapshot.inference_secs - 0.1).abs() < 0.001);
        assert!((snapshot.post_process_secs - 0.05).abs() < 0.001);
        assert!((snapshot.cache_secs - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            items_completed: 12,
            items_post_processed: 9,
            items_post_process_skipped: 3,
            items_failed: 1,
            elapsed: Duration::from_secs(3600),
            items_per_hour: 12.0,
            inference_secs: 3.0,
            post_process_secs: 1.0,
            cache_secs: 0.0,
            bytes_cached: 0,
            stores_opened: 27,
            stores_closed: 27,
            raw_stores_deleted: 18,
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("12 completed"));
        assert!(display.contains("1 failed"));
        assert!(display.contains("9 run, 3 skipped"));
        assert!(display.contains("Inference 75%"));
        assert!(display.contains("Post 25%"));
    }

    #[test]
    fn test_snapshot_serializes_elapsed_as_seconds() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(0.0));
        assert_eq!(json["items_completed"], serde_json::json!(0));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_item_completed();

        assert_eq!(metrics.items_per_hour(), 0.0);
    }
}
