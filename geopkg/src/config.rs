use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Tuning parameters for a GeoPackage dataset.
///
/// A cloneable, thread-safe configuration holder. Every parameter is an atomic
/// so clones shared with layers and workers observe updates without locking.
///
/// Create via [`GpkgConfig::new`], adjust with the setters, then pass it to
/// [`crate::GpkgBuilder`] (or use the builder's fluent setters directly).
#[derive(Clone)]
pub struct GpkgConfig {
    inner: Arc<GpkgConfigInner>,
}

impl GpkgConfig {
    /// Creates a configuration with default values:
    /// - R-tree entry batches of 10,000 entries
    /// - background R-tree building once 10 batches are buffered
    /// - at most 64 batches waiting in the handoff queue
    /// - deferred spatial index maintenance after 100 inserts in a transaction
    /// - Arrow batches of 65,536 rows or 64 MiB, whichever is reached first
    /// - two prefetch tasks in flight
    #[inline]
    pub fn new() -> GpkgConfig {
        GpkgConfig {
            inner: Arc::new(GpkgConfigInner::new()),
        }
    }

    /// Number of index entries in one sealed entry batch.
    #[inline]
    pub fn rtree_batch_size(&self) -> usize {
        self.inner.rtree_batch_size.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn set_rtree_batch_size(&self, size: usize) {
        self.inner.rtree_batch_size.store(size, Ordering::Relaxed)
    }

    /// Number of sealed batches that must be buffered before the background
    /// builder is started.
    #[inline]
    pub fn rtree_batches_before_start(&self) -> usize {
        self.inner.rtree_batches_before_start.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn set_rtree_batches_before_start(&self, count: usize) {
        self.inner
            .rtree_batches_before_start
            .store(count, Ordering::Relaxed)
    }

    /// Maximum number of batches waiting in the handoff queue. Never smaller
    /// than the start threshold.
    #[inline]
    pub fn rtree_queue_capacity(&self) -> usize {
        self.inner
            .rtree_queue_capacity
            .load(Ordering::Relaxed)
            .max(self.rtree_batches_before_start())
    }

    #[inline]
    pub fn set_rtree_queue_capacity(&self, capacity: usize) {
        self.inner
            .rtree_queue_capacity
            .store(capacity, Ordering::Relaxed)
    }

    /// Whether spatial index entries may be written by a background worker.
    #[inline]
    pub fn background_rtree(&self) -> bool {
        self.inner.background_rtree.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_background_rtree(&self, enabled: bool) {
        self.inner.background_rtree.store(enabled, Ordering::Relaxed)
    }

    /// Number of inserts in one transaction after which the R-tree insert
    /// trigger is dropped and entries are routed by the layer.
    #[inline]
    pub fn deferred_update_threshold(&self) -> u64 {
        self.inner.deferred_update_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_deferred_update_threshold(&self, threshold: u64) {
        self.inner
            .deferred_update_threshold
            .store(threshold, Ordering::Relaxed)
    }

    /// Maximum number of rows in one Arrow batch.
    #[inline]
    pub fn arrow_batch_size(&self) -> usize {
        self.inner.arrow_batch_size.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn set_arrow_batch_size(&self, rows: usize) {
        self.inner.arrow_batch_size.store(rows, Ordering::Relaxed)
    }

    /// Approximate byte ceiling of one Arrow batch on the filler paths.
    #[inline]
    pub fn arrow_max_batch_bytes(&self) -> usize {
        self.inner.arrow_max_batch_bytes.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn set_arrow_max_batch_bytes(&self, bytes: usize) {
        self.inner
            .arrow_max_batch_bytes
            .store(bytes, Ordering::Relaxed)
    }

    /// Maximum number of prefetch tasks in flight.
    #[inline]
    pub fn prefetch_in_flight(&self) -> usize {
        self.inner.prefetch_in_flight.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn set_prefetch_in_flight(&self, tasks: usize) {
        self.inner.prefetch_in_flight.store(tasks, Ordering::Relaxed)
    }

    /// Whether columnar reads may use background threads at all.
    #[inline]
    pub fn async_columnar(&self) -> bool {
        self.inner.async_columnar.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_async_columnar(&self, enabled: bool) {
        self.inner.async_columnar.store(enabled, Ordering::Relaxed)
    }
}

impl Default for GpkgConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct GpkgConfigInner {
    rtree_batch_size: AtomicUsize,
    rtree_batches_before_start: AtomicUsize,
    rtree_queue_capacity: AtomicUsize,
    background_rtree: AtomicBool,
    deferred_update_threshold: AtomicU64,
    arrow_batch_size: AtomicUsize,
    arrow_max_batch_bytes: AtomicUsize,
    prefetch_in_flight: AtomicUsize,
    async_columnar: AtomicBool,
}

impl GpkgConfigInner {
    pub const DEFAULT_RTREE_BATCH_SIZE: usize = 10 * 1_000;
    pub const DEFAULT_RTREE_BATCHES_BEFORE_START: usize = 10;
    pub const DEFAULT_RTREE_QUEUE_CAPACITY: usize = 64;
    pub const DEFAULT_DEFERRED_UPDATE_THRESHOLD: u64 = 100;
    pub const DEFAULT_ARROW_BATCH_SIZE: usize = 65_536;
    pub const DEFAULT_ARROW_MAX_BATCH_MB: usize = 64;
    pub const DEFAULT_PREFETCH_IN_FLIGHT: usize = 2;

    fn new() -> GpkgConfigInner {
        GpkgConfigInner {
            rtree_batch_size: AtomicUsize::new(Self::DEFAULT_RTREE_BATCH_SIZE),
            rtree_batches_before_start: AtomicUsize::new(Self::DEFAULT_RTREE_BATCHES_BEFORE_START),
            rtree_queue_capacity: AtomicUsize::new(Self::DEFAULT_RTREE_QUEUE_CAPACITY),
            background_rtree: AtomicBool::new(true),
            deferred_update_threshold: AtomicU64::new(Self::DEFAULT_DEFERRED_UPDATE_THRESHOLD),
            arrow_batch_size: AtomicUsize::new(Self::DEFAULT_ARROW_BATCH_SIZE),
            arrow_max_batch_bytes: AtomicUsize::new(Self::DEFAULT_ARROW_MAX_BATCH_MB * 1_024 * 1_024),
            prefetch_in_flight: AtomicUsize::new(Self::DEFAULT_PREFETCH_IN_FLIGHT),
            async_columnar: AtomicBool::new(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = GpkgConfig::new();
        assert_eq!(config.rtree_batch_size(), 10_000);
        assert_eq!(config.rtree_batches_before_start(), 10);
        assert_eq!(config.rtree_queue_capacity(), 64);
        assert!(config.background_rtree());
        assert_eq!(config.deferred_update_threshold(), 100);
        assert_eq!(config.arrow_batch_size(), 65_536);
        assert_eq!(config.arrow_max_batch_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.prefetch_in_flight(), 2);
        assert!(config.async_columnar());
    }

    #[test]
    fn test_config_clones_share_state() {
        let config = GpkgConfig::new();
        let clone = config.clone();
        clone.set_rtree_batch_size(1_000);
        clone.set_background_rtree(false);
        assert_eq!(config.rtree_batch_size(), 1_000);
        assert!(!config.background_rtree());
    }

    #[test]
    fn test_queue_capacity_never_below_threshold() {
        let config = GpkgConfig::new();
        config.set_rtree_batches_before_start(20);
        config.set_rtree_queue_capacity(4);
        assert_eq!(config.rtree_queue_capacity(), 20);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let config = GpkgConfig::new();
        config.set_rtree_batch_size(0);
        config.set_arrow_batch_size(0);
        config.set_prefetch_in_flight(0);
        assert_eq!(config.rtree_batch_size(), 1);
        assert_eq!(config.arrow_batch_size(), 1);
        assert_eq!(config.prefetch_in_flight(), 1);
    }
}
