use crate::config::GpkgConfig;
use crate::dataset::GeoPackage;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use std::path::Path;

/// Fluent builder opening a [`GeoPackage`] with a tuned [`GpkgConfig`].
///
/// Invalid values are remembered and reported when the dataset is opened,
/// so a chain of setters needs a single error check.
///
/// # Examples
///
/// ```rust
/// use geopkg::GeoPackage;
///
/// let gpkg = GeoPackage::builder()
///     .rtree_batch_size(1_000)
///     .prefetch_in_flight(4)
///     .open_in_memory()
///     .unwrap();
/// assert_eq!(gpkg.config().rtree_batch_size(), 1_000);
///
/// assert!(GeoPackage::builder().arrow_batch_size(0).open_in_memory().is_err());
/// ```
#[derive(Default)]
pub struct GpkgBuilder {
    error: Option<GpkgError>,
    config: GpkgConfig,
}

impl GpkgBuilder {
    pub fn new() -> Self {
        GpkgBuilder {
            error: None,
            config: GpkgConfig::new(),
        }
    }

    /// Starts from an existing configuration. The dataset shares it, so
    /// later changes to `config` apply to the open dataset.
    pub fn config(mut self, config: GpkgConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rtree_batch_size(self, size: usize) -> Self {
        self.positive("rtree_batch_size", size, |c, v| c.set_rtree_batch_size(v))
    }

    pub fn rtree_batches_before_start(self, count: usize) -> Self {
        self.positive("rtree_batches_before_start", count, |c, v| {
            c.set_rtree_batches_before_start(v)
        })
    }

    pub fn rtree_queue_capacity(self, capacity: usize) -> Self {
        self.positive("rtree_queue_capacity", capacity, |c, v| {
            c.set_rtree_queue_capacity(v)
        })
    }

    pub fn background_rtree(self, enabled: bool) -> Self {
        self.config.set_background_rtree(enabled);
        self
    }

    /// Inserts per transaction after which R-tree maintenance is deferred.
    /// `0` defers from the first insert.
    pub fn deferred_update_threshold(self, threshold: u64) -> Self {
        self.config.set_deferred_update_threshold(threshold);
        self
    }

    pub fn arrow_batch_size(self, rows: usize) -> Self {
        self.positive("arrow_batch_size", rows, |c, v| c.set_arrow_batch_size(v))
    }

    pub fn arrow_max_batch_bytes(self, bytes: usize) -> Self {
        self.positive("arrow_max_batch_bytes", bytes, |c, v| {
            c.set_arrow_max_batch_bytes(v)
        })
    }

    pub fn prefetch_in_flight(self, tasks: usize) -> Self {
        self.positive("prefetch_in_flight", tasks, |c, v| c.set_prefetch_in_flight(v))
    }

    pub fn async_columnar(self, enabled: bool) -> Self {
        self.config.set_async_columnar(enabled);
        self
    }

    fn positive(
        mut self,
        name: &str,
        value: usize,
        apply: impl FnOnce(&GpkgConfig, usize),
    ) -> Self {
        if self.error.is_none() {
            if value == 0 {
                self.error = Some(GpkgError::new(
                    &format!("{} must be greater than zero", name),
                    ErrorKind::ValidationError,
                ));
            } else {
                apply(&self.config, value);
            }
        }
        self
    }

    /// Creates a new GeoPackage file; fails if `path` exists.
    pub fn create<P: AsRef<Path>>(self, path: P) -> GpkgResult<GeoPackage> {
        self.connect(Some(path.as_ref()), true)
    }

    /// Opens an existing GeoPackage file.
    pub fn open<P: AsRef<Path>>(self, path: P) -> GpkgResult<GeoPackage> {
        self.connect(Some(path.as_ref()), false)
    }

    /// Opens a new in-memory GeoPackage. Columnar reads on it are always
    /// filled inline and R-trees are always maintained synchronously.
    pub fn open_in_memory(self) -> GpkgResult<GeoPackage> {
        self.connect(None, true)
    }

    fn connect(self, path: Option<&Path>, create: bool) -> GpkgResult<GeoPackage> {
        if let Some(error) = self.error {
            return Err(error);
        }
        GeoPackage::connect(path, create, self.config)
    }
}
