use crate::builder::GpkgBuilder;
use crate::config::GpkgConfig;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::FeatureDefn;
use crate::geometry::Envelope;
use crate::index::sql::{self, RTreeNames};
use crate::layer::TableLayer;
use crate::store::{metadata, open_primary, ResourceSnapshot, ResourceTracker};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Dataset state shared with layers and columnar streams.
///
/// The primary connection is only used by the caller's threads. Background
/// workers open their own connections from `path`.
pub(crate) struct DatasetShared {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    config: GpkgConfig,
    resources: ResourceTracker,
    in_transaction: AtomicBool,
}

impl DatasetShared {
    /// `None` for an in-memory dataset.
    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the primary connection. A layer's state lock, when needed, is
    /// taken before this one.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub(crate) fn config(&self) -> &GpkgConfig {
        &self.config
    }

    pub(crate) fn resources(&self) -> &ResourceTracker {
        &self.resources
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }
}

/// A GeoPackage file (or in-memory database) holding feature tables.
///
/// `GeoPackage` is a cheap handle around shared state; clones refer to the
/// same dataset. When the last clone is dropped an open transaction is
/// rolled back and changed layer extents are written.
///
/// # Examples
///
/// ```rust
/// use geopkg::feature::{Feature, FeatureDefn, FieldDefn, FieldType};
/// use geopkg::geometry::{Geometry, WkbGeometryType};
/// use geopkg::GeoPackage;
///
/// # fn main() -> geopkg::errors::GpkgResult<()> {
/// let gpkg = GeoPackage::open_in_memory()?;
/// let defn = FeatureDefn::new("cities")
///     .with_geometry(WkbGeometryType::Point, 4326)
///     .with_field(FieldDefn::new("name", FieldType::String));
/// let layer = gpkg.create_layer(defn, true)?;
///
/// gpkg.start_transaction()?;
/// let mut city = Feature::new(layer.defn()).with_geometry(Geometry::point(2.35, 48.85));
/// city.set_field(0, "Paris")?;
/// layer.create_feature(&mut city)?;
/// gpkg.commit_transaction()?;
///
/// assert_eq!(layer.get_feature_count()?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GeoPackage {
    inner: Arc<GeoPackageInner>,
}

impl GeoPackage {
    pub fn builder() -> GpkgBuilder {
        GpkgBuilder::new()
    }

    /// Creates a new GeoPackage file with the default configuration.
    pub fn create<P: AsRef<Path>>(path: P) -> GpkgResult<GeoPackage> {
        GpkgBuilder::new().create(path)
    }

    /// Opens an existing GeoPackage file with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> GpkgResult<GeoPackage> {
        GpkgBuilder::new().open(path)
    }

    pub fn open_in_memory() -> GpkgResult<GeoPackage> {
        GpkgBuilder::new().open_in_memory()
    }

    pub(crate) fn connect(
        path: Option<&Path>,
        create: bool,
        config: GpkgConfig,
    ) -> GpkgResult<GeoPackage> {
        if let (Some(path), true) = (path, create) {
            if path.exists() {
                return Err(GpkgError::new(
                    &format!("{} already exists", path.display()),
                    ErrorKind::InvalidOperation,
                ));
            }
        }
        let conn = open_primary(path, create)?;
        if create || path.is_none() {
            metadata::initialize(&conn)?;
        } else {
            metadata::validate(&conn)?;
        }
        log::debug!(
            "Opened GeoPackage {}",
            path.map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
        );
        Ok(GeoPackage {
            inner: Arc::new(GeoPackageInner {
                shared: Arc::new(DatasetShared {
                    path: path.map(Path::to_path_buf),
                    conn: Mutex::new(conn),
                    config,
                    resources: ResourceTracker::new(),
                    in_transaction: AtomicBool::new(false),
                }),
                layers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Creates a feature table, with an R-tree when `spatial_index` is set
    /// and the table has a geometry column.
    ///
    /// Inside a transaction the R-tree triggers are only created at commit;
    /// rows inserted meanwhile are indexed from their buffered entries.
    pub fn create_layer(&self, defn: FeatureDefn, spatial_index: bool) -> GpkgResult<TableLayer> {
        self.inner.create_layer(defn, spatial_index)
    }

    /// Returns the layer for `name`, opening it on first use.
    pub fn layer(&self, name: &str) -> GpkgResult<TableLayer> {
        self.inner.layer(name)
    }

    pub fn layer_names(&self) -> GpkgResult<Vec<String>> {
        metadata::layer_names(&self.inner.shared.conn())
    }

    /// Runs SQL statements on the primary connection.
    pub fn execute_batch(&self, sql: &str) -> GpkgResult<()> {
        self.inner.shared.conn().execute_batch(sql)?;
        Ok(())
    }

    pub fn start_transaction(&self) -> GpkgResult<()> {
        self.inner.start_transaction()
    }

    /// Flushes deferred index maintenance of every layer, then commits.
    ///
    /// If any layer fails to flush, the whole transaction is rolled back and
    /// the error returned.
    pub fn commit_transaction(&self) -> GpkgResult<()> {
        self.inner.commit_transaction()
    }

    /// Cancels background builders, discards buffered entries and rolls the
    /// transaction back.
    pub fn rollback_transaction(&self) -> GpkgResult<()> {
        self.inner.check_in_transaction()?;
        self.inner.rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.shared.in_transaction()
    }

    /// Writes changed layer extents.
    pub fn sync_to_disk(&self) -> GpkgResult<()> {
        for layer in self.inner.open_layers() {
            layer.sync_to_disk()?;
        }
        Ok(())
    }

    /// Live background workers and secondary connections of this dataset.
    pub fn resources(&self) -> ResourceSnapshot {
        self.inner.shared.resources().snapshot()
    }

    pub fn config(&self) -> GpkgConfig {
        self.inner.shared.config().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.shared.path()
    }
}

struct GeoPackageInner {
    shared: Arc<DatasetShared>,
    /// open layers by lower-cased table name
    layers: Mutex<HashMap<String, TableLayer>>,
}

impl GeoPackageInner {
    fn open_layers(&self) -> Vec<TableLayer> {
        self.layers.lock().values().cloned().collect()
    }

    fn create_layer(&self, defn: FeatureDefn, spatial_index: bool) -> GpkgResult<TableLayer> {
        let in_transaction = self.shared.in_transaction();
        let mut has_rtree = false;
        {
            let conn = self.shared.conn();
            metadata::create_feature_table(&conn, &defn)?;
            if let (Some(geom), true) = (defn.geometry_column(), spatial_index) {
                let names = RTreeNames::new(defn.table_name(), &geom.name, defn.fid_column());
                sql::create_rtree_table(&conn, &names.rtree)?;
                if !in_transaction {
                    sql::create_triggers(&conn, &names)?;
                }
                metadata::register_rtree_extension(&conn, &names.table, &names.column)?;
                has_rtree = true;
            }
        }

        let key = defn.table_name().to_lowercase();
        let layer = TableLayer::new(self.shared.clone(), defn, has_rtree, Envelope::empty());
        if in_transaction {
            layer.on_transaction_start()?;
            layer.defer_index_creation();
        }
        log::debug!("Created layer {}", layer.name());
        self.layers.lock().insert(key, layer.clone());
        Ok(layer)
    }

    fn layer(&self, name: &str) -> GpkgResult<TableLayer> {
        let key = name.to_lowercase();
        if let Some(layer) = self.layers.lock().get(&key) {
            return Ok(layer.clone());
        }

        let (defn, has_rtree, extent) = {
            let conn = self.shared.conn();
            let defn = metadata::load_feature_defn(&conn, name)?;
            let has_rtree = match defn.geometry_column() {
                Some(geom) => {
                    let names = RTreeNames::new(defn.table_name(), &geom.name, defn.fid_column());
                    sql::rtree_exists(&conn, &names.rtree)?
                }
                None => false,
            };
            let extent = metadata::read_extent(&conn, defn.table_name())?;
            (defn, has_rtree, extent)
        };
        let layer = TableLayer::new(self.shared.clone(), defn, has_rtree, extent);
        if self.shared.in_transaction() {
            layer.on_transaction_start()?;
        }
        let mut layers = self.layers.lock();
        Ok(layers.entry(key).or_insert(layer).clone())
    }

    fn check_in_transaction(&self) -> GpkgResult<()> {
        if !self.shared.in_transaction() {
            return Err(GpkgError::new(
                "No transaction in progress",
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }

    fn start_transaction(&self) -> GpkgResult<()> {
        if self.shared.in_transaction() {
            return Err(GpkgError::new(
                "A transaction is already in progress",
                ErrorKind::InvalidOperation,
            ));
        }
        self.shared.conn().execute_batch("BEGIN")?;
        self.shared.in_transaction.store(true, Ordering::Release);
        for layer in self.open_layers() {
            if let Err(e) = layer.on_transaction_start() {
                return Err(self.abort(e));
            }
        }
        Ok(())
    }

    fn commit_transaction(&self) -> GpkgResult<()> {
        self.check_in_transaction()?;
        let layers = self.open_layers();
        for layer in &layers {
            if let Err(e) = layer.prepare_commit() {
                log::warn!("Rolling back: {} could not be flushed: {}", layer.name(), e);
                return Err(self.abort(e));
            }
        }
        let committed = self.shared.conn().execute_batch("COMMIT");
        if let Err(e) = committed {
            return Err(self.abort(e.into()));
        }
        self.shared.in_transaction.store(false, Ordering::Release);
        for layer in &layers {
            layer.after_commit();
        }
        Ok(())
    }

    /// Rolls back after `error` and returns it.
    fn abort(&self, error: GpkgError) -> GpkgError {
        if let Err(e) = self.rollback() {
            log::error!("Rollback after a failed transaction step failed: {}", e);
        }
        error
    }

    fn rollback(&self) -> GpkgResult<()> {
        let layers = self.open_layers();
        let created: Vec<String> = layers
            .iter()
            .filter(|l| l.created_in_transaction())
            .map(|l| l.name().to_lowercase())
            .collect();
        for layer in &layers {
            layer.on_rollback();
        }
        self.shared.in_transaction.store(false, Ordering::Release);
        {
            let conn = self.shared.conn();
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
        }
        let mut open = self.layers.lock();
        for name in created {
            open.remove(&name);
        }
        Ok(())
    }
}

impl Drop for GeoPackageInner {
    fn drop(&mut self) {
        if self.shared.in_transaction() {
            if let Err(e) = self.rollback() {
                log::error!("Failed to roll back on close: {}", e);
            }
        }
        for layer in self.open_layers() {
            if let Err(e) = layer.sync_to_disk() {
                log::error!("Failed to write the extent of {}: {}", layer.name(), e);
            }
        }
    }
}
