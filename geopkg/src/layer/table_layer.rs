use super::deferred::{BackgroundTarget, BuildReport, DeferredIndex};
use super::query::{RawFeature, ScanQuery};
use crate::columnar::{ExportStrategy, FeatureBatchStream};
use crate::dataset::DatasetShared;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::{quote_ident, Feature, FeatureDefn};
use crate::geometry::{Envelope, GpkgBlob};
use crate::index::sql::{self, RTreeNames};
use crate::index::{
    BuilderState, EntryTranslator, IndexSinkFactory, SinkTarget, SqliteStagingSinkFactory,
};
use crate::store::{metadata, page_size};
use arrow_array::RecordBatch;
use parking_lot::Mutex;
use rusqlite::{Connection, ToSql};
use std::collections::VecDeque;
use std::sync::Arc;

/// Rows read per keyset page by [`TableLayer::get_next_feature`].
const ROW_PAGE_SIZE: usize = 1_000;

/// A feature table of a [`crate::GeoPackage`].
///
/// `TableLayer` is a cheap handle: clones share the same state, and the
/// dataset hands out the same layer to every caller asking for a table.
///
/// Inside a transaction, inserts into a table whose R-tree was empty when
/// the transaction started (or, for other tables, inserts beyond the
/// configured threshold) bypass the R-tree insert trigger. Their index
/// entries are batched and, for file-backed datasets, built by a background
/// worker in a staging database; everything is merged into the R-tree when
/// the transaction commits.
#[derive(Clone)]
pub struct TableLayer {
    inner: Arc<TableLayerInner>,
}

impl TableLayer {
    pub(crate) fn new(
        dataset: Arc<DatasetShared>,
        defn: FeatureDefn,
        has_rtree: bool,
        extent: Envelope,
    ) -> TableLayer {
        TableLayer {
            inner: Arc::new(TableLayerInner::new(dataset, defn, has_rtree, extent)),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.defn.table_name()
    }

    pub fn defn(&self) -> &FeatureDefn {
        &self.inner.defn
    }

    /// Inserts `feature` and stores the fid it was given in it.
    pub fn create_feature(&self, feature: &mut Feature) -> GpkgResult<i64> {
        self.inner.create_feature(feature)
    }

    /// Rewrites the feature with the fid of `feature`.
    ///
    /// Fails with [`ErrorKind::NotFound`] when no such feature exists.
    pub fn set_feature(&self, feature: &Feature) -> GpkgResult<()> {
        self.inner.set_feature(feature)
    }

    pub fn delete_feature(&self, fid: i64) -> GpkgResult<()> {
        self.inner.delete_feature(fid)
    }

    /// Reads one feature by fid, ignoring the filters.
    pub fn get_feature(&self, fid: i64) -> GpkgResult<Option<Feature>> {
        self.inner.get_feature(fid)
    }

    /// Restarts row and columnar iteration. Any columnar scan in progress is
    /// stopped and its workers joined, unless another thread is waiting on
    /// one of its batches; that thread stops the scan once the batch arrives.
    pub fn reset_reading(&self) {
        self.inner.state.lock().reset_reading();
    }

    pub fn get_next_feature(&self) -> GpkgResult<Option<Feature>> {
        self.inner.get_next_feature()
    }

    /// Restricts iteration to rows matching the SQL `WHERE` fragment.
    pub fn set_attribute_filter(&self, filter: Option<&str>) -> GpkgResult<()> {
        self.inner.set_attribute_filter(filter)
    }

    /// Restricts iteration to features whose envelope intersects `filter`.
    pub fn set_spatial_filter(&self, filter: Option<Envelope>) -> GpkgResult<()> {
        self.inner.set_spatial_filter(filter)
    }

    /// Number of features passing the current filters.
    pub fn get_feature_count(&self) -> GpkgResult<u64> {
        self.inner.get_feature_count()
    }

    pub fn get_extent(&self) -> Envelope {
        self.inner.state.lock().extent
    }

    /// Recomputes the extent from the R-tree, or from the geometry column
    /// when there is no usable R-tree.
    pub fn recompute_extent(&self) -> GpkgResult<Envelope> {
        self.inner.recompute_extent()
    }

    /// Writes the extent to `gpkg_contents` if it changed.
    pub fn sync_to_disk(&self) -> GpkgResult<()> {
        self.inner.sync_to_disk()
    }

    pub fn has_spatial_index(&self) -> bool {
        self.inner.state.lock().has_rtree
    }

    /// Creates and populates the R-tree of the geometry column.
    pub fn create_spatial_index(&self) -> GpkgResult<()> {
        self.inner.create_spatial_index()
    }

    pub fn drop_spatial_index(&self) -> GpkgResult<()> {
        self.inner.drop_spatial_index()
    }

    /// Rows in the R-tree, after pending entries were written.
    pub fn spatial_index_entry_count(&self) -> GpkgResult<u64> {
        self.inner.spatial_index_entry_count()
    }

    /// Fids whose R-tree rectangle intersects `envelope`, ascending.
    pub fn query_spatial_index(&self, envelope: &Envelope) -> GpkgResult<Vec<i64>> {
        self.inner.query_spatial_index(envelope)
    }

    /// Replaces the factory creating the background builder's sink.
    /// Takes effect for the next background build.
    pub fn set_index_sink_factory(&self, factory: Arc<dyn IndexSinkFactory>) {
        self.inner.state.lock().sink_factory = factory;
    }

    /// State of the background builder of the current transaction.
    pub fn index_builder_state(&self) -> BuilderState {
        self.inner
            .state
            .lock()
            .index
            .as_ref()
            .map_or(BuilderState::Idle, DeferredIndex::builder_state)
    }

    /// Report of the last deferred index flush.
    pub fn last_index_build(&self) -> Option<BuildReport> {
        self.inner.state.lock().last_build.clone()
    }

    /// Next batch of the layer's own columnar scan.
    ///
    /// The scan honours the filters set when it started and is restarted by
    /// [`reset_reading`](Self::reset_reading).
    pub fn get_next_columnar_batch(&self) -> GpkgResult<Option<RecordBatch>> {
        self.inner.get_next_columnar_batch()
    }

    /// Opens an independent columnar scan with the current filters.
    pub fn columnar_stream(&self) -> GpkgResult<FeatureBatchStream> {
        self.inner.columnar_stream()
    }

    /// Strategy of the layer's own columnar scan, once started.
    pub fn columnar_strategy(&self) -> Option<ExportStrategy> {
        let stream = self.inner.state.lock().columnar.clone();
        stream.map(|stream| stream.lock().strategy())
    }

    pub fn pending_prefetch_tasks(&self) -> usize {
        let stream = self.inner.state.lock().columnar.clone();
        stream.map_or(0, |stream| stream.lock().pending_tasks())
    }

    pub(crate) fn on_transaction_start(&self) -> GpkgResult<()> {
        self.inner.on_transaction_start()
    }

    pub(crate) fn prepare_commit(&self) -> GpkgResult<()> {
        self.inner.prepare_commit()
    }

    pub(crate) fn after_commit(&self) {
        self.inner.state.lock().transaction = None;
    }

    pub(crate) fn on_rollback(&self) {
        self.inner.on_rollback()
    }

    /// True if the table was created by the transaction in progress.
    pub(crate) fn created_in_transaction(&self) -> bool {
        self.inner
            .state
            .lock()
            .transaction
            .as_ref()
            .is_some_and(|t| t.created)
    }

    /// Marks the table as created by the transaction in progress; its
    /// R-tree triggers are created at commit.
    pub(crate) fn defer_index_creation(&self) {
        let mut state = self.inner.state.lock();
        state.pending_index_creation = state.has_rtree;
        if let Some(transaction) = state.transaction.as_mut() {
            transaction.created = true;
        }
    }
}

/// Layer state saved when a transaction starts.
struct TransactionState {
    extent: Envelope,
    extent_dirty: bool,
    has_rtree: bool,
    rtree_empty_at_start: bool,
    inserts: u64,
    background_failed: bool,
    created: bool,
}

#[derive(Default)]
struct RowCursor {
    after_fid: Option<i64>,
    buffer: VecDeque<RawFeature>,
    exhausted: bool,
}

struct LayerState {
    extent: Envelope,
    extent_dirty: bool,
    has_rtree: bool,
    /// R-tree triggers still to be created at commit
    pending_index_creation: bool,
    index: Option<DeferredIndex>,
    transaction: Option<TransactionState>,
    sink_factory: Arc<dyn IndexSinkFactory>,
    last_build: Option<BuildReport>,
    attribute_filter: Option<String>,
    spatial_filter: Option<Envelope>,
    cursor: RowCursor,
    /// shared with a reader waiting on a batch outside the state lock
    columnar: Option<Arc<Mutex<FeatureBatchStream>>>,
}

impl LayerState {
    fn reset_reading(&mut self) {
        self.cursor = RowCursor::default();
        // a reader still waiting on this scan drops it when its batch arrives
        if let Some(stream) = self.columnar.take() {
            if let Some(mut stream) = stream.try_lock() {
                stream.cancel();
            }
        }
    }
}

struct TableLayerInner {
    dataset: Arc<DatasetShared>,
    defn: Arc<FeatureDefn>,
    rtree: Option<RTreeNames>,
    state: Mutex<LayerState>,
}

impl TableLayerInner {
    fn new(
        dataset: Arc<DatasetShared>,
        defn: FeatureDefn,
        has_rtree: bool,
        extent: Envelope,
    ) -> TableLayerInner {
        let rtree = defn
            .geometry_column()
            .map(|geom| RTreeNames::new(defn.table_name(), &geom.name, defn.fid_column()));
        TableLayerInner {
            dataset,
            defn: Arc::new(defn),
            rtree,
            state: Mutex::new(LayerState {
                extent,
                extent_dirty: false,
                has_rtree,
                pending_index_creation: false,
                index: None,
                transaction: None,
                sink_factory: Arc::new(SqliteStagingSinkFactory),
                last_build: None,
                attribute_filter: None,
                spatial_filter: None,
                cursor: RowCursor::default(),
                columnar: None,
            }),
        }
    }

    fn create_feature(&self, feature: &mut Feature) -> GpkgResult<i64> {
        feature.validate(&self.defn)?;
        let mut state = self.state.lock();
        let conn = self.dataset.conn();

        self.enter_deferred_mode(&mut state, &conn)?;

        let blob = self.encode_geometry(feature);
        let mut columns = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();
        let fid = feature.fid();
        if let Some(fid) = &fid {
            columns.push(quote_ident(self.defn.fid_column()));
            values.push(fid);
        }
        if let Some(geom) = self.defn.geometry_column() {
            columns.push(quote_ident(&geom.name));
            values.push(&blob);
        }
        for (field, value) in self.defn.fields().iter().zip(feature.values()) {
            columns.push(quote_ident(field.name()));
            values.push(value);
        }
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(self.defn.table_name()))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(self.defn.table_name()),
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        conn.prepare_cached(&sql)?.execute(values.as_slice())?;
        let fid = conn.last_insert_rowid();
        feature.set_fid(Some(fid));

        if let Some(index) = state.index.as_mut() {
            if let Some(entry) = EntryTranslator::translate(fid, feature.geometry()) {
                index.route(&conn, entry)?;
            }
        }
        if let Some(transaction) = state.transaction.as_mut() {
            transaction.inserts += 1;
        }
        if let Some(geometry) = feature.geometry().filter(|g| !g.is_empty()) {
            state.extent.merge(&geometry.envelope());
            state.extent_dirty = true;
        }
        Ok(fid)
    }

    /// Suspends trigger maintenance of the R-tree when this insert is
    /// eligible for it.
    fn enter_deferred_mode(&self, state: &mut LayerState, conn: &Connection) -> GpkgResult<()> {
        if state.index.is_some() || !state.has_rtree {
            return Ok(());
        }
        let (Some(names), Some(transaction)) = (&self.rtree, &state.transaction) else {
            return Ok(());
        };
        let config = self.dataset.config();
        let deferred = state.pending_index_creation
            || transaction.rtree_empty_at_start
            || transaction.inserts >= config.deferred_update_threshold();
        if !deferred {
            return Ok(());
        }

        let background = match self.dataset.path() {
            Some(path)
                if config.background_rtree()
                    && transaction.rtree_empty_at_start
                    && !transaction.background_failed =>
            {
                Some(BackgroundTarget {
                    factory: state.sink_factory.clone(),
                    target: SinkTarget {
                        dataset_path: path.to_path_buf(),
                        table: self.defn.table_name().to_string(),
                        rtree: names.rtree.clone(),
                        page_size: page_size(conn)?,
                        resources: self.dataset.resources().clone(),
                    },
                    config: config.clone(),
                })
            }
            _ => None,
        };
        state.index = Some(DeferredIndex::begin(
            conn,
            names,
            state.pending_index_creation,
            config.rtree_batch_size(),
            background,
        )?);
        Ok(())
    }

    /// Writes every pending index entry and resumes trigger maintenance.
    fn flush_deferred(&self, state: &mut LayerState, conn: &Connection) -> GpkgResult<()> {
        let Some(index) = state.index.take() else {
            return Ok(());
        };
        let report = index.finish(conn)?;
        state.pending_index_creation = false;
        if report.final_state == BuilderState::Errored {
            if let Some(transaction) = state.transaction.as_mut() {
                transaction.background_failed = true;
            }
        }
        state.last_build = Some(report);
        Ok(())
    }

    fn encode_geometry(&self, feature: &Feature) -> Option<Vec<u8>> {
        let srs_id = self.defn.geometry_column()?.srs_id;
        feature
            .geometry()
            .map(|geometry| GpkgBlob::encode(geometry, srs_id))
    }

    fn set_feature(&self, feature: &Feature) -> GpkgResult<()> {
        feature.validate(&self.defn)?;
        let fid = feature.fid().ok_or_else(|| {
            GpkgError::new(
                "Cannot rewrite a feature without fid",
                ErrorKind::InvalidOperation,
            )
        })?;
        let mut state = self.state.lock();
        let conn = self.dataset.conn();
        self.flush_deferred(&mut state, &conn)?;

        let blob = self.encode_geometry(feature);
        let mut assignments = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();
        if let Some(geom) = self.defn.geometry_column() {
            assignments.push(format!("{} = ?", quote_ident(&geom.name)));
            values.push(&blob);
        }
        for (field, value) in self.defn.fields().iter().zip(feature.values()) {
            assignments.push(format!("{} = ?", quote_ident(field.name())));
            values.push(value);
        }
        if !assignments.is_empty() {
            values.push(&fid);
            let changed = conn
                .prepare_cached(&format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    quote_ident(self.defn.table_name()),
                    assignments.join(", "),
                    quote_ident(self.defn.fid_column())
                ))?
                .execute(values.as_slice())?;
            if changed == 0 {
                return Err(self.not_found(fid));
            }
        } else if ScanQuery::new(self.defn.clone()).fetch(&conn, fid)?.is_none() {
            return Err(self.not_found(fid));
        }

        if let Some(geometry) = feature.geometry().filter(|g| !g.is_empty()) {
            state.extent.merge(&geometry.envelope());
            state.extent_dirty = true;
        }
        Ok(())
    }

    fn delete_feature(&self, fid: i64) -> GpkgResult<()> {
        let mut state = self.state.lock();
        let conn = self.dataset.conn();
        self.flush_deferred(&mut state, &conn)?;
        let deleted = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(self.defn.table_name()),
                quote_ident(self.defn.fid_column())
            ))?
            .execute([fid])?;
        if deleted == 0 {
            return Err(self.not_found(fid));
        }
        Ok(())
    }

    fn not_found(&self, fid: i64) -> GpkgError {
        GpkgError::new(
            &format!("Feature {} not found in {}", fid, self.defn.table_name()),
            ErrorKind::NotFound,
        )
    }

    fn get_feature(&self, fid: i64) -> GpkgResult<Option<Feature>> {
        let conn = self.dataset.conn();
        ScanQuery::new(self.defn.clone())
            .fetch(&conn, fid)?
            .map(RawFeature::into_feature)
            .transpose()
    }

    /// Query for the current filters. The R-tree only serves the spatial
    /// filter while it holds every entry.
    fn scan_query(&self, state: &LayerState) -> ScanQuery {
        let rtree = self
            .rtree
            .as_ref()
            .filter(|_| state.has_rtree && state.index.is_none() && !state.pending_index_creation)
            .map(|names| names.rtree.clone());
        ScanQuery::new(self.defn.clone())
            .with_attribute_filter(state.attribute_filter.clone())
            .with_spatial_filter(state.spatial_filter, rtree)
    }

    fn get_next_feature(&self) -> GpkgResult<Option<Feature>> {
        let mut state = self.state.lock();
        loop {
            if let Some(raw) = state.cursor.buffer.pop_front() {
                return raw.into_feature().map(Some);
            }
            if state.cursor.exhausted {
                return Ok(None);
            }
            let query = self.scan_query(&state);
            let page = {
                let conn = self.dataset.conn();
                query.read_page(
                    &conn,
                    state.cursor.after_fid.unwrap_or(i64::MIN),
                    ROW_PAGE_SIZE,
                    usize::MAX,
                )?
            };
            state.cursor.exhausted = page.exhausted;
            if page.last_fid.is_some() {
                state.cursor.after_fid = page.last_fid;
            }
            state.cursor.buffer.extend(page.rows);
        }
    }

    fn set_attribute_filter(&self, filter: Option<&str>) -> GpkgResult<()> {
        let filter = filter.map(str::trim).filter(|f| !f.is_empty());
        if let Some(filter) = filter {
            let conn = self.dataset.conn();
            conn.prepare(&format!(
                "SELECT 1 FROM {} WHERE ({})",
                quote_ident(self.defn.table_name()),
                filter
            ))
            .map_err(|e| {
                GpkgError::from(e).with_kind(
                    &format!("Invalid attribute filter '{}'", filter),
                    ErrorKind::ValidationError,
                )
            })?;
        }
        let mut state = self.state.lock();
        state.attribute_filter = filter.map(str::to_string);
        state.reset_reading();
        Ok(())
    }

    fn set_spatial_filter(&self, filter: Option<Envelope>) -> GpkgResult<()> {
        if filter.is_some() && self.defn.geometry_column().is_none() {
            return Err(GpkgError::new(
                &format!("{} has no geometry column", self.defn.table_name()),
                ErrorKind::InvalidOperation,
            ));
        }
        let mut state = self.state.lock();
        state.spatial_filter = filter;
        state.reset_reading();
        Ok(())
    }

    fn get_feature_count(&self) -> GpkgResult<u64> {
        let state = self.state.lock();
        let query = self.scan_query(&state);
        let conn = self.dataset.conn();
        if state.spatial_filter.is_none() {
            return query.count(&conn);
        }
        // the exact envelope test runs on decoded rows
        let mut count = 0;
        let mut after_fid = i64::MIN;
        loop {
            let page = query.read_page(&conn, after_fid, ROW_PAGE_SIZE, usize::MAX)?;
            count += page.rows.len() as u64;
            if page.exhausted {
                return Ok(count);
            }
            if let Some(fid) = page.last_fid {
                after_fid = fid;
            }
        }
    }

    fn recompute_extent(&self) -> GpkgResult<Envelope> {
        let mut state = self.state.lock();
        let Some(names) = &self.rtree else {
            return Ok(Envelope::empty());
        };
        let conn = self.dataset.conn();
        let extent = if state.has_rtree && state.index.is_none() && !state.pending_index_creation {
            sql::extent(&conn, &names.rtree)?
        } else {
            let c = quote_ident(&names.column);
            let bounds: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
                &format!(
                    "SELECT MIN(ST_MinX({c})), MIN(ST_MinY({c})), MAX(ST_MaxX({c})), MAX(ST_MaxY({c})) \
                     FROM {t} WHERE {c} NOT NULL AND NOT ST_IsEmpty({c})",
                    t = quote_ident(&names.table),
                ),
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;
            match bounds {
                (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
                    Envelope::new(min_x, min_y, max_x, max_y)
                }
                _ => Envelope::empty(),
            }
        };
        state.extent = extent;
        state.extent_dirty = true;
        Ok(extent)
    }

    fn sync_to_disk(&self) -> GpkgResult<()> {
        let mut state = self.state.lock();
        self.write_extent(&mut state)
    }

    fn write_extent(&self, state: &mut LayerState) -> GpkgResult<()> {
        if state.extent_dirty {
            metadata::write_extent(&self.dataset.conn(), self.defn.table_name(), &state.extent)?;
            state.extent_dirty = false;
        }
        Ok(())
    }

    fn create_spatial_index(&self) -> GpkgResult<()> {
        let Some(names) = &self.rtree else {
            return Err(GpkgError::new(
                &format!("{} has no geometry column", self.defn.table_name()),
                ErrorKind::InvalidOperation,
            ));
        };
        let mut state = self.state.lock();
        if state.has_rtree {
            return Err(GpkgError::new(
                &format!("{} already has a spatial index", self.defn.table_name()),
                ErrorKind::InvalidOperation,
            ));
        }
        let conn = self.dataset.conn();
        sql::create_rtree_table(&conn, &names.rtree)?;
        let count = sql::populate_from_table(&conn, names)?;
        sql::create_triggers(&conn, names)?;
        metadata::register_rtree_extension(&conn, &names.table, &names.column)?;
        state.has_rtree = true;
        state.reset_reading();
        log::debug!("Created {} with {} entries", names.rtree, count);
        Ok(())
    }

    fn drop_spatial_index(&self) -> GpkgResult<()> {
        let mut state = self.state.lock();
        let (Some(names), true) = (&self.rtree, state.has_rtree) else {
            return Err(GpkgError::new(
                &format!("{} has no spatial index", self.defn.table_name()),
                ErrorKind::InvalidOperation,
            ));
        };
        if let Some(index) = state.index.take() {
            index.cancel();
        }
        let conn = self.dataset.conn();
        sql::drop_rtree(&conn, names)?;
        metadata::unregister_rtree_extension(&conn, &names.table, &names.column)?;
        state.has_rtree = false;
        state.pending_index_creation = false;
        state.reset_reading();
        Ok(())
    }

    /// Flushes pending entries and returns the R-tree name.
    fn flushed_rtree(&self) -> GpkgResult<String> {
        let mut state = self.state.lock();
        let (Some(names), true) = (&self.rtree, state.has_rtree) else {
            return Err(GpkgError::new(
                &format!("{} has no spatial index", self.defn.table_name()),
                ErrorKind::InvalidOperation,
            ));
        };
        let conn = self.dataset.conn();
        self.flush_deferred(&mut state, &conn)?;
        Ok(names.rtree.clone())
    }

    fn spatial_index_entry_count(&self) -> GpkgResult<u64> {
        let rtree = self.flushed_rtree()?;
        sql::entry_count(&self.dataset.conn(), &rtree)
    }

    fn query_spatial_index(&self, envelope: &Envelope) -> GpkgResult<Vec<i64>> {
        let rtree = self.flushed_rtree()?;
        sql::query_range(&self.dataset.conn(), &rtree, envelope)
    }

    fn get_next_columnar_batch(&self) -> GpkgResult<Option<RecordBatch>> {
        let stream = {
            let mut state = self.state.lock();
            match state.columnar.clone() {
                Some(stream) => stream,
                None => {
                    let query = self.scan_query(&state);
                    let stream = Arc::new(Mutex::new(FeatureBatchStream::open(
                        self.dataset.clone(),
                        query,
                    )?));
                    state.columnar = Some(stream.clone());
                    stream
                }
            }
        };
        // waits for workers without holding the layer state
        let mut stream = stream.lock();
        stream.next_batch()
    }

    fn columnar_stream(&self) -> GpkgResult<FeatureBatchStream> {
        let query = self.scan_query(&self.state.lock());
        FeatureBatchStream::open(self.dataset.clone(), query)
    }

    fn on_transaction_start(&self) -> GpkgResult<()> {
        let mut state = self.state.lock();
        let rtree_empty_at_start = match (&self.rtree, state.has_rtree) {
            (Some(names), true) => sql::is_empty(&self.dataset.conn(), &names.rtree)?,
            _ => false,
        };
        state.transaction = Some(TransactionState {
            extent: state.extent,
            extent_dirty: state.extent_dirty,
            has_rtree: state.has_rtree,
            rtree_empty_at_start,
            inserts: 0,
            background_failed: false,
            created: false,
        });
        Ok(())
    }

    fn prepare_commit(&self) -> GpkgResult<()> {
        let mut state = self.state.lock();
        {
            let conn = self.dataset.conn();
            self.flush_deferred(&mut state, &conn)?;
            if state.pending_index_creation {
                if let Some(names) = &self.rtree {
                    sql::create_triggers(&conn, names)?;
                }
                state.pending_index_creation = false;
            }
        }
        self.write_extent(&mut state)
    }

    fn on_rollback(&self) {
        let mut state = self.state.lock();
        if let Some(index) = state.index.take() {
            index.cancel();
        }
        state.pending_index_creation = false;
        if let Some(saved) = state.transaction.take() {
            state.extent = saved.extent;
            state.extent_dirty = saved.extent_dirty;
            state.has_rtree = saved.has_rtree;
        }
        state.reset_reading();
    }
}

impl Drop for TableLayerInner {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.reset_reading();
        if let Some(index) = state.index.take() {
            index.cancel();
        }
    }
}
