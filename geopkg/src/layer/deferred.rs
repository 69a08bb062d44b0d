use crate::config::GpkgConfig;
use crate::errors::GpkgResult;
use crate::index::sql::{self, RTreeNames};
use crate::index::{
    BatchAccumulator, BoundedHandoffQueue, BuildOutcome, BuilderState, EntryBatch, IndexEntry,
    IndexSinkFactory, PushError, SinkTarget, SpatialIndexBuilder,
};
use rusqlite::Connection;
use std::sync::Arc;

/// Summary of one deferred index maintenance episode, from the first routed
/// entry to the flush at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    /// A background builder was started.
    pub background_started: bool,
    /// Last state of the builder before it was joined; `Idle` if none ran.
    pub final_state: BuilderState,
    /// Batches the builder wrote before it was joined.
    pub background_batches: u64,
    /// Entries in those batches, when the builder finished cleanly.
    pub background_entries: u64,
    /// Entries copied from the builder's sink into the R-tree.
    pub entries_merged: u64,
    /// Entries written directly through the primary connection.
    pub entries_synchronous: u64,
    /// Sequence number of the batch the builder failed on.
    pub failed_batch: Option<u64>,
    /// The R-tree was rebuilt from the table after the builder was lost.
    pub rebuilt_from_table: bool,
}

impl Default for BuildReport {
    fn default() -> Self {
        BuildReport {
            background_started: false,
            final_state: BuilderState::Idle,
            background_batches: 0,
            background_entries: 0,
            entries_merged: 0,
            entries_synchronous: 0,
            failed_batch: None,
            rebuilt_from_table: false,
        }
    }
}

/// How the insert trigger comes back when deferred mode ends.
enum TriggerRestore {
    /// Re-run the saved `CREATE TRIGGER`.
    Saved(String),
    /// The R-tree was created in this transaction without triggers.
    CreateAll,
    Nothing,
}

/// Where background building sends its entries.
pub(crate) struct BackgroundTarget {
    pub factory: Arc<dyn IndexSinkFactory>,
    pub target: SinkTarget,
    pub config: GpkgConfig,
}

struct BackgroundBuild {
    target: BackgroundTarget,
    queue: Arc<BoundedHandoffQueue<EntryBatch>>,
    builder: Option<SpatialIndexBuilder>,
    /// the builder failed or could not be started; stay synchronous
    errored: bool,
}

/// Index maintenance while the R-tree insert trigger is suspended.
///
/// Entries are batched and routed to a background builder when one is
/// allowed, or written directly. [`finish`](Self::finish) flushes
/// everything and restores the trigger; [`cancel`](Self::cancel) throws
/// everything away and leaves the trigger to the transaction rollback.
pub(crate) struct DeferredIndex {
    names: RTreeNames,
    restore: TriggerRestore,
    accumulator: BatchAccumulator,
    background: Option<BackgroundBuild>,
    report: BuildReport,
    /// a batch could not be written; the R-tree is rebuilt at finish
    lost_entries: bool,
}

impl DeferredIndex {
    /// Suspends the insert trigger. `background` is `Some` when the entries
    /// may be built on a background worker.
    pub(crate) fn begin(
        conn: &Connection,
        names: &RTreeNames,
        create_triggers: bool,
        batch_size: usize,
        background: Option<BackgroundTarget>,
    ) -> GpkgResult<DeferredIndex> {
        let restore = if create_triggers {
            TriggerRestore::CreateAll
        } else {
            match sql::drop_insert_trigger(conn, names)? {
                Some(saved) => TriggerRestore::Saved(saved),
                None => TriggerRestore::Nothing,
            }
        };
        log::debug!(
            "Deferring {} maintenance (background {})",
            names.rtree,
            if background.is_some() { "allowed" } else { "off" }
        );
        let background = background.map(|target| {
            let config = &target.config;
            let queue = Arc::new(BoundedHandoffQueue::new(
                config.rtree_queue_capacity(),
                config.rtree_batches_before_start(),
            ));
            BackgroundBuild {
                target,
                queue,
                builder: None,
                errored: false,
            }
        });
        Ok(DeferredIndex {
            names: names.clone(),
            restore,
            accumulator: BatchAccumulator::new(batch_size),
            background,
            report: BuildReport::default(),
            lost_entries: false,
        })
    }

    /// Routes one entry, writing or handing over a batch when it fills up.
    pub(crate) fn route(&mut self, conn: &Connection, entry: IndexEntry) -> GpkgResult<()> {
        match self.accumulator.push(entry) {
            Some(batch) => self.dispatch(conn, batch),
            None => Ok(()),
        }
    }

    pub(crate) fn builder_state(&self) -> BuilderState {
        self.background
            .as_ref()
            .and_then(|b| b.builder.as_ref())
            .map_or(BuilderState::Idle, SpatialIndexBuilder::state)
    }

    /// True once the background path was abandoned for this episode.
    pub(crate) fn background_errored(&self) -> bool {
        self.background.as_ref().is_some_and(|b| {
            b.errored || b.builder.as_ref().is_some_and(SpatialIndexBuilder::is_errored)
        })
    }

    fn dispatch(&mut self, conn: &Connection, batch: EntryBatch) -> GpkgResult<()> {
        let errored = self.background_errored();
        let Some(background) = self.background.as_mut().filter(|_| !errored) else {
            return self.write_sync(conn, &batch);
        };

        let rejected = match background.queue.push(batch) {
            Ok(()) => None,
            Err(PushError::Full(batch)) if background.builder.is_some() => {
                // back-pressure: wait for the builder to make room
                background.queue.push_blocking(batch).err().map(PushError::into_inner)
            }
            Err(e) => Some(e.into_inner()),
        };
        if let Some(batch) = rejected {
            background.errored = true;
            return self.write_sync(conn, &batch);
        }

        if background.builder.is_none() && background.queue.reached_threshold() {
            self.start_builder(conn)?;
        }
        Ok(())
    }

    fn start_builder(&mut self, conn: &Connection) -> GpkgResult<()> {
        let Some(background) = self.background.as_mut() else {
            return Ok(());
        };
        let started = background
            .target
            .factory
            .create_sink(&background.target.target)
            .and_then(|sink| {
                SpatialIndexBuilder::start(
                    &background.target.target.table,
                    background.queue.clone(),
                    sink,
                    &background.target.target.resources,
                )
            });
        match started {
            Ok(builder) => {
                background.builder = Some(builder);
                self.report.background_started = true;
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Cannot start background builder for {}, indexing synchronously: {}",
                    self.names.rtree,
                    e
                );
                background.errored = true;
                background.queue.close();
                let batches = background.queue.drain();
                self.write_all(conn, batches)
            }
        }
    }

    /// Writes a batch through the primary connection. A failed batch is
    /// not retried; the R-tree is rebuilt from the table at finish.
    fn write_sync(&mut self, conn: &Connection, batch: &EntryBatch) -> GpkgResult<()> {
        match sql::insert_entries(conn, &self.names.rtree, batch.entries()) {
            Ok(()) => {
                self.report.entries_synchronous += batch.len() as u64;
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Lost batch {} of {}, rebuilding at commit: {}",
                    batch.seq(),
                    self.names.rtree,
                    e
                );
                self.lost_entries = true;
                Err(e)
            }
        }
    }

    /// Writes every batch, returning the first error once all were tried.
    fn write_all(
        &mut self,
        conn: &Connection,
        batches: impl IntoIterator<Item = EntryBatch>,
    ) -> GpkgResult<()> {
        let mut first_error = None;
        for batch in batches {
            if let Err(e) = self.write_sync(conn, &batch) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Writes every pending entry into the R-tree and restores the trigger.
    pub(crate) fn finish(mut self, conn: &Connection) -> GpkgResult<BuildReport> {
        let partial = self.accumulator.seal();
        let mut rebuilt = false;

        if let Some(mut background) = self.background.take() {
            background.queue.close();
            match background.builder.take() {
                Some(builder) => {
                    rebuilt = self.join_builder(conn, builder, &background.queue)?;
                }
                None => {
                    let batches = background.queue.drain();
                    // failures are repaired by the rebuild below
                    let _ = self.write_all(conn, batches);
                }
            }
        }

        if !rebuilt {
            if let Some(batch) = partial {
                let _ = self.write_sync(conn, &batch);
            }
            if self.lost_entries {
                self.rebuild_from_table(conn)?;
            }
        }

        match &self.restore {
            TriggerRestore::Saved(saved) => sql::restore_insert_trigger(conn, saved)?,
            TriggerRestore::CreateAll => sql::create_triggers(conn, &self.names)?,
            TriggerRestore::Nothing => {}
        }
        log::debug!("Resumed {} maintenance: {:?}", self.names.rtree, self.report);
        Ok(self.report)
    }

    /// Joins the builder and folds its output into the R-tree. Returns true
    /// when the R-tree had to be rebuilt from the table instead.
    fn join_builder(
        &mut self,
        conn: &Connection,
        builder: SpatialIndexBuilder,
        queue: &BoundedHandoffQueue<EntryBatch>,
    ) -> GpkgResult<bool> {
        let outcome = builder.finish();
        let (mut sink, batches, failed) = match outcome {
            BuildOutcome::Finished {
                sink,
                batches,
                entries,
            } => {
                self.report.final_state = BuilderState::Finished;
                self.report.background_entries = entries;
                (sink, batches, None)
            }
            BuildOutcome::Errored {
                sink,
                failure,
                batches,
            } => {
                log::warn!(
                    "Background build of {} failed, replaying remaining batches: {}",
                    self.names.rtree,
                    failure.error
                );
                self.report.final_state = BuilderState::Errored;
                self.report.failed_batch = failure.batch.as_ref().map(EntryBatch::seq);
                (sink, batches, failure.batch)
            }
            BuildOutcome::Panicked => {
                self.report.final_state = BuilderState::Errored;
                queue.drain();
                return self.rebuild_from_table(conn);
            }
        };
        self.report.background_batches = batches;

        let merged = sink.merge_into(conn, &self.names.rtree);
        sink.discard();
        match merged {
            Ok(count) => self.report.entries_merged = count,
            Err(e) => {
                log::warn!("Merging staged entries into {} failed: {}", self.names.rtree, e);
                queue.drain();
                return self.rebuild_from_table(conn);
            }
        }

        // replayed after the merge so an empty R-tree can take whole nodes
        let replay = failed.into_iter().chain(queue.drain());
        let _ = self.write_all(conn, replay);
        Ok(false)
    }

    fn rebuild_from_table(&mut self, conn: &Connection) -> GpkgResult<bool> {
        log::warn!("Rebuilding {} from its table", self.names.rtree);
        sql::clear(conn, &self.names.rtree)?;
        let count = sql::populate_from_table(conn, &self.names)?;
        self.report.entries_synchronous = count as u64;
        self.report.rebuilt_from_table = true;
        Ok(true)
    }

    /// Stops the builder and drops every pending entry.
    pub(crate) fn cancel(mut self) {
        if let Some(mut background) = self.background.take() {
            if let Some(builder) = background.builder.take() {
                builder.cancel();
            }
            background.queue.close();
            background.queue.drain();
        }
        log::debug!(
            "Discarded {} pending entries of {}",
            self.accumulator.pending(),
            self.names.rtree
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, GpkgError};
    use crate::geometry::{Envelope, Geometry, GpkgBlob};
    use crate::index::{EntryTranslator, IndexSink, SqliteStagingSink};
    use crate::store::{metadata, open_primary, page_size, ResourceTracker};
    use crate::feature::FeatureDefn;
    use crate::geometry::WkbGeometryType;
    use std::path::Path;

    struct FailingFactory {
        fail_on: u64,
    }

    struct FailingSink {
        inner: SqliteStagingSink,
        fail_on: u64,
    }

    impl IndexSink for FailingSink {
        fn open(&mut self) -> GpkgResult<()> {
            self.inner.open()
        }

        fn write_batch(&mut self, batch: &EntryBatch) -> GpkgResult<()> {
            if batch.seq() == self.fail_on {
                return Err(GpkgError::new("injected", ErrorKind::WriteError));
            }
            self.inner.write_batch(batch)
        }

        fn finish(&mut self) -> GpkgResult<()> {
            self.inner.finish()
        }

        fn merge_into(&mut self, conn: &Connection, rtree: &str) -> GpkgResult<u64> {
            self.inner.merge_into(conn, rtree)
        }

        fn discard(&mut self) {
            self.inner.discard()
        }
    }

    impl IndexSinkFactory for FailingFactory {
        fn create_sink(&self, target: &SinkTarget) -> GpkgResult<Box<dyn IndexSink>> {
            Ok(Box::new(FailingSink {
                inner: SqliteStagingSink::new(target),
                fail_on: self.fail_on,
            }))
        }
    }

    fn setup(path: &Path) -> (Connection, RTreeNames) {
        let conn = open_primary(Some(path), true).unwrap();
        metadata::initialize(&conn).unwrap();
        let defn = FeatureDefn::new("pts").with_geometry(WkbGeometryType::Point, 0);
        metadata::create_feature_table(&conn, &defn).unwrap();
        let names = RTreeNames::new("pts", "geom", "fid");
        sql::create_rtree_table(&conn, &names.rtree).unwrap();
        sql::create_triggers(&conn, &names).unwrap();
        (conn, names)
    }

    fn background(
        path: &Path,
        conn: &Connection,
        factory: Arc<dyn IndexSinkFactory>,
        resources: &ResourceTracker,
    ) -> BackgroundTarget {
        let config = GpkgConfig::new();
        config.set_rtree_batches_before_start(2);
        BackgroundTarget {
            factory,
            target: SinkTarget {
                dataset_path: path.to_path_buf(),
                table: "pts".to_string(),
                rtree: "rtree_pts_geom".to_string(),
                page_size: page_size(conn).unwrap(),
                resources: resources.clone(),
            },
            config,
        }
    }

    fn entry(i: i64) -> IndexEntry {
        EntryTranslator::from_envelope(i, &Envelope::of_point(i as f64, -i as f64)).unwrap()
    }

    fn insert_trigger_exists(conn: &Connection) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'rtree_pts_geom_insert'",
            [],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_synchronous_deferral_restores_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, names) = setup(&dir.path().join("d.gpkg"));
        let mut deferred = DeferredIndex::begin(&conn, &names, false, 10, None).unwrap();
        assert!(!insert_trigger_exists(&conn));
        for i in 1..=25 {
            deferred.route(&conn, entry(i)).unwrap();
        }
        // two full batches are written as they seal
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 20);
        let report = deferred.finish(&conn).unwrap();
        assert_eq!(report.entries_synchronous, 25);
        assert!(!report.background_started);
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 25);
        assert!(insert_trigger_exists(&conn));
    }

    fn insert_row(conn: &Connection, i: i64) {
        let blob = GpkgBlob::encode(&Geometry::point(i as f64, -i as f64), 0);
        conn.execute("INSERT INTO pts (fid, geom) VALUES (?1, ?2)", rusqlite::params![i, blob])
            .unwrap();
    }

    #[test]
    fn test_lost_batch_is_rebuilt_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, names) = setup(&dir.path().join("d.gpkg"));
        let mut deferred = DeferredIndex::begin(&conn, &names, false, 10, None).unwrap();
        for i in 1..=9 {
            insert_row(&conn, i);
            deferred.route(&conn, entry(i)).unwrap();
        }

        conn.execute_batch("ALTER TABLE rtree_pts_geom RENAME TO rtree_pts_moved").unwrap();
        insert_row(&conn, 10);
        assert!(deferred.route(&conn, entry(10)).is_err());
        conn.execute_batch("ALTER TABLE rtree_pts_moved RENAME TO rtree_pts_geom").unwrap();

        for i in 11..=25 {
            insert_row(&conn, i);
            deferred.route(&conn, entry(i)).unwrap();
        }
        let report = deferred.finish(&conn).unwrap();
        assert!(report.rebuilt_from_table);
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 25);
        assert_eq!(
            sql::query_range(&conn, &names.rtree, &Envelope::new(4.0, -6.0, 6.0, -4.0)).unwrap(),
            vec![4, 5, 6]
        );
        assert!(insert_trigger_exists(&conn));
    }

    #[test]
    fn test_background_build_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.gpkg");
        let (conn, names) = setup(&path);
        let resources = ResourceTracker::new();
        let target = background(&path, &conn, Arc::new(crate::index::SqliteStagingSinkFactory), &resources);
        let mut deferred = DeferredIndex::begin(&conn, &names, false, 10, Some(target)).unwrap();

        for i in 1..=19 {
            deferred.route(&conn, entry(i)).unwrap();
        }
        assert_eq!(deferred.builder_state(), BuilderState::Idle);
        deferred.route(&conn, entry(20)).unwrap();
        assert_ne!(deferred.builder_state(), BuilderState::Idle);
        for i in 21..=55 {
            deferred.route(&conn, entry(i)).unwrap();
        }

        let report = deferred.finish(&conn).unwrap();
        assert!(report.background_started);
        assert_eq!(report.final_state, BuilderState::Finished);
        assert_eq!(report.background_entries, 50);
        assert_eq!(report.entries_merged, 50);
        assert_eq!(report.entries_synchronous, 5);
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 55);
        assert!(resources.snapshot().is_idle());
    }

    #[test]
    fn test_failed_batch_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.gpkg");
        let (conn, names) = setup(&path);
        let resources = ResourceTracker::new();
        let target = background(&path, &conn, Arc::new(FailingFactory { fail_on: 3 }), &resources);
        let mut deferred = DeferredIndex::begin(&conn, &names, false, 10, Some(target)).unwrap();
        for i in 1..=100 {
            deferred.route(&conn, entry(i)).unwrap();
        }

        let report = deferred.finish(&conn).unwrap();
        assert_eq!(report.final_state, BuilderState::Errored);
        assert_eq!(report.failed_batch, Some(3));
        assert_eq!(report.entries_merged + report.entries_synchronous, 100);
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 100);
        assert_eq!(
            sql::query_range(&conn, &names.rtree, &Envelope::new(40.0, -42.0, 42.0, -40.0)).unwrap(),
            vec![40, 41, 42]
        );
        assert!(resources.snapshot().is_idle());
    }

    #[test]
    fn test_cancel_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.gpkg");
        let (conn, names) = setup(&path);
        let resources = ResourceTracker::new();
        let target = background(&path, &conn, Arc::new(crate::index::SqliteStagingSinkFactory), &resources);
        let mut deferred = DeferredIndex::begin(&conn, &names, false, 5, Some(target)).unwrap();
        for i in 1..=40 {
            deferred.route(&conn, entry(i)).unwrap();
        }
        deferred.cancel();
        assert_eq!(sql::entry_count(&conn, &names.rtree).unwrap(), 0);
        assert!(resources.snapshot().is_idle());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().contains("tmp_rtree"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
