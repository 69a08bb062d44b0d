use geopkg::errors::{ErrorKind, GpkgError, GpkgResult};
use geopkg::geometry::Envelope;
use geopkg::index::{
    BuilderState, EntryBatch, IndexSink, IndexSinkFactory, SinkTarget, SqliteStagingSink,
};
use geopkg::GeoPackage;
use geopkg_int_test::test_util::{
    cleanup, create_test_context_with, insert_points, point_feature, points_defn, run_test,
    TestContext,
};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Staging sink rejecting one batch sequence number.
struct RejectingSink {
    inner: SqliteStagingSink,
    reject: u64,
}

impl IndexSink for RejectingSink {
    fn open(&mut self) -> GpkgResult<()> {
        self.inner.open()
    }

    fn write_batch(&mut self, batch: &EntryBatch) -> GpkgResult<()> {
        if batch.seq() == self.reject {
            return Err(GpkgError::new("disk full", ErrorKind::WriteError));
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

struct RejectingFactory {
    reject: u64,
    created: AtomicUsize,
}

impl IndexSinkFactory for RejectingFactory {
    fn create_sink(&self, target: &SinkTarget) -> GpkgResult<Box<dyn IndexSink>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RejectingSink {
            inner: SqliteStagingSink::new(target),
            reject: self.reject,
        }))
    }
}

/// Sink whose storage can never be opened.
struct UnopenableFactory;

struct UnopenableSink;

impl IndexSink for UnopenableSink {
    fn open(&mut self) -> GpkgResult<()> {
        Err(GpkgError::new("no staging storage", ErrorKind::ConnectionError))
    }

    fn write_batch(&mut self, _batch: &EntryBatch) -> GpkgResult<()> {
        Ok(())
    }

    fn finish(&mut self) -> GpkgResult<()> {
        Ok(())
    }

    fn merge_into(&mut self, _conn: &Connection, _rtree: &str) -> GpkgResult<u64> {
        Ok(0)
    }

    fn discard(&mut self) {}
}

impl IndexSinkFactory for UnopenableFactory {
    fn create_sink(&self, _target: &SinkTarget) -> GpkgResult<Box<dyn IndexSink>> {
        Ok(Box::new(UnopenableSink))
    }
}

#[test]
fn test_failed_batch_is_replayed_synchronously() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(100).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("flaky"), true)?;
            let factory = Arc::new(RejectingFactory {
                reject: 6,
                created: AtomicUsize::new(0),
            });
            layer.set_index_sink_factory(factory.clone());

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=1_000)?;
            gpkg.commit_transaction()?;
            assert_eq!(factory.created.load(Ordering::SeqCst), 1);

            // the seventh batch carries sequence number 6
            let report = layer.last_index_build().unwrap();
            assert_eq!(report.final_state, BuilderState::Errored);
            assert_eq!(report.failed_batch, Some(6));
            assert!(report.entries_synchronous >= 100);
            assert_eq!(report.entries_merged + report.entries_synchronous, 1_000);

            assert_eq!(layer.spatial_index_entry_count()?, 1_000);
            assert_eq!(
                layer.query_spatial_index(&Envelope::new(650.0, 0.0, 652.0, 1_000.0))?,
                vec![650, 651, 652]
            );
            assert!(gpkg.resources().is_idle());
            assert_eq!(ctx.staging_leftovers(), 0);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_failure_disables_background_for_rest_of_transaction() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(10).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let a = gpkg.create_layer(points_defn("first"), true)?;
            let factory = Arc::new(RejectingFactory {
                reject: 0,
                created: AtomicUsize::new(0),
            });
            a.set_index_sink_factory(factory.clone());

            gpkg.start_transaction()?;
            insert_points(&a, 1..=100)?;
            // forces a flush; the table's R-tree is no longer empty afterwards
            assert_eq!(a.spatial_index_entry_count()?, 100);
            insert_points(&a, 101..=200)?;
            gpkg.commit_transaction()?;

            assert_eq!(factory.created.load(Ordering::SeqCst), 1);
            assert_eq!(a.spatial_index_entry_count()?, 200);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_builder_that_cannot_open_falls_back() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(10).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("closed"), true)?;
            layer.set_index_sink_factory(Arc::new(UnopenableFactory));

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=95)?;
            gpkg.commit_transaction()?;

            let report = layer.last_index_build().unwrap();
            assert_eq!(report.final_state, BuilderState::Errored);
            assert_eq!(report.failed_batch, None);
            assert_eq!(report.entries_synchronous, 95);
            assert_eq!(layer.spatial_index_entry_count()?, 95);
            assert!(gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_failed_synchronous_write_is_repaired_at_commit() {
    run_test(
        || {
            let gpkg = GeoPackage::builder().rtree_batch_size(100).open_in_memory()?;
            Ok(TestContext::new(None, gpkg))
        },
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("lossy"), true)?;

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=99)?;
            // the 100th insert seals a batch the R-tree cannot take
            gpkg.execute_batch("ALTER TABLE rtree_lossy_geom RENAME TO rtree_lossy_away")?;
            let mut sealing = point_feature(&layer, 100.0, 50.0, 100)?;
            assert!(layer.create_feature(&mut sealing).is_err());
            gpkg.execute_batch("ALTER TABLE rtree_lossy_away RENAME TO rtree_lossy_geom")?;
            insert_points(&layer, 101..=105)?;
            gpkg.commit_transaction()?;

            assert_eq!(layer.get_feature_count()?, 105);
            assert_eq!(layer.spatial_index_entry_count()?, 105);
            assert!(layer.last_index_build().unwrap().rebuilt_from_table);
            assert_eq!(
                layer.query_spatial_index(&Envelope::of_point(50.0, 25.0))?,
                vec![50]
            );
            Ok(())
        },
        cleanup,
    )
}
