use geopkg::geometry::Envelope;
use geopkg::index::BuilderState;
use geopkg::TableLayer;
use geopkg_int_test::test_util::{
    cleanup, create_test_context, create_test_context_with, insert_points, point_feature,
    points_defn, run_test,
};

#[test]
fn test_builder_starts_after_configured_batches() {
    run_test(
        || {
            create_test_context_with(|b| b.rtree_batch_size(1_000).rtree_batches_before_start(10))
        },
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("bulk"), true)?;

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=9_999)?;
            // nine sealed batches and a partial one
            assert_eq!(layer.index_builder_state(), BuilderState::Idle);

            insert_points(&layer, 10_000..=10_000)?;
            assert_ne!(layer.index_builder_state(), BuilderState::Idle);

            insert_points(&layer, 10_001..=25_000)?;
            gpkg.commit_transaction()?;

            let report = layer.last_index_build().unwrap();
            assert!(report.background_started);
            assert_eq!(report.final_state, BuilderState::Finished);
            assert!(report.entries_merged >= 10_000);
            assert_eq!(report.background_entries, report.entries_merged);
            assert_eq!(report.entries_merged + report.entries_synchronous, 25_000);
            assert!(!report.rebuilt_from_table);

            assert_eq!(layer.index_builder_state(), BuilderState::Idle);
            assert_eq!(layer.spatial_index_entry_count()?, 25_000);
            assert_eq!(
                layer.query_spatial_index(&Envelope::new(100.0, 0.0, 102.0, 100.0))?,
                vec![100, 101, 102]
            );
            assert!(gpkg.resources().is_idle());
            assert_eq!(ctx.staging_leftovers(), 0);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_small_transaction_never_starts_builder() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(100).rtree_batches_before_start(5)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("small"), true)?;

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=450)?;
            assert_eq!(layer.index_builder_state(), BuilderState::Idle);
            gpkg.commit_transaction()?;

            let report = layer.last_index_build().unwrap();
            assert!(!report.background_started);
            assert_eq!(report.entries_synchronous, 450);
            assert_eq!(layer.spatial_index_entry_count()?, 450);
            assert_eq!(ctx.staging_leftovers(), 0);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_null_geometry_produces_no_entry() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(4).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("sparse"), true)?;

            gpkg.start_transaction()?;
            for i in 1..=30 {
                let mut feature = point_feature(&layer, i as f64, 0.0, i)?;
                if i % 3 == 0 {
                    feature.set_geometry(None);
                }
                layer.create_feature(&mut feature)?;
            }
            gpkg.commit_transaction()?;

            assert_eq!(layer.get_feature_count()?, 30);
            assert_eq!(layer.spatial_index_entry_count()?, 20);
            assert_eq!(
                layer.query_spatial_index(&Envelope::new(2.0, -1.0, 4.0, 1.0))?,
                vec![2, 4]
            );
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_rollback_discards_background_build() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(50).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("discarded"), true)?;

            gpkg.start_transaction()?;
            insert_points(&layer, 1..=500)?;
            assert_ne!(layer.index_builder_state(), BuilderState::Idle);
            gpkg.rollback_transaction()?;

            assert_eq!(layer.get_feature_count()?, 0);
            assert_eq!(layer.spatial_index_entry_count()?, 0);
            assert!(layer.get_extent().is_empty());
            assert_eq!(layer.index_builder_state(), BuilderState::Idle);
            assert!(gpkg.resources().is_idle());
            assert_eq!(ctx.staging_leftovers(), 0);

            // the insert trigger is back in place
            insert_points(&layer, 1..=1)?;
            assert_eq!(layer.spatial_index_entry_count()?, 1);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_non_empty_index_is_maintained_synchronously() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(10).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("existing"), true)?;
            insert_points(&layer, 1..=5)?;
            gpkg.config().set_deferred_update_threshold(20);

            gpkg.start_transaction()?;
            insert_points(&layer, 6..=105)?;
            gpkg.commit_transaction()?;

            let report = layer.last_index_build().unwrap();
            assert!(!report.background_started);
            assert_eq!(layer.spatial_index_entry_count()?, 105);
            assert_eq!(gpkg.resources().live_workers, 0);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_layer_created_in_transaction_gets_triggers_at_commit() {
    run_test(
        create_test_context,
        |ctx| {
            let gpkg = ctx.gpkg();
            gpkg.start_transaction()?;
            let layer: TableLayer = gpkg.create_layer(points_defn("fresh"), true)?;
            insert_points(&layer, 1..=250)?;
            gpkg.commit_transaction()?;

            assert_eq!(layer.spatial_index_entry_count()?, 250);
            insert_points(&layer, 251..=251)?;
            assert_eq!(layer.spatial_index_entry_count()?, 251);
            assert_eq!(gpkg.layer("FRESH")?.get_feature_count()?, 251);
            Ok(())
        },
        cleanup,
    )
}
