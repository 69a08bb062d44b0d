use geopkg::errors::ErrorKind;
use geopkg::geometry::Envelope;
use geopkg::GeoPackage;
use geopkg_int_test::test_util::{
    cleanup, create_test_context, create_test_context_with, insert_points, load_points,
    points_defn, run_test,
};

#[test]
fn test_reopen_preserves_layers_and_index() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(64).rtree_batches_before_start(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("stations"), true)?;
            gpkg.create_layer(points_defn("unindexed"), false)?;
            load_points(&gpkg, &layer, 500)?;
            gpkg.sync_to_disk()?;

            let path = gpkg.path().unwrap().to_path_buf();
            let reopened = GeoPackage::open(&path)?;
            let mut names = reopened.layer_names()?;
            names.sort();
            assert_eq!(names, vec!["stations", "unindexed"]);

            let stations = reopened.layer("Stations")?;
            assert!(stations.has_spatial_index());
            assert!(!reopened.layer("unindexed")?.has_spatial_index());
            assert_eq!(stations.get_extent(), Envelope::new(1.0, 0.5, 500.0, 250.0));
            assert_eq!(stations.spatial_index_entry_count()?, 500);
            assert_eq!(
                stations.query_spatial_index(&Envelope::new(10.0, 0.0, 11.0, 10.0))?,
                vec![10, 11]
            );
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_create_refuses_existing_file() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.gpkg().path().unwrap().to_path_buf();
            let err = GeoPackage::create(&path).err().unwrap();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

            let other = ctx.dir().unwrap().join("not-a-geopackage.gpkg");
            std::fs::write(&other, b"plain text, not sqlite").unwrap();
            assert!(GeoPackage::open(&other).is_err());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_transaction_state_is_checked() {
    run_test(
        create_test_context,
        |ctx| {
            let gpkg = ctx.gpkg();
            let err = gpkg.commit_transaction().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
            let err = gpkg.rollback_transaction().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

            gpkg.start_transaction()?;
            let err = gpkg.start_transaction().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
            assert!(gpkg.in_transaction());
            gpkg.commit_transaction()?;
            assert!(!gpkg.in_transaction());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_dropping_dataset_rolls_back_open_transaction() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.dir().unwrap().join("dropped.gpkg");
            {
                let gpkg = GeoPackage::builder()
                    .rtree_batch_size(20)
                    .rtree_batches_before_start(2)
                    .create(&path)?;
                let layer = gpkg.create_layer(points_defn("kept"), true)?;
                load_points(&gpkg, &layer, 10)?;

                gpkg.start_transaction()?;
                insert_points(&layer, 11..=200)?;
            }
            assert_eq!(ctx.staging_leftovers(), 0);

            let reopened = GeoPackage::open(&path)?;
            let layer = reopened.layer("kept")?;
            assert_eq!(layer.get_feature_count()?, 10);
            assert_eq!(layer.spatial_index_entry_count()?, 10);

            // triggers survived the rollback
            insert_points(&layer, 11..=11)?;
            assert_eq!(layer.spatial_index_entry_count()?, 11);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_extent_follows_edits() {
    run_test(
        create_test_context,
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("moving"), true)?;
            insert_points(&layer, 1..=10)?;
            assert_eq!(layer.get_extent(), Envelope::new(1.0, 0.5, 10.0, 5.0));

            layer.delete_feature(10)?;
            // deletes never shrink the cached extent
            assert_eq!(layer.get_extent(), Envelope::new(1.0, 0.5, 10.0, 5.0));
            assert_eq!(layer.recompute_extent()?, Envelope::new(1.0, 0.5, 9.0, 4.5));
            Ok(())
        },
        cleanup,
    )
}
