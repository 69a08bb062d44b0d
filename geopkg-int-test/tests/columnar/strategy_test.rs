use chrono::NaiveDate;
use geopkg::columnar::ExportStrategy;
use geopkg::errors::ErrorKind;
use geopkg::feature::{Feature, FeatureDefn, FieldDefn, FieldType};
use geopkg::geometry::{Envelope, Geometry, WkbGeometryType};
use geopkg::GeoPackage;
use geopkg_int_test::test_util::{
    cleanup, create_memory_context, create_test_context_with, insert_points, load_points,
    points_defn, read_columnar, read_rows, run_test,
};

#[test]
fn test_unfiltered_scan_prefetches() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(300)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("all"), true)?;
            load_points(&gpkg, &layer, 1_000)?;

            let columnar = read_columnar(&layer)?;
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Prefetch));
            assert_eq!(columnar, read_rows(&layer)?);
            assert_eq!(columnar.len(), 1_000);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_filtered_scan_uses_single_filler() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(100)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("filtered"), true)?;
            load_points(&gpkg, &layer, 1_000)?;

            layer.set_attribute_filter(Some("rank % 3 = 0"))?;
            let columnar = read_columnar(&layer)?;
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::SingleFiller));
            assert_eq!(columnar.len(), 333);
            assert_eq!(columnar, read_rows(&layer)?);

            layer.set_spatial_filter(Some(Envelope::new(100.0, 0.0, 400.0, 1_000.0)))?;
            let columnar = read_columnar(&layer)?;
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::SingleFiller));
            assert_eq!(columnar.len(), 100);
            assert_eq!(columnar, read_rows(&layer)?);

            layer.set_attribute_filter(None)?;
            layer.set_spatial_filter(None)?;
            assert_eq!(read_columnar(&layer)?.len(), 1_000);
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Prefetch));
            assert!(gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_text_dates_fall_back_to_single_filler() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(40)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let defn = FeatureDefn::new("events")
                .with_geometry(WkbGeometryType::Point, 4326)
                .with_field(FieldDefn::new("name", FieldType::String))
                .with_field(FieldDefn::new("day", FieldType::Date));
            let layer = gpkg.create_layer(defn, false)?;
            let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

            gpkg.start_transaction()?;
            for i in 0..150 {
                let mut feature =
                    Feature::new(layer.defn()).with_geometry(Geometry::point(i as f64, 0.0));
                feature.set_field(0, format!("event {}", i))?;
                feature.set_field(1, start + chrono::Duration::days(i))?;
                layer.create_feature(&mut feature)?;
            }
            gpkg.commit_transaction()?;

            let columnar = read_columnar(&layer)?;
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::SingleFiller));
            assert_eq!(columnar, read_rows(&layer)?);
            assert_eq!(columnar.len(), 150);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_scan_inside_transaction_is_inline() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(128)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("pending"), true)?;
            load_points(&gpkg, &layer, 100)?;

            gpkg.start_transaction()?;
            insert_points(&layer, 101..=300)?;
            // uncommitted rows are only visible through the primary connection
            let columnar = read_columnar(&layer)?;
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Inline));
            assert_eq!(columnar.len(), 300);
            assert_eq!(columnar, read_rows(&layer)?);
            gpkg.rollback_transaction()?;

            assert_eq!(read_columnar(&layer)?.len(), 100);
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Prefetch));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_in_memory_scan_is_inline() {
    run_test(
        create_memory_context,
        |ctx| {
            let gpkg = ctx.gpkg();
            gpkg.config().set_arrow_batch_size(33);
            let layer = gpkg.create_layer(points_defn("memory"), true)?;
            load_points(&gpkg, &layer, 100)?;

            let mut stream = layer.columnar_stream()?;
            assert_eq!(stream.strategy(), ExportStrategy::Inline);
            let mut sizes = Vec::new();
            while let Some(batch) = stream.next_batch()? {
                sizes.push(batch.num_rows());
            }
            assert_eq!(sizes, vec![33, 33, 33, 1]);
            assert!(stream.is_finished());

            layer.set_attribute_filter(Some("name LIKE 'p1%'"))?;
            assert_eq!(read_columnar(&layer)?, read_rows(&layer)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_disabled_async_export_is_inline() {
    run_test(
        || create_test_context_with(|b| b.async_columnar(false)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("sync"), false)?;
            load_points(&gpkg, &layer, 50)?;
            assert_eq!(read_columnar(&layer)?.len(), 50);
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Inline));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_bad_row_surfaces_as_read_error() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(10).prefetch_in_flight(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("broken"), false)?;
            load_points(&gpkg, &layer, 100)?;
            gpkg.execute_batch("UPDATE broken SET rank = 'many' WHERE fid = 57")?;

            for filter in [None, Some("fid > 0")] {
                layer.set_attribute_filter(filter)?;
                let mut rows = 0;
                let err = loop {
                    match layer.get_next_columnar_batch() {
                        Ok(Some(batch)) => rows += batch.num_rows(),
                        Ok(None) => panic!("scan ended without reporting the bad row"),
                        Err(e) => break e,
                    }
                };
                assert_eq!(err.kind(), &ErrorKind::ReadError);
                assert_eq!(rows, 50);
                // the failed scan is over, not silently restarted
                assert!(layer.get_next_columnar_batch()?.is_none());
                assert!(gpkg.resources().is_idle());
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_independent_streams_do_not_interfere() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(25)),
        |ctx| {
            let gpkg: GeoPackage = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("shared"), false)?;
            load_points(&gpkg, &layer, 100)?;

            let mut a = layer.columnar_stream()?;
            let mut b = layer.columnar_stream()?;
            let first_a = a.next_batch()?.unwrap();
            let first_b = b.next_batch()?.unwrap();
            assert_eq!(first_a, first_b);
            drop(a);
            let mut rest = 0;
            while let Some(batch) = b.next_batch()? {
                rest += batch.num_rows();
            }
            assert_eq!(rest, 75);
            Ok(())
        },
        cleanup,
    )
}
