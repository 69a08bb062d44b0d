use arrow::ffi_stream::ArrowArrayStreamReader;
use arrow_array::RecordBatchReader;
use geopkg::columnar::{EXTENSION_NAME_KEY, GEOARROW_WKB};
use geopkg_int_test::test_util::{
    batch_fids, cleanup, create_test_context_with, load_points, points_defn, run_test,
};

#[test]
fn test_stream_exports_through_c_interface() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(250).prefetch_in_flight(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("exported"), true)?;
            load_points(&gpkg, &layer, 1_000)?;

            let stream = layer.columnar_stream()?;
            let reader = ArrowArrayStreamReader::try_new(stream.into_ffi())?;
            let schema = reader.schema();
            assert_eq!(
                schema.field(1).metadata().get(EXTENSION_NAME_KEY),
                Some(&GEOARROW_WKB.to_string())
            );

            let mut fids = Vec::new();
            for batch in reader {
                fids.extend(batch_fids(&batch?));
            }
            assert_eq!(fids, (1..=1_000).collect::<Vec<i64>>());
            assert!(gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_record_batch_reader_reports_errors() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(20)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("faulty"), false)?;
            load_points(&gpkg, &layer, 100)?;
            gpkg.execute_batch("UPDATE faulty SET score = x'00ff' WHERE fid = 70")?;

            let stream = layer.columnar_stream()?;
            let names: Vec<String> = stream
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().to_string())
                .collect();
            assert_eq!(names, vec!["fid", "geom", "name", "rank", "score"]);

            let results: Vec<_> = stream.collect();
            assert_eq!(results.len(), 4);
            assert!(results[..3].iter().all(|r| r.is_ok()));
            assert!(results[3].is_err());
            Ok(())
        },
        cleanup,
    )
}
