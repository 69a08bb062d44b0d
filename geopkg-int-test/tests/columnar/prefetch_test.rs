use arrow_array::{Array, BinaryArray, Float64Array, Int32Array};
use geopkg::columnar::ExportStrategy;
use geopkg::geometry::Geometry;
use geopkg_int_test::test_util::{
    batch_fids, cleanup, create_test_context_with, load_points, points_defn, run_test,
};

#[test]
fn test_pending_tasks_follow_row_count() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(5_000).prefetch_in_flight(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("rows"), false)?;
            load_points(&gpkg, &layer, 15_000)?;

            let mut fids = Vec::new();
            let first = layer.get_next_columnar_batch()?.unwrap();
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Prefetch));
            assert_eq!(first.num_rows(), 5_000);
            assert_eq!(layer.pending_prefetch_tasks(), 2);
            fids.extend(batch_fids(&first));

            let second = layer.get_next_columnar_batch()?.unwrap();
            assert_eq!(layer.pending_prefetch_tasks(), 1);
            fids.extend(batch_fids(&second));

            let third = layer.get_next_columnar_batch()?.unwrap();
            assert_eq!(layer.pending_prefetch_tasks(), 0);
            fids.extend(batch_fids(&third));

            assert!(layer.get_next_columnar_batch()?.is_none());
            assert_eq!(fids, (1..=15_000).collect::<Vec<i64>>());
            assert!(gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_prefetched_values_match_features() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(64).prefetch_in_flight(3)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("values"), true)?;
            load_points(&gpkg, &layer, 200)?;

            let mut rows = 0;
            while let Some(batch) = layer.get_next_columnar_batch()? {
                assert!(batch.num_rows() <= 64);
                let fids = batch_fids(&batch);
                let geometries = batch.column(1).as_any().downcast_ref::<BinaryArray>().unwrap();
                let ranks = batch.column(3).as_any().downcast_ref::<Int32Array>().unwrap();
                let scores = batch.column(4).as_any().downcast_ref::<Float64Array>().unwrap();
                for (row, fid) in fids.iter().enumerate() {
                    let i = *fid as i32;
                    let geometry = Geometry::from_wkb(geometries.value(row)).unwrap();
                    assert_eq!(geometry, Geometry::point(i as f64, i as f64 / 2.0));
                    assert_eq!(ranks.value(row), i);
                    assert_eq!(scores.value(row), i as f64 * 0.25);
                }
                rows += batch.num_rows();
            }
            assert_eq!(layer.columnar_strategy(), Some(ExportStrategy::Prefetch));
            assert_eq!(rows, 200);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_empty_table_yields_no_batch() {
    run_test(
        || create_test_context_with(|b| b),
        |ctx| {
            let layer = ctx.gpkg().create_layer(points_defn("nothing"), true)?;
            assert!(layer.get_next_columnar_batch()?.is_none());
            assert_eq!(layer.pending_prefetch_tasks(), 0);
            assert!(ctx.gpkg().resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}
