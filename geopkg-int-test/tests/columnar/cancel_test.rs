use geopkg::columnar::ExportStrategy;
use geopkg_int_test::test_util::{
    cleanup, create_test_context_with, load_points, points_defn, run_test,
};
use std::thread;
use std::time::Duration;

#[test]
fn test_dropping_prefetch_stream_mid_scan_releases_workers() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(500).prefetch_in_flight(4)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("large"), false)?;
            load_points(&gpkg, &layer, 20_000)?;

            let mut stream = layer.columnar_stream()?;
            assert_eq!(stream.strategy(), ExportStrategy::Prefetch);
            assert!(stream.next_batch()?.is_some());
            assert!(stream.pending_tasks() > 0);
            drop(stream);

            awaitility::at_most(Duration::from_secs(5)).until(|| gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_cancel_single_filler_mid_scan() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(100)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("filler"), false)?;
            load_points(&gpkg, &layer, 5_000)?;
            layer.set_attribute_filter(Some("rank > 10"))?;

            let mut stream = layer.columnar_stream()?;
            assert_eq!(stream.strategy(), ExportStrategy::SingleFiller);
            assert!(stream.next_batch()?.is_some());
            stream.cancel();
            assert!(stream.is_finished());
            assert!(stream.next_batch()?.is_none());

            awaitility::at_most(Duration::from_secs(5)).until(|| gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_reset_reading_stops_layer_scan() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(1_000).prefetch_in_flight(3)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("restart"), true)?;
            load_points(&gpkg, &layer, 10_000)?;

            let first = layer.get_next_columnar_batch()?.unwrap();
            assert_eq!(layer.pending_prefetch_tasks(), 3);
            layer.reset_reading();
            assert_eq!(layer.pending_prefetch_tasks(), 0);
            assert_eq!(layer.columnar_strategy(), None);
            assert!(gpkg.resources().is_idle());

            // the scan starts over from the first row
            assert_eq!(layer.get_next_columnar_batch()?.unwrap(), first);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_layer_usable_while_another_thread_reads_batches() {
    run_test(
        || create_test_context_with(|b| b.arrow_batch_size(500).prefetch_in_flight(2)),
        |ctx| {
            let gpkg = ctx.gpkg();
            let layer = gpkg.create_layer(points_defn("shared"), true)?;
            load_points(&gpkg, &layer, 20_000)?;

            let reader = layer.clone();
            let handle = thread::spawn(move || {
                while let Some(batch) = reader.get_next_columnar_batch()? {
                    assert!(batch.num_rows() > 0);
                }
                Ok::<(), geopkg::errors::GpkgError>(())
            });

            for fid in [1, 5_000, 20_000] {
                assert_eq!(layer.get_feature(fid)?.and_then(|f| f.fid()), Some(fid));
                layer.reset_reading();
                assert_eq!(layer.get_feature_count()?, 20_000);
            }

            handle.join().unwrap()?;
            awaitility::at_most(Duration::from_secs(5)).until(|| gpkg.resources().is_idle());
            Ok(())
        },
        cleanup,
    )
}
