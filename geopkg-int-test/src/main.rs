use geopkg::errors::GpkgResult;
use geopkg_int_test::test_util::{cleanup, create_test_context, insert_points, points_defn};

fn main() -> GpkgResult<()> {
    println!("Starting bulk load...");
    let ctx = create_test_context()?;
    let gpkg = ctx.gpkg();
    let layer = gpkg.create_layer(points_defn("stress"), true)?;

    let count = 1_000_000;
    let start = std::time::Instant::now();
    gpkg.start_transaction()?;
    insert_points(&layer, 1..=count)?;
    gpkg.commit_transaction()?;
    println!("Inserted {} points in {:?}", count, start.elapsed());
    if let Some(report) = layer.last_index_build() {
        println!(
            "Index build: {} ({} merged, {} synchronous)",
            report.final_state, report.entries_merged, report.entries_synchronous
        );
    }

    let start = std::time::Instant::now();
    let mut rows = 0;
    while let Some(batch) = layer.get_next_columnar_batch()? {
        rows += batch.num_rows();
    }
    println!("Exported {} rows in {:?}", rows, start.elapsed());

    drop(layer);
    drop(gpkg);
    cleanup(ctx)
}
