use geopkg::errors::GpkgResult;
use geopkg::feature::{Feature, FeatureDefn, FieldDefn, FieldType};
use geopkg::geometry::{Envelope, Geometry, WkbGeometryType};
use geopkg::{GeoPackage, TableLayer};
use geopkg_int_test::test_util::{cleanup, create_test_context_with, run_test};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn shapes_defn(name: &str) -> FeatureDefn {
    FeatureDefn::new(name)
        .with_geometry(WkbGeometryType::Geometry, 4326)
        .with_field(FieldDefn::new("seq", FieldType::Integer))
}

fn random_rectangles(seed: u64, count: usize) -> Vec<Envelope> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let x = rng.gen_range(-180.0..170.0);
            let y = rng.gen_range(-90.0..80.0);
            let w = rng.gen_range(0.0..10.0);
            let h = rng.gen_range(0.0..10.0);
            Envelope::new(x, y, x + w, y + h)
        })
        .collect()
}

fn load(gpkg: &GeoPackage, layer: &TableLayer, rectangles: &[Envelope]) -> GpkgResult<()> {
    gpkg.start_transaction()?;
    for (i, rect) in rectangles.iter().enumerate() {
        let geometry = if i % 50 == 0 {
            Geometry::point(rect.min_x, rect.min_y)
        } else {
            Geometry::rectangle(rect)
        };
        let mut feature = Feature::new(layer.defn()).with_geometry(geometry);
        feature.set_field(0, i as i32)?;
        layer.create_feature(&mut feature)?;
    }
    gpkg.commit_transaction()
}

#[test]
fn test_background_and_synchronous_indexes_agree() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(250).rtree_batches_before_start(4)),
        |ctx| {
            let rectangles = random_rectangles(42, 6_000);

            let gpkg = ctx.gpkg();
            let background = gpkg.create_layer(shapes_defn("background"), true)?;
            load(&gpkg, &background, &rectangles)?;
            assert!(background.last_index_build().unwrap().background_started);

            let memory = GeoPackage::builder().rtree_batch_size(250).open_in_memory()?;
            let synchronous = memory.create_layer(shapes_defn("synchronous"), true)?;
            load(&memory, &synchronous, &rectangles)?;
            assert!(!synchronous.last_index_build().unwrap().background_started);

            assert_eq!(
                background.spatial_index_entry_count()?,
                synchronous.spatial_index_entry_count()?
            );

            for window in random_rectangles(7, 40) {
                let window = Envelope::new(
                    window.min_x - 5.0,
                    window.min_y - 5.0,
                    window.max_x + 5.0,
                    window.max_y + 5.0,
                );
                let expected = background.query_spatial_index(&window)?;
                assert_eq!(expected, synchronous.query_spatial_index(&window)?);

                // the index may over-select at rounded edges but never miss
                for (i, rect) in rectangles.iter().enumerate() {
                    if rect.intersects(&window) {
                        assert!(expected.contains(&(i as i64 + 1)));
                    }
                }
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_spatial_filter_matches_with_and_without_index() {
    run_test(
        || create_test_context_with(|b| b.rtree_batch_size(100).rtree_batches_before_start(2)),
        |ctx| {
            let rectangles = random_rectangles(3, 1_500);
            let gpkg = ctx.gpkg();
            let indexed = gpkg.create_layer(shapes_defn("indexed"), true)?;
            let plain = gpkg.create_layer(shapes_defn("plain"), false)?;
            load(&gpkg, &indexed, &rectangles)?;
            load(&gpkg, &plain, &rectangles)?;

            let window = Envelope::new(-20.0, -20.0, 20.0, 20.0);
            indexed.set_spatial_filter(Some(window))?;
            plain.set_spatial_filter(Some(window))?;
            assert_eq!(indexed.get_feature_count()?, plain.get_feature_count()?);

            let mut a = Vec::new();
            while let Some(f) = indexed.get_next_feature()? {
                a.push(f.fid());
            }
            let mut b = Vec::new();
            while let Some(f) = plain.get_next_feature()? {
                b.push(f.fid());
            }
            assert!(!a.is_empty());
            assert_eq!(a, b);
            Ok(())
        },
        cleanup,
    )
}
