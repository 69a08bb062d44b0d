use arrow_array::{Array, Int64Array, RecordBatch, StringArray};
use geopkg::errors::{ErrorKind, GpkgError, GpkgResult};
use geopkg::feature::{Feature, FeatureDefn, FieldDefn, FieldType};
use geopkg::geometry::{Geometry, WkbGeometryType};
use geopkg::{GeoPackage, GpkgBuilder, TableLayer};
use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{env, fs, thread};

/// Runs a test once with error handling. Tests run on the current thread;
/// `after` runs even when the test fails.
///
/// There are no retries: builder handoff and scan cancellation are timing
/// sensitive, so an intermittent failure must fail the run.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> GpkgResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> GpkgResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> GpkgResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    let start_time = Instant::now();
    let result = std::panic::catch_unwind(|| {
        let backtrace = Backtrace::capture();
        match before() {
            Ok(ctx) => match test(ctx.clone()) {
                Ok(_) => match after(ctx) {
                    Ok(_) => Ok(()),
                    Err(e) => Err((format!("After run failed: {:?}", e), backtrace.to_string())),
                },
                Err(e) => {
                    let _ = after(ctx);
                    Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                }
            },
            Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
        }
    });

    let (failure, backtrace) = match result {
        Ok(Ok(_)) => return,
        Ok(Err((e, bt))) => (e, bt),
        Err(panic_err) => {
            let message = if let Some(s) = panic_err.downcast_ref::<&str>() {
                format!("Panic: {}", s)
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                format!("Panic: {}", s)
            } else {
                "Panic: unknown payload".to_string()
            };
            (message, Backtrace::capture().to_string())
        }
    };

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {:?}", start_time.elapsed());
    eprintln!("Error: {}", failure);
    if !backtrace.is_empty() && !backtrace.contains("disabled") {
        eprintln!("\nBacktrace:\n{}", backtrace);
    }
    eprintln!("=====================================================\n");

    panic!("Test failed: {}", failure);
}

#[derive(Clone)]
pub struct TestContext {
    dir: Option<PathBuf>,
    gpkg: GeoPackage,
}

impl TestContext {
    pub fn new(dir: Option<PathBuf>, gpkg: GeoPackage) -> Self {
        Self { dir, gpkg }
    }

    /// Directory holding the dataset file; `None` for in-memory datasets.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn gpkg(&self) -> GeoPackage {
        self.gpkg.clone()
    }

    /// Number of staging databases left next to the dataset file.
    pub fn staging_leftovers(&self) -> usize {
        let Some(dir) = &self.dir else {
            return 0;
        };
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().contains(".tmp_rtree_"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// A fresh directory under the system temp dir.
pub fn random_dir() -> PathBuf {
    env::temp_dir().join(format!("geopkg-{}", uuid::Uuid::new_v4()))
}

/// Creates a file-backed dataset with the default configuration.
pub fn create_test_context() -> GpkgResult<TestContext> {
    create_test_context_with(|builder| builder)
}

/// Creates a file-backed dataset tuned by `configure`.
pub fn create_test_context_with<F>(configure: F) -> GpkgResult<TestContext>
where
    F: Fn(GpkgBuilder) -> GpkgBuilder,
{
    let dir = random_dir();
    fs::create_dir_all(&dir).map_err(|e| {
        GpkgError::new(
            &format!("Failed to create test directory {}: {}", dir.display(), e),
            ErrorKind::IOError,
        )
    })?;
    let gpkg = configure(GeoPackage::builder()).create(dir.join("test.gpkg"))?;
    Ok(TestContext::new(Some(dir), gpkg))
}

pub fn create_memory_context() -> GpkgResult<TestContext> {
    Ok(TestContext::new(None, GeoPackage::open_in_memory()?))
}

pub fn cleanup(ctx: TestContext) -> GpkgResult<()> {
    if ctx.gpkg().in_transaction() {
        if let Err(e) = ctx.gpkg().rollback_transaction() {
            eprintln!("Warning: Failed to roll back: {:?}", e);
        }
    }
    let Some(dir) = ctx.dir.clone() else {
        return Ok(());
    };
    drop(ctx);

    for retry in 0..5u64 {
        match fs::remove_dir_all(&dir) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                if retry == 4 {
                    eprintln!(
                        "Warning: Failed to remove test directory {}: {:?}",
                        dir.display(),
                        e
                    );
                } else {
                    thread::sleep(Duration::from_millis(50 * (retry + 1)));
                }
            }
        }
    }
    Ok(())
}

/// Point layer with a name, a rank and a score.
pub fn points_defn(name: &str) -> FeatureDefn {
    FeatureDefn::new(name)
        .with_geometry(WkbGeometryType::Point, 4326)
        .with_field(FieldDefn::new("name", FieldType::String))
        .with_field(FieldDefn::new("rank", FieldType::Integer))
        .with_field(FieldDefn::new("score", FieldType::Real))
}

pub fn point_feature(layer: &TableLayer, x: f64, y: f64, i: i32) -> GpkgResult<Feature> {
    let mut feature = Feature::new(layer.defn()).with_geometry(Geometry::point(x, y));
    feature.set_field(0, format!("p{}", i))?;
    feature.set_field(1, i)?;
    feature.set_field(2, i as f64 * 0.25)?;
    Ok(feature)
}

/// Inserts the points `(i, i / 2)` for every `i` of `range`. Fids follow
/// insertion order, so the n-th point of an empty table gets fid n.
pub fn insert_points(layer: &TableLayer, range: std::ops::RangeInclusive<i32>) -> GpkgResult<()> {
    for i in range {
        let mut feature = point_feature(layer, i as f64, i as f64 / 2.0, i)?;
        layer.create_feature(&mut feature)?;
    }
    Ok(())
}

/// Bulk-loads `count` points inside a transaction.
pub fn load_points(gpkg: &GeoPackage, layer: &TableLayer, count: i32) -> GpkgResult<()> {
    gpkg.start_transaction()?;
    insert_points(layer, 1..=count)?;
    gpkg.commit_transaction()
}

pub fn batch_fids(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .map(|fids| fids.values().to_vec())
        .unwrap_or_default()
}

/// Non-null values of the string column `index`.
pub fn batch_strings(batch: &RecordBatch, index: usize) -> Vec<Option<String>> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .map(|column| {
            (0..column.len())
                .map(|i| (!column.is_null(i)).then(|| column.value(i).to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Fids and names read through the row interface.
pub fn read_rows(layer: &TableLayer) -> GpkgResult<Vec<(i64, Option<String>)>> {
    layer.reset_reading();
    let mut rows = Vec::new();
    while let Some(feature) = layer.get_next_feature()? {
        let name = feature.field(0).and_then(|v| v.as_str()).map(str::to_string);
        rows.push((feature.fid().unwrap_or_default(), name));
    }
    Ok(rows)
}

/// Fids and names read through the layer's columnar scan.
pub fn read_columnar(layer: &TableLayer) -> GpkgResult<Vec<(i64, Option<String>)>> {
    layer.reset_reading();
    let name_column = if layer.defn().geometry_column().is_some() { 2 } else { 1 };
    let mut rows = Vec::new();
    while let Some(batch) = layer.get_next_columnar_batch()? {
        rows.extend(batch_fids(&batch).into_iter().zip(batch_strings(&batch, name_column)));
    }
    Ok(rows)
}
