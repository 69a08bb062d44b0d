//! # geopkg
//!
//! GeoPackage feature tables stored in SQLite, with two pieces of
//! background machinery:
//!
//! - **Background R-tree building.** Inside a write transaction, index
//!   entries of inserted features are batched and handed to a worker thread
//!   through a bounded queue. The worker builds the R-tree in a staging
//!   database; the result is merged into the GeoPackage at commit. Any
//!   failure of the worker falls back to synchronous indexing, so a
//!   committed R-tree is always complete.
//! - **Asynchronous Arrow export.** Columnar scans produce Arrow record
//!   batches ahead of the consumer, either with a FIFO of prefetch tasks on
//!   independent read-only connections or with a single filler thread, and
//!   are exposed as a [`arrow_array::RecordBatchReader`].
//!
//! ## Quick start
//!
//! ```rust
//! use geopkg::feature::{Feature, FeatureDefn};
//! use geopkg::geometry::{Envelope, Geometry, WkbGeometryType};
//! use geopkg::GeoPackage;
//!
//! # fn main() -> geopkg::errors::GpkgResult<()> {
//! let gpkg = GeoPackage::open_in_memory()?;
//! let layer = gpkg.create_layer(
//!     FeatureDefn::new("pois").with_geometry(WkbGeometryType::Point, 4326),
//!     true,
//! )?;
//!
//! gpkg.start_transaction()?;
//! for i in 0..100 {
//!     let mut poi = Feature::new(layer.defn()).with_geometry(Geometry::point(i as f64, 0.0));
//!     layer.create_feature(&mut poi)?;
//! }
//! gpkg.commit_transaction()?;
//!
//! assert_eq!(layer.query_spatial_index(&Envelope::new(9.5, -1.0, 11.5, 1.0))?, vec![11, 12]);
//!
//! let mut rows = 0;
//! while let Some(batch) = layer.get_next_columnar_batch()? {
//!     rows += batch.num_rows();
//! }
//! assert_eq!(rows, 100);
//! # Ok(())
//! # }
//! ```

pub mod columnar;
pub mod config;
pub mod errors;
pub mod feature;
pub mod geometry;
pub mod index;

mod builder;
mod dataset;
mod layer;
mod store;

pub use builder::GpkgBuilder;
pub use config::GpkgConfig;
pub use dataset::GeoPackage;
pub use layer::{BuildReport, TableLayer};
pub use store::{ResourceSnapshot, ResourceTracker, SecondaryConnection};
