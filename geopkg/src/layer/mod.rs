//! Feature tables: the write path with its deferred R-tree maintenance and
//! the row and columnar read paths.

mod deferred;
mod query;
mod table_layer;

pub use deferred::BuildReport;
pub(crate) use query::{RawFeature, ScanQuery};
pub use table_layer::TableLayer;
