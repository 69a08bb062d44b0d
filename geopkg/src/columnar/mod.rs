//! Arrow export of feature tables.
//!
//! A scan picks one [`ExportStrategy`] up front:
//! - `Prefetch`: a FIFO of one-batch tasks, each on its own read-only
//!   connection, running ahead of the consumer
//! - `SingleFiller`: one background thread with a single cursor, handing
//!   batches over through a mutex/condvar slot
//! - `Inline`: keyset pages read on the caller's thread

mod batch;
mod filler;
mod prefetch;
mod schema;
mod stream;

pub use schema::{arrow_schema, arrow_type, check_prefetch_compatible, EXTENSION_NAME_KEY, GEOARROW_WKB};
pub use stream::{ExportStrategy, FeatureBatchStream};

/// Bounds of one record batch; whichever is reached first ends the batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
}
