mod builder;
mod entry;
mod queue;
mod sink;
pub(crate) mod sql;

pub use builder::{BuildFailure, BuilderState};
pub(crate) use builder::{BuildOutcome, SpatialIndexBuilder};
pub use entry::{EntryBatch, EntryTranslator, IndexEntry};
pub(crate) use entry::BatchAccumulator;
pub use queue::{BoundedHandoffQueue, PushError};
pub use sink::{IndexSink, IndexSinkFactory, SinkTarget, SqliteStagingSink, SqliteStagingSinkFactory};
