use super::batch::ColumnarBatchBuilder;
use super::filler::SingleFillerExporter;
use super::prefetch::PrefetchExporter;
use super::schema::{arrow_schema, check_prefetch_compatible};
use super::BatchLimits;
use crate::dataset::DatasetShared;
use crate::errors::GpkgResult;
use crate::layer::ScanQuery;
use crate::store::open_read_only;
use arrow::ffi_stream::FFI_ArrowArrayStream;
use arrow_array::{RecordBatch, RecordBatchReader};
use arrow_schema::{ArrowError, SchemaRef};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// How a columnar scan is produced. Decided once, before any worker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStrategy {
    /// Read-ahead tasks, each on its own read-only connection.
    Prefetch,
    /// One background filler thread with its own cursor.
    SingleFiller,
    /// Batches filled on the caller's thread through the primary connection.
    Inline,
}

impl Display for ExportStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportStrategy::Prefetch => write!(f, "prefetch"),
            ExportStrategy::SingleFiller => write!(f, "single filler"),
            ExportStrategy::Inline => write!(f, "inline"),
        }
    }
}

/// Keyset-paged filler running on the primary connection.
struct InlineReader {
    dataset: Arc<DatasetShared>,
    query: ScanQuery,
    builder: ColumnarBatchBuilder,
    limits: BatchLimits,
    after_fid: i64,
    exhausted: bool,
}

impl InlineReader {
    fn next_batch(&mut self) -> GpkgResult<Option<RecordBatch>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = {
            let conn = self.dataset.conn();
            self.query.read_page(
                &conn,
                self.after_fid,
                self.limits.max_rows,
                self.limits.max_bytes,
            )?
        };
        self.exhausted = page.exhausted;
        if let Some(fid) = page.last_fid {
            self.after_fid = fid;
        }
        if page.rows.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        for raw in &page.rows {
            self.builder.append(raw)?;
        }
        Ok(Some(self.builder.finish()?))
    }
}

enum BatchSource {
    Prefetch(PrefetchExporter),
    SingleFiller(SingleFillerExporter),
    Inline(InlineReader),
}

/// Stream of Arrow record batches over a layer.
///
/// Implements [`RecordBatchReader`], so it can be handed to any Arrow
/// consumer or exported through the C stream interface with
/// [`into_ffi`](Self::into_ffi). Dropping the stream stops and joins every
/// worker it started.
pub struct FeatureBatchStream {
    schema: SchemaRef,
    strategy: ExportStrategy,
    source: BatchSource,
    finished: bool,
}

impl FeatureBatchStream {
    pub(crate) fn open(dataset: Arc<DatasetShared>, query: ScanQuery) -> GpkgResult<FeatureBatchStream> {
        let schema = arrow_schema(query.defn());
        let config = dataset.config().clone();
        let limits = BatchLimits {
            max_rows: config.arrow_batch_size(),
            max_bytes: config.arrow_max_batch_bytes(),
        };

        let strategy = choose_strategy(&dataset, &query);
        log::debug!(
            "Columnar scan of {} uses the {} strategy",
            query.defn().table_name(),
            strategy
        );
        let source = match (strategy, dataset.path()) {
            (ExportStrategy::Prefetch, Some(path)) => {
                let total_rows = query.count(&dataset.conn())?;
                BatchSource::Prefetch(PrefetchExporter::new(
                    path,
                    query,
                    schema.clone(),
                    limits.max_rows,
                    config.prefetch_in_flight(),
                    total_rows,
                    dataset.resources(),
                ))
            }
            (ExportStrategy::SingleFiller, Some(path)) => {
                match open_read_only(path, dataset.resources()) {
                    Ok(conn) => BatchSource::SingleFiller(SingleFillerExporter::start(
                        conn,
                        query,
                        schema.clone(),
                        limits,
                        dataset.resources(),
                    )?),
                    Err(e) => {
                        log::warn!("Secondary connection unavailable, filling inline: {}", e);
                        return Ok(Self::inline(dataset, query, schema, limits));
                    }
                }
            }
            _ => return Ok(Self::inline(dataset, query, schema, limits)),
        };
        Ok(FeatureBatchStream {
            schema,
            strategy,
            source,
            finished: false,
        })
    }

    fn inline(
        dataset: Arc<DatasetShared>,
        query: ScanQuery,
        schema: SchemaRef,
        limits: BatchLimits,
    ) -> FeatureBatchStream {
        let builder = ColumnarBatchBuilder::new(schema.clone(), query.defn(), limits.max_rows);
        FeatureBatchStream {
            schema,
            strategy: ExportStrategy::Inline,
            source: BatchSource::Inline(InlineReader {
                dataset,
                query,
                builder,
                limits,
                after_fid: i64::MIN,
                exhausted: false,
            }),
            finished: false,
        }
    }

    pub fn strategy(&self) -> ExportStrategy {
        self.strategy
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Returns the next batch, or `None` at the end of the scan.
    ///
    /// An error ends the stream; it is never reported as a silent end.
    pub fn next_batch(&mut self) -> GpkgResult<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }
        let next = match &mut self.source {
            BatchSource::Prefetch(prefetch) => prefetch.next_batch(),
            BatchSource::SingleFiller(filler) => filler.next_batch(),
            BatchSource::Inline(inline) => inline.next_batch(),
        };
        match next {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    /// Prefetch tasks started and not yet consumed.
    pub fn pending_tasks(&self) -> usize {
        match &self.source {
            BatchSource::Prefetch(prefetch) => prefetch.in_flight(),
            _ => 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stops all workers of this scan and waits for them to exit.
    pub fn cancel(&mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        match &mut self.source {
            BatchSource::Prefetch(prefetch) => prefetch.cancel(),
            BatchSource::SingleFiller(filler) => filler.cancel(),
            BatchSource::Inline(_) => {}
        }
    }

    /// Exports the stream through the Arrow C stream interface.
    pub fn into_ffi(self) -> FFI_ArrowArrayStream {
        FFI_ArrowArrayStream::new(Box::new(self))
    }
}

fn choose_strategy(dataset: &DatasetShared, query: &ScanQuery) -> ExportStrategy {
    if !dataset.config().async_columnar()
        || dataset.path().is_none()
        || dataset.in_transaction()
    {
        return ExportStrategy::Inline;
    }
    if query.is_filtered() {
        return ExportStrategy::SingleFiller;
    }
    match check_prefetch_compatible(query.defn()) {
        Ok(()) => ExportStrategy::Prefetch,
        Err(e) => {
            log::debug!("{}, not prefetching", e);
            ExportStrategy::SingleFiller
        }
    }
}

impl Iterator for FeatureBatchStream {
    type Item = Result<RecordBatch, ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl RecordBatchReader for FeatureBatchStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Drop for FeatureBatchStream {
    fn drop(&mut self) {
        self.finish();
    }
}
