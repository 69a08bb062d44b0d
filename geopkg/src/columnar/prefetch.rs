use super::batch::ColumnarBatchBuilder;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::layer::ScanQuery;
use crate::store::{open_read_only, ResourceTracker};
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use crossbeam_channel::{bounded, Receiver};
use rusqlite::params;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A worker producing exactly one batch from its own connection.
struct PrefetchTask {
    start_row: u64,
    handle: Option<JoinHandle<()>>,
    result: Receiver<GpkgResult<RecordBatch>>,
}

impl PrefetchTask {
    fn spawn(
        start_row: u64,
        ctx: &Arc<TaskContext>,
        cancelled: &Arc<AtomicBool>,
        resources: &ResourceTracker,
    ) -> GpkgResult<PrefetchTask> {
        let (sender, result) = bounded(1);
        let worker_guard = resources.worker_guard();
        let ctx = ctx.clone();
        let cancelled = cancelled.clone();
        let resources = resources.clone();
        let handle = std::thread::Builder::new()
            .name(format!("arrow-prefetch-{}", start_row))
            .spawn(move || {
                let _worker = worker_guard;
                let outcome = fill_one(&ctx, start_row, &cancelled, &resources);
                // the receiver may be gone after a cancel
                let _ = sender.send(outcome);
            })
            .map_err(|e| {
                GpkgError::new(
                    &format!("Failed to spawn prefetch task: {}", e),
                    ErrorKind::InternalError,
                )
            })?;
        log::debug!("Started prefetch task at row {}", start_row);
        Ok(PrefetchTask {
            start_row,
            handle: Some(handle),
            result,
        })
    }

    /// Blocks for the task's batch and joins it.
    fn wait(mut self) -> GpkgResult<RecordBatch> {
        let outcome = self.result.recv().unwrap_or_else(|_| {
            Err(GpkgError::new(
                &format!("Prefetch task at row {} exited without a result", self.start_row),
                ErrorKind::InternalError,
            ))
        });
        self.join();
        outcome
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Prefetch task at row {} panicked", self.start_row);
            }
        }
    }
}

impl Drop for PrefetchTask {
    fn drop(&mut self) {
        self.join();
    }
}

struct TaskContext {
    path: PathBuf,
    query: ScanQuery,
    schema: SchemaRef,
    batch_size: usize,
}

fn fill_one(
    ctx: &TaskContext,
    start_row: u64,
    cancelled: &AtomicBool,
    resources: &ResourceTracker,
) -> GpkgResult<RecordBatch> {
    let conn = open_read_only(&ctx.path, resources)?;
    let mut builder =
        ColumnarBatchBuilder::new(ctx.schema.clone(), ctx.query.defn(), ctx.batch_size);
    {
        let mut stmt = conn.prepare(&ctx.query.slice_sql())?;
        let mut rows = stmt.query(params![ctx.batch_size as i64, start_row as i64])?;
        while let Some(row) = rows.next()? {
            if cancelled.load(Ordering::Acquire) {
                return Err(GpkgError::new("Prefetch cancelled", ErrorKind::Cancelled));
            }
            if let Some(raw) = ctx.query.decode_row(row)? {
                builder.append(&raw)?;
            }
        }
    }
    // release the connection before handing the batch over
    drop(conn);
    builder.finish()
}

/// Multi-connection read-ahead over an unfiltered full scan.
///
/// Keeps up to `max_in_flight` [`PrefetchTask`]s in a FIFO; task *k* reads
/// the rows at positions `[k * batch_size, (k + 1) * batch_size)`. No task
/// is started at or beyond the row count snapshotted when the scan began.
pub(crate) struct PrefetchExporter {
    ctx: Arc<TaskContext>,
    resources: ResourceTracker,
    cancelled: Arc<AtomicBool>,
    tasks: VecDeque<PrefetchTask>,
    max_in_flight: usize,
    total_rows: u64,
    next_start: u64,
    stopped: bool,
}

impl PrefetchExporter {
    pub(crate) fn new(
        path: &Path,
        query: ScanQuery,
        schema: SchemaRef,
        batch_size: usize,
        max_in_flight: usize,
        total_rows: u64,
        resources: &ResourceTracker,
    ) -> PrefetchExporter {
        PrefetchExporter {
            ctx: Arc::new(TaskContext {
                path: path.to_path_buf(),
                query,
                schema,
                batch_size: batch_size.max(1),
            }),
            resources: resources.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            tasks: VecDeque::new(),
            max_in_flight: max_in_flight.max(1),
            total_rows,
            next_start: 0,
            stopped: false,
        }
    }

    fn fill_pipeline(&mut self) -> GpkgResult<()> {
        while !self.stopped
            && self.tasks.len() < self.max_in_flight
            && self.next_start < self.total_rows
        {
            let task =
                PrefetchTask::spawn(self.next_start, &self.ctx, &self.cancelled, &self.resources)?;
            self.tasks.push_back(task);
            self.next_start += self.ctx.batch_size as u64;
        }
        Ok(())
    }

    pub(crate) fn next_batch(&mut self) -> GpkgResult<Option<RecordBatch>> {
        if self.tasks.is_empty() {
            self.fill_pipeline()?;
        }
        let Some(task) = self.tasks.pop_front() else {
            return Ok(None);
        };
        let batch = match task.wait() {
            Ok(batch) => batch,
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        };
        if batch.num_rows() == 0 {
            self.cancel();
            return Ok(None);
        }
        if batch.num_rows() < self.ctx.batch_size {
            // the table shrank since the count snapshot
            self.stopped = true;
        }
        self.fill_pipeline()?;
        Ok(Some(batch))
    }

    /// Number of tasks started and not yet consumed.
    pub(crate) fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn cancel(&mut self) {
        self.stopped = true;
        self.cancelled.store(true, Ordering::Release);
        // dropping a task joins it
        self.tasks.clear();
    }
}

impl Drop for PrefetchExporter {
    fn drop(&mut self) {
        self.cancel();
    }
}
