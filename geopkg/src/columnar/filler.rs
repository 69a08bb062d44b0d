use super::batch::ColumnarBatchBuilder;
use super::BatchLimits;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::layer::ScanQuery;
use crate::store::{ResourceTracker, SecondaryConnection};
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// What the filler hands to the consumer through the single slot.
pub(crate) enum FillOutcome {
    Ready(RecordBatch),
    Error(GpkgError),
    Done,
}

/// Progress of the filler, shared with the consumer.
#[derive(Default)]
pub(crate) struct BatchFillState {
    slot: Option<FillOutcome>,
    rows_filled: u64,
    /// the filler thread has exited
    is_finished: bool,
    error_occurred: bool,
}

struct FillShared {
    state: Mutex<BatchFillState>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl FillShared {
    /// Places `outcome` in the slot once the consumer has emptied it.
    /// Returns false if the scan was cancelled meanwhile.
    fn publish(&self, outcome: FillOutcome) -> bool {
        let mut state = self.state.lock();
        while state.slot.is_some() && !self.cancelled.load(Ordering::Acquire) {
            self.changed.wait(&mut state);
        }
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        match &outcome {
            FillOutcome::Ready(batch) => state.rows_filled += batch.num_rows() as u64,
            FillOutcome::Error(_) => state.error_occurred = true,
            FillOutcome::Done => {}
        }
        state.slot = Some(outcome);
        drop(state);
        self.changed.notify_all();
        true
    }
}

/// Marks the filler finished however its thread exits.
struct ExitSignal(Arc<FillShared>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.0.state.lock().is_finished = true;
        self.0.changed.notify_all();
    }
}

/// One perpetual background thread filling successive batches from a single
/// cursor, one batch ahead of the consumer.
pub(crate) struct SingleFillerExporter {
    shared: Arc<FillShared>,
    handle: Option<JoinHandle<()>>,
    done: bool,
}

impl SingleFillerExporter {
    /// Starts the filler on `conn`, which the thread owns from here on.
    pub(crate) fn start(
        conn: SecondaryConnection,
        query: ScanQuery,
        schema: SchemaRef,
        limits: BatchLimits,
        resources: &ResourceTracker,
    ) -> GpkgResult<SingleFillerExporter> {
        let shared = Arc::new(FillShared {
            state: Mutex::new(BatchFillState::default()),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let worker_guard = resources.worker_guard();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("arrow-fill-{}", query.defn().table_name()))
            .spawn(move || {
                let _worker = worker_guard;
                let _exit = ExitSignal(thread_shared.clone());
                if let Err(e) = fill_loop(&conn, &query, &schema, limits, &thread_shared) {
                    log::debug!("Columnar filler stopped on error: {}", e);
                    thread_shared.publish(FillOutcome::Error(e));
                }
                // connection closes before the worker guard is released
                drop(conn);
            })
            .map_err(|e| {
                GpkgError::new(
                    &format!("Failed to spawn columnar filler thread: {}", e),
                    ErrorKind::InternalError,
                )
            })?;
        Ok(SingleFillerExporter {
            shared,
            handle: Some(handle),
            done: false,
        })
    }

    /// Waits for the next batch.
    pub(crate) fn next_batch(&mut self) -> GpkgResult<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }
        let mut state = self.shared.state.lock();
        while state.slot.is_none() && !state.is_finished && !state.error_occurred {
            self.shared.changed.wait(&mut state);
        }
        let outcome = state.slot.take();
        drop(state);
        self.shared.changed.notify_all();

        match outcome {
            Some(FillOutcome::Ready(batch)) => Ok(Some(batch)),
            Some(FillOutcome::Done) => {
                let rows = self.shared.state.lock().rows_filled;
                log::debug!("Columnar filler finished after {} rows", rows);
                self.join();
                Ok(None)
            }
            Some(FillOutcome::Error(e)) => {
                self.join();
                Err(e)
            }
            None => {
                self.join();
                Err(GpkgError::new(
                    "Columnar filler exited without a result",
                    ErrorKind::InternalError,
                ))
            }
        }
    }

    pub(crate) fn cancel(&mut self) {
        // set under the lock so a filler about to wait cannot miss it
        let state = self.shared.state.lock();
        self.shared.cancelled.store(true, Ordering::Release);
        drop(state);
        self.shared.changed.notify_all();
        self.join();
    }

    fn join(&mut self) {
        self.done = true;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Columnar filler thread panicked");
            }
        }
    }
}

impl Drop for SingleFillerExporter {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn fill_loop(
    conn: &SecondaryConnection,
    query: &ScanQuery,
    schema: &SchemaRef,
    limits: BatchLimits,
    shared: &FillShared,
) -> GpkgResult<()> {
    let mut stmt = conn.prepare(&query.cursor_sql())?;
    let mut rows = stmt.query([])?;
    let mut builder = ColumnarBatchBuilder::new(schema.clone(), query.defn(), limits.max_rows);
    loop {
        let mut exhausted = false;
        while builder.len() < limits.max_rows && builder.approx_bytes() < limits.max_bytes {
            if shared.cancelled.load(Ordering::Acquire) {
                return Ok(());
            }
            match rows.next()? {
                Some(row) => {
                    if let Some(raw) = query.decode_row(row)? {
                        builder.append(&raw)?;
                    }
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if !builder.is_empty() && !shared.publish(FillOutcome::Ready(builder.finish()?)) {
            return Ok(());
        }
        if exhausted {
            shared.publish(FillOutcome::Done);
            return Ok(());
        }
    }
}
