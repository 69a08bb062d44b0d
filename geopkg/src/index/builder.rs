use super::entry::EntryBatch;
use super::queue::BoundedHandoffQueue;
use super::sink::IndexSink;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::store::ResourceTracker;
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lifecycle of the background spatial index builder.
///
/// ```text
/// Idle -> Starting -> Running -> Finished -> Idle
///                            \-> Errored  -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuilderState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Finished = 3,
    Errored = 4,
}

impl BuilderState {
    fn from_u8(value: u8) -> BuilderState {
        match value {
            1 => BuilderState::Starting,
            2 => BuilderState::Running,
            3 => BuilderState::Finished,
            4 => BuilderState::Errored,
            _ => BuilderState::Idle,
        }
    }
}

impl Display for BuilderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuilderState::Idle => "idle",
            BuilderState::Starting => "starting",
            BuilderState::Running => "running",
            BuilderState::Finished => "finished",
            BuilderState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// A batch the builder could not write, with the error it hit.
///
/// `batch` is `None` when the builder failed before popping anything, e.g.
/// because its connection could not be opened.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub batch: Option<EntryBatch>,
    pub error: GpkgError,
}

/// State shared between the writer and the builder thread.
pub(crate) struct SharedBuildState {
    state: AtomicU8,
    errored: AtomicBool,
    cancelled: AtomicBool,
    batches_written: AtomicU64,
    entries_written: AtomicU64,
    failure: Mutex<Option<BuildFailure>>,
}

impl SharedBuildState {
    fn new() -> SharedBuildState {
        SharedBuildState {
            state: AtomicU8::new(BuilderState::Idle as u8),
            errored: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            batches_written: AtomicU64::new(0),
            entries_written: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    fn set_state(&self, state: BuilderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> BuilderState {
        BuilderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn record_failure(&self, batch: Option<EntryBatch>, error: GpkgError) {
        *self.failure.lock() = Some(BuildFailure { batch, error });
        self.errored.store(true, Ordering::Release);
        self.set_state(BuilderState::Errored);
    }
}

/// What joining a builder produced.
pub(crate) enum BuildOutcome {
    /// Every queued batch was written; the sink is ready to merge.
    Finished {
        sink: Box<dyn IndexSink>,
        batches: u64,
        entries: u64,
    },
    /// Batches before `failure` were written; the rest was not.
    Errored {
        sink: Box<dyn IndexSink>,
        failure: BuildFailure,
        batches: u64,
    },
    /// The worker died without reporting; nothing it wrote can be trusted.
    Panicked,
}

/// Background worker draining a [`BoundedHandoffQueue`] of entry batches
/// into an [`IndexSink`].
///
/// At most one builder exists per layer. It is joined by
/// [`finish`](Self::finish) at commit time or by [`cancel`](Self::cancel) at
/// rollback; dropping a builder cancels it.
pub(crate) struct SpatialIndexBuilder {
    queue: Arc<BoundedHandoffQueue<EntryBatch>>,
    shared: Arc<SharedBuildState>,
    handle: Option<JoinHandle<Box<dyn IndexSink>>>,
    name: String,
}

impl SpatialIndexBuilder {
    /// Spawns the builder thread. The state is `Starting` until the thread
    /// has opened its sink.
    pub(crate) fn start(
        name: &str,
        queue: Arc<BoundedHandoffQueue<EntryBatch>>,
        sink: Box<dyn IndexSink>,
        resources: &ResourceTracker,
    ) -> GpkgResult<SpatialIndexBuilder> {
        let shared = Arc::new(SharedBuildState::new());
        shared.set_state(BuilderState::Starting);

        let worker_guard = resources.worker_guard();
        let thread_queue = queue.clone();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rtree-{}", name))
            .spawn(move || {
                let _worker = worker_guard;
                run(sink, &thread_queue, &thread_shared)
            })
            .map_err(|e| {
                GpkgError::new(
                    &format!("Failed to spawn index builder thread: {}", e),
                    ErrorKind::InternalError,
                )
            })?;

        log::debug!("Started background R-tree builder for {}", name);
        Ok(SpatialIndexBuilder {
            queue,
            shared,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    pub(crate) fn state(&self) -> BuilderState {
        self.shared.state()
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.shared.errored.load(Ordering::Acquire)
    }

    pub(crate) fn batches_written(&self) -> u64 {
        self.shared.batches_written.load(Ordering::Acquire)
    }

    /// Closes the queue and waits for the builder to drain it.
    pub(crate) fn finish(mut self) -> BuildOutcome {
        self.queue.close();
        let Some(handle) = self.handle.take() else {
            return BuildOutcome::Panicked;
        };
        let joined = handle.join();
        let batches = self.batches_written();
        match joined {
            Ok(sink) => match self.shared.failure.lock().take() {
                Some(failure) => {
                    log::warn!(
                        "Background R-tree builder for {} failed after {} batches: {}",
                        self.name,
                        batches,
                        failure.error
                    );
                    BuildOutcome::Errored {
                        sink,
                        failure,
                        batches,
                    }
                }
                None => {
                    log::debug!(
                        "Background R-tree builder for {} finished {} batches",
                        self.name,
                        batches
                    );
                    BuildOutcome::Finished {
                        sink,
                        batches,
                        entries: self.shared.entries_written.load(Ordering::Acquire),
                    }
                }
            },
            Err(_) => {
                log::error!("Background R-tree builder for {} panicked", self.name);
                self.shared.set_state(BuilderState::Errored);
                BuildOutcome::Panicked
            }
        }
    }

    /// Stops the builder and discards everything it wrote.
    pub(crate) fn cancel(mut self) {
        self.cancel_and_join();
    }

    fn cancel_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.cancelled.store(true, Ordering::Release);
        self.queue.close();
        match handle.join() {
            Ok(mut sink) => sink.discard(),
            Err(_) => log::error!("Background R-tree builder for {} panicked", self.name),
        }
        self.shared.set_state(BuilderState::Idle);
        log::debug!("Cancelled background R-tree builder for {}", self.name);
    }
}

impl Drop for SpatialIndexBuilder {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

fn run(
    mut sink: Box<dyn IndexSink>,
    queue: &BoundedHandoffQueue<EntryBatch>,
    shared: &SharedBuildState,
) -> Box<dyn IndexSink> {
    if let Err(error) = sink.open() {
        shared.record_failure(None, error);
        queue.close();
        return sink;
    }
    shared.set_state(BuilderState::Running);

    while let Some(batch) = queue.pop() {
        if shared.cancelled.load(Ordering::Acquire) {
            return sink;
        }
        match sink.write_batch(&batch) {
            Ok(()) => {
                shared.batches_written.fetch_add(1, Ordering::AcqRel);
                shared
                    .entries_written
                    .fetch_add(batch.len() as u64, Ordering::AcqRel);
            }
            Err(error) => {
                shared.record_failure(Some(batch), error);
                // producers see Closed and index synchronously from now on
                queue.close();
                return sink;
            }
        }
    }

    if shared.cancelled.load(Ordering::Acquire) {
        return sink;
    }
    match sink.finish() {
        Ok(()) => shared.set_state(BuilderState::Finished),
        Err(error) => shared.record_failure(None, error),
    }
    sink
}
