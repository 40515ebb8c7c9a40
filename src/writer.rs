//! # Batch Writer with Group Commit
//!
//! This module implements the write side of the store: a bounded queue that
//! any number of callers push into, and a single dedicated thread that owns
//! the writable SQLite connection and drains the queue in batches.
//!
//! ## Why Group Commit?
//!
//! SQLite's write throughput is bounded by transaction commits. Committing
//! every event on its own means one journal sync per event; committing
//! everything that piled up while the previous batch was being written
//! amortizes that cost across the whole batch:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ e1 → BEGIN → COMMIT      │     │ BEGIN IMMEDIATE          │
//! │ e2 → BEGIN → COMMIT      │     │   check + insert e1      │
//! │ e3 → BEGIN → COMMIT      │     │   check + insert e2      │
//! │ ...                      │     │   check + insert e3      │
//! │ 100 commits              │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 commit                 │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## All-or-Nothing Batches
//!
//! A batch is one transaction and one unit of failure:
//!
//! - Items are applied in dequeue (FIFO) order
//! - The first item that fails its check-and-insert step stops the batch
//! - On failure the whole transaction is rolled back; the failed item gets
//!   its specific error and **every other item** gets [`Error::RetryBatch`],
//!   including the ones after it that were never attempted
//!
//! So one bad event forces its batch-mates to be re-submitted, even if they
//! were individually valid. That is the price of a single shared transaction.
//!
//! ## Check-and-Insert
//!
//! ```text
//!   max = SELECT MAX(version) WHERE aggregate_id = ?
//!   version < max ──────────────► InconsistentVersion
//!   INSERT ... ──── UNIQUE ─────► DuplicateVersion
//!              ──── other ──────► Persistence
//!              ──── ok ─────────► next item
//! ```
//!
//! The max-version read only produces the more precise diagnosis. The unique
//! index on `(aggregate_id, version)` is what actually keeps duplicates out;
//! batches can't race each other because there is only one writer.
//!
//! ## Backpressure
//!
//! The queue is a `std::sync::mpsc::sync_channel`. When it is full,
//! `persist` blocks until the writer frees a slot. Nothing is ever dropped.
//!
//! ## Invariants
//!
//! - Only the writer thread touches the writable connection
//! - Batch N is committed or rolled back before batch N+1 begins
//! - Every enqueued item's completion handle is resolved exactly once
//! - A failing item never stops the writer; only shutdown does

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Connection, TransactionBehavior};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::schema::{self, StreamSchema};
use crate::types::{Event, StreamType};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity of the work queue.
///
/// Large enough to absorb bursts from many producers while the writer is
/// busy committing, small enough to bound memory.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16384 * 2;

/// Default time the writer waits for work before re-checking whether it
/// should stop.
pub const DEFAULT_IDLE_WAIT_MS: u64 = 10;

/// Default size of the writer connection's prepared-statement cache.
///
/// Each stream keeps two statements there (insert, max version).
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

/// Configuration for the batch writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum number of queued requests before `persist` blocks.
    pub queue_capacity: usize,

    /// Maximum number of items drained into one batch.
    pub max_batch_size: usize,

    /// How long the writer blocks waiting for work when the queue is empty.
    pub idle_wait: Duration,

    /// Prepared-statement cache size for the writer connection.
    pub statement_cache_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch_size: DEFAULT_QUEUE_CAPACITY,
            idle_wait: Duration::from_millis(DEFAULT_IDLE_WAIT_MS),
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }
}

impl WriterConfig {
    /// Checks that every capacity is at least 1.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if self.statement_cache_capacity == 0 {
            return Err(Error::Config(
                "statement_cache_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Completion Handle
// =============================================================================

/// The pending outcome of one `persist` call.
///
/// Resolves exactly once, to `Ok(())` when the event's batch committed, or to
/// the error that kept it out of the store.
///
/// # Waiting
///
/// - From async code: `.await` it
/// - From blocking code: [`PersistFuture::wait`]
/// - Polling: [`PersistFuture::try_result`]
///
/// # Example
///
/// ```rust,ignore
/// let pending = store.persist("customer", event);
/// match pending.await {
///     Ok(()) => println!("durable"),
///     Err(e) if e.is_retryable() => println!("co-batched with a failure, resubmit"),
///     Err(e) => return Err(e),
/// }
/// ```
#[must_use = "the outcome of a persist is only reported through its future"]
#[derive(Debug)]
pub struct PersistFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl PersistFuture {
    fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    /// A handle that is already resolved with `error`.
    pub(crate) fn failed(error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    /// Blocks the current thread until the outcome is known.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous runtime; `.await` the
    /// future there instead.
    pub fn wait(self) -> Result<()> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(Error::StoreClosed))
    }

    /// Returns the outcome if it is already known, without blocking.
    ///
    /// Yields `Some` at most once with the real outcome; the handle is spent
    /// afterwards.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::StoreClosed)),
        }
    }
}

impl Future for PersistFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the writer went away without resolving us.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::StoreClosed)))
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// One queued append, owned by the writer once enqueued.
#[derive(Debug)]
pub(crate) struct WorkItem {
    schema: Arc<StreamSchema>,
    event: Event,
    completion: oneshot::Sender<Result<()>>,
}

impl WorkItem {
    fn complete(self, result: Result<()>) {
        // The caller may have dropped its handle; that's fine.
        let _ = self.completion.send(result);
    }
}

/// A request sent to the writer thread.
#[derive(Debug)]
pub(crate) enum WriteRequest {
    /// Append one event (batched).
    Append(WorkItem),

    /// Create a stream's table and index. Runs between batches and commits
    /// on its own.
    CreateStream {
        stream_type: StreamType,
        reply: SyncSender<Result<Arc<StreamSchema>>>,
    },

    /// Drain whatever is queued, then stop.
    Shutdown,
}

/// Why a batch didn't commit.
enum BatchFailure {
    /// Item `index` failed its check-and-insert step.
    Item { index: usize, error: Error },
    /// BEGIN or COMMIT itself failed.
    Commit(String),
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters maintained by the writer thread.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    batches_committed: AtomicU64,
    batches_rolled_back: AtomicU64,
    events_committed: AtomicU64,
    events_failed: AtomicU64,
    events_retried: AtomicU64,
}

impl WriterStats {
    fn record_commit(&self, events: usize) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.events_committed.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn record_rollback(&self, failed: usize, retried: usize) {
        self.batches_rolled_back.fetch_add(1, Ordering::Relaxed);
        self.events_failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.events_retried.fetch_add(retried as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_rolled_back: self.batches_rolled_back.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the writer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Batches that committed.
    pub batches_committed: u64,
    /// Batches that were rolled back (item failure or commit failure).
    pub batches_rolled_back: u64,
    /// Events made durable.
    pub events_committed: u64,
    /// Events resolved with their own specific error.
    pub events_failed: u64,
    /// Events resolved with `RetryBatch` because a batch-mate failed.
    pub events_retried: u64,
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The writer that owns the read-write connection.
///
/// Runs on a dedicated thread; everything else talks to it through a
/// [`WriterHandle`].
pub(crate) struct BatchWriter {
    conn: Connection,
    config: WriterConfig,
    lifecycle: Arc<Lifecycle>,
    stats: Arc<WriterStats>,
}

impl BatchWriter {
    /// Creates a writer and prepares the handles of already-known streams.
    pub(crate) fn new(
        conn: Connection,
        config: WriterConfig,
        lifecycle: Arc<Lifecycle>,
        stats: Arc<WriterStats>,
        streams: &[Arc<StreamSchema>],
    ) -> Result<Self> {
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        for schema in streams {
            schema.prepare_writer_handles(&conn)?;
        }

        Ok(Self {
            conn,
            config,
            lifecycle,
            stats,
        })
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes one batch and resolves every item's completion handle.
    fn execute_batch(&mut self, mut items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }

        let size = items.len();
        debug!(batch_size = size, "processing work items");

        match self.apply_batch(&items) {
            Ok(()) => {
                self.stats.record_commit(size);
                for item in items {
                    item.complete(Ok(()));
                }
            }
            Err(BatchFailure::Item { index, error }) => {
                warn!(
                    batch_size = size,
                    failed_index = index,
                    error = %error,
                    "rolled back batch"
                );
                self.stats.record_rollback(1, size - 1);

                let failed = items.remove(index);
                failed.complete(Err(error));
                for item in items {
                    item.complete(Err(Error::RetryBatch));
                }
            }
            Err(BatchFailure::Commit(reason)) => {
                error!(batch_size = size, reason = %reason, "batch commit failed");
                self.stats.record_rollback(size, 0);

                for item in items {
                    item.complete(Err(Error::CommitFailed(reason.clone())));
                }
            }
        }
    }

    /// Applies a batch inside one IMMEDIATE transaction.
    ///
    /// Stops at the first failing item and rolls everything back.
    fn apply_batch(&mut self, items: &[WorkItem]) -> std::result::Result<(), BatchFailure> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| BatchFailure::Commit(format!("couldn't begin transaction: {e}")))?;

        for (index, item) in items.iter().enumerate() {
            if let Err(error) = check_and_insert(&tx, item) {
                if let Err(e) = tx.rollback() {
                    error!(error = %e, "rollback failed");
                }
                return Err(BatchFailure::Item { index, error });
            }
        }

        // A failed COMMIT leaves the transaction open; dropping it rolls back.
        tx.commit()
            .map_err(|e| BatchFailure::Commit(format!("couldn't commit transaction: {e}")))
    }

    fn create_stream(&mut self, stream_type: StreamType) -> Result<Arc<StreamSchema>> {
        let schema = schema::create_stream(&mut self.conn, stream_type)?;
        info!(stream_type = %schema.stream_type(), "created stream");
        Ok(Arc::new(schema))
    }

    // =========================================================================
    // Writer Loop
    // =========================================================================

    /// Runs until shutdown, draining the queue in batches.
    ///
    /// Keeps going while the store is running **or** work is still queued,
    /// so `close` never loses accepted items.
    fn run(mut self, rx: Receiver<WriteRequest>) {
        debug!("batch writer started");
        let mut draining = false;

        loop {
            // Block for the first request instead of spinning on an empty
            // queue; the timeout is only there to notice a close.
            let first = match rx.recv_timeout(self.config.idle_wait) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    if self.lifecycle.is_running() && !draining {
                        continue;
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // Drain everything currently available into one batch.
            let mut batch = Vec::new();
            let mut exhausted = false;
            let mut next = first;

            loop {
                match next {
                    WriteRequest::Append(item) => batch.push(item),
                    WriteRequest::CreateStream { stream_type, reply } => {
                        // Appends queued before the DDL go first.
                        self.execute_batch(std::mem::take(&mut batch));
                        let _ = reply.send(self.create_stream(stream_type));
                    }
                    WriteRequest::Shutdown => draining = true,
                }

                if batch.len() >= self.config.max_batch_size {
                    break;
                }
                match rx.try_recv() {
                    Ok(request) => next = request,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                        exhausted = true;
                        break;
                    }
                }
            }

            self.execute_batch(batch);

            if draining && exhausted {
                break;
            }
        }

        debug!("batch writer stopped");
    }
}

/// Checks one item against the committed state and inserts it.
fn check_and_insert(conn: &Connection, item: &WorkItem) -> Result<()> {
    let schema = &item.schema;
    let event = &item.event;
    let aggregate_id = event.aggregate_id().to_string();

    let max_version: Option<i64> = conn
        .prepare_cached(&schema.max_version_sql)?
        .query_row([&aggregate_id], |row| row.get(0))?;

    if let Some(max_version) = max_version {
        if event.version().to_sql() < max_version {
            return Err(Error::InconsistentVersion {
                stream_type: schema.stream_type().to_string(),
                aggregate_id: event.aggregate_id(),
                version: event.version().as_raw(),
            });
        }
    }

    let inserted = conn.prepare_cached(&schema.insert_sql)?.execute(params![
        event.id().to_string(),
        event.event_type(),
        aggregate_id,
        event.version().to_sql(),
        event.payload(),
    ]);

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(Error::DuplicateVersion {
            stream_type: schema.stream_type().to_string(),
            aggregate_id: event.aggregate_id(),
            version: event.version().as_raw(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// True for a violation of a `UNIQUE` index.
///
/// A clash on the `id` primary key reports `SQLITE_CONSTRAINT_PRIMARYKEY`
/// instead, so a reused event id is a persistence failure, not a duplicate
/// version.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error(),
        Some(e) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Sending side of the writer's queue.
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    tx: SyncSender<WriteRequest>,
}

impl WriterHandle {
    /// Queues an append, blocking while the queue is full.
    pub(crate) fn enqueue(&self, schema: Arc<StreamSchema>, event: Event) -> PersistFuture {
        let (completion, rx) = oneshot::channel();
        let item = WorkItem {
            schema,
            event,
            completion,
        };

        match self.tx.send(WriteRequest::Append(item)) {
            Ok(()) => PersistFuture::pending(rx),
            // Receiver is gone: the writer already stopped.
            Err(_) => PersistFuture::failed(Error::StoreClosed),
        }
    }

    /// Asks the writer to create a stream and waits for the outcome.
    pub(crate) fn create_stream(&self, stream_type: StreamType) -> Result<Arc<StreamSchema>> {
        let (reply, reply_rx) = mpsc::sync_channel(1);

        self.tx
            .send(WriteRequest::CreateStream { stream_type, reply })
            .map_err(|_| Error::StoreClosed)?;

        reply_rx.recv().map_err(|_| Error::StoreClosed)?
    }

    /// Wakes the writer so it drains and stops without waiting out an idle
    /// period.
    ///
    /// Best effort: if the queue is full the writer notices the closing state
    /// once it has worked through the backlog.
    pub(crate) fn request_shutdown(&self) {
        let _ = self.tx.try_send(WriteRequest::Shutdown);
    }
}

/// Join side of the writer thread.
#[derive(Debug)]
pub(crate) struct WriterThread {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl WriterThread {
    /// Waits up to `timeout` for the writer to finish.
    ///
    /// Returns false if it is still running; the thread is then left to
    /// finish on its own.
    pub(crate) fn join(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    error!("batch writer thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Spawns the writer on a dedicated thread.
pub(crate) fn spawn_batch_writer(writer: BatchWriter) -> Result<(WriterHandle, WriterThread)> {
    let (tx, rx) = mpsc::sync_channel(writer.config.queue_capacity);
    let (done_tx, done_rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("eventful-batch-writer".to_string())
        .spawn(move || {
            writer.run(rx);
            let _ = done_tx.send(());
        })?;

    Ok((
        WriterHandle { tx },
        WriterThread {
            handle,
            done: done_rx,
        },
    ))
}

// =============================================================================
// Tests
// =============================================================================
