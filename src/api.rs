//! # Store API for Eventful
//!
//! [`EventStore`] is the public entry point. It ties together the pieces
//! that each own one concern:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           EventStore                             │
//! │                                                                  │
//! │   initialize ──┐        persist ──┐            events ──┐        │
//! │                ▼                  ▼                     ▼        │
//! │   ┌────────────────┐   ┌────────────────┐   ┌─────────────────┐  │
//! │   │ StreamRegistry │◄──│  WriterHandle  │   │ read-only conn  │  │
//! │   │ (RwLock<Map>)  │   │ (bounded queue)│   │ (Mutex)         │  │
//! │   └────────────────┘   └───────┬────────┘   └────────┬────────┘  │
//! └────────────────────────────────┼─────────────────────┼───────────┘
//!                                  ▼                     │
//!                      ┌──────────────────────┐          │
//!                      │  Dedicated OS Thread │          │
//!                      │  BatchWriter (owns   │          │
//!                      │  read-write conn)    │          │
//!                      └──────────┬───────────┘          │
//!                                 ▼                      ▼
//!                         ┌──────────────────────────────────┐
//!                         │           SQLite (WAL)           │
//!                         └──────────────────────────────────┘
//! ```
//!
//! ## The SQLite Challenge
//!
//! A rusqlite `Connection` is `!Sync`, so it can't be shared between threads
//! even behind an `Arc`. The writer connection is therefore moved onto the
//! writer thread and never leaves it; every write, including the DDL of
//! `initialize`, is a message to that thread. The read connection is
//! serialized behind a mutex.
//!
//! ## Lifecycle
//!
//! ```text
//! open ──► Running ──close──► Closing ──(writer drained)──► Closed
//! ```
//!
//! Work accepted before `close` is always finished: the writer drains the
//! queue before it stops. Work submitted after `close` began fails with
//! [`Error::StoreClosed`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, StoreState};
use crate::reader;
use crate::registry::StreamRegistry;
use crate::schema::Database;
use crate::types::{AggregateId, Event, StreamType, Version};
use crate::writer::{
    spawn_batch_writer, BatchWriter, PersistFuture, StatsSnapshot, WriterConfig, WriterHandle,
    WriterStats, WriterThread,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default time `close` waits for the writer to drain.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 30_000;

/// Default SQLite busy timeout for both connections.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Environment variable for [`WriterConfig::queue_capacity`].
pub const ENV_QUEUE_CAPACITY: &str = "EVENTFUL_QUEUE_CAPACITY";
/// Environment variable for [`WriterConfig::max_batch_size`].
pub const ENV_MAX_BATCH_SIZE: &str = "EVENTFUL_MAX_BATCH_SIZE";
/// Environment variable for [`WriterConfig::idle_wait`], in milliseconds.
pub const ENV_IDLE_WAIT_MS: &str = "EVENTFUL_IDLE_WAIT_MS";
/// Environment variable for [`StoreConfig::close_timeout`], in milliseconds.
pub const ENV_CLOSE_TIMEOUT_MS: &str = "EVENTFUL_CLOSE_TIMEOUT_MS";
/// Environment variable for [`StoreConfig::busy_timeout`], in milliseconds.
pub const ENV_BUSY_TIMEOUT_MS: &str = "EVENTFUL_BUSY_TIMEOUT_MS";

/// Configuration for an [`EventStore`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use eventful::{StoreConfig, WriterConfig};
///
/// let config = StoreConfig {
///     writer: WriterConfig {
///         max_batch_size: 512,
///         ..WriterConfig::default()
///     },
///     close_timeout: Duration::from_secs(5),
///     ..StoreConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Queue and batching settings.
    pub writer: WriterConfig,

    /// How long `close` waits for the writer to finish queued work.
    pub close_timeout: Duration,

    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl StoreConfig {
    /// Checks the configuration for values the store can't run with.
    pub fn validate(&self) -> Result<()> {
        self.writer.validate()
    }

    /// Reads overrides from the `EVENTFUL_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// `Error::Config` if a variable is set but can't be parsed, or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`StoreConfig::from_env`], with a custom variable source.
    ///
    /// If only the queue capacity is given, the maximum batch size follows
    /// it, as it does by default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_QUEUE_CAPACITY)? {
            config.writer.queue_capacity = capacity;
            config.writer.max_batch_size = capacity;
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_MAX_BATCH_SIZE)? {
            config.writer.max_batch_size = size;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_IDLE_WAIT_MS)? {
            config.writer.idle_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CLOSE_TIMEOUT_MS)? {
            config.close_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BUSY_TIMEOUT_MS)? {
            config.busy_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}

// =============================================================================
// Event Store
// =============================================================================

/// An event store backed by one SQLite file.
///
/// # Thread Safety
///
/// `EventStore` is `Send + Sync`; share it with `Arc` and call it from as
/// many threads or tasks as you like. All writes funnel through one writer
/// thread; reads share one read-only connection.
///
/// # Blocking
///
/// The methods are synchronous. `persist` only blocks while the queue is
/// full; `initialize` blocks until its DDL committed; `events` runs a query.
/// The returned [`PersistFuture`] can be awaited or waited on.
///
/// # Example
///
/// ```rust,no_run
/// use eventful::{Event, EventStore};
/// use uuid::Uuid;
///
/// # fn main() -> eventful::Result<()> {
/// let store = EventStore::open("events.db")?;
/// store.initialize("customer")?;
///
/// let customer = Uuid::new_v4();
/// let created = Event::new("created", customer, 1, br#"{"name":"ACME"}"#.to_vec())?;
/// store.persist("customer", created).wait()?;
///
/// let history = store.events("customer", customer)?;
/// assert_eq!(history.len(), 1);
///
/// store.close();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EventStore {
    path: PathBuf,
    config: StoreConfig,
    lifecycle: Arc<Lifecycle>,
    registry: StreamRegistry,
    writer: WriterHandle,
    writer_thread: Mutex<Option<WriterThread>>,
    read_conn: Mutex<Option<Connection>>,
    stats: Arc<WriterStats>,
}

impl EventStore {
    /// Opens or creates a store at the given path with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens or creates a store with explicit settings.
    ///
    /// Streams created by earlier runs are loaded back, so `persist` and
    /// `events` work for them right away.
    ///
    /// # Errors
    ///
    /// - `Error::Config` for an invalid configuration
    /// - `Error::Persistence` if the file can't be opened
    /// - `Error::Schema` if the file was created by an incompatible version
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let db = Database::open(&path, config.busy_timeout)?;
        let registry = StreamRegistry::with_streams(db.streams()?);

        let lifecycle = Arc::new(Lifecycle::new());
        let stats = Arc::new(WriterStats::default());
        let batch_writer = BatchWriter::new(
            db.into_connection(),
            config.writer.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&stats),
            &registry.schemas(),
        )?;

        // The writer already switched the file to WAL, which the read-only
        // connection can't do by itself.
        let read_conn = reader::open_read_connection(
            &path,
            config.busy_timeout,
            config.writer.statement_cache_capacity,
        )?;

        // Running before the thread starts, or an idle writer would see a
        // non-running store and exit.
        lifecycle.set(StoreState::Running);
        let (writer, writer_thread) = match spawn_batch_writer(batch_writer) {
            Ok(spawned) => spawned,
            Err(e) => {
                lifecycle.set(StoreState::Closed);
                return Err(e);
            }
        };

        info!(
            path = %path.display(),
            streams = registry.stream_types().len(),
            "opened event store"
        );

        Ok(Self {
            path,
            config,
            lifecycle,
            registry,
            writer,
            writer_thread: Mutex::new(Some(writer_thread)),
            read_conn: Mutex::new(Some(read_conn)),
            stats,
        })
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Creates a new stream type: its table, its unique
    /// `(aggregate_id, version)` index, and its prepared handles.
    ///
    /// The structural change is committed before this returns.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidStreamType` if the name isn't a plain identifier
    /// - `Error::AlreadyExists` if the stream type (or any table of that
    ///   name) exists; nothing changes in that case
    /// - `Error::StoreClosed` if the store is closing or closed
    pub fn initialize(&self, stream_type: &str) -> Result<()> {
        if !self.lifecycle.is_running() {
            return Err(Error::StoreClosed);
        }

        let stream_type = StreamType::new(stream_type)?;
        if self.registry.contains(stream_type.as_str()) {
            return Err(Error::AlreadyExists {
                stream_type: stream_type.to_string(),
            });
        }

        let schema = self.writer.create_stream(stream_type)?;
        self.registry.register(schema)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queues an event for durable storage and returns its completion handle.
    ///
    /// Never waits for the commit. Blocks only while the queue is at
    /// capacity.
    ///
    /// # Outcomes
    ///
    /// The handle resolves to:
    /// - `Ok(())` once the event's batch committed
    /// - `Error::InconsistentVersion` if the aggregate already has a higher
    ///   version
    /// - `Error::DuplicateVersion` if the version is already taken
    /// - `Error::RetryBatch` if another event of the same batch failed
    /// - `Error::Persistence` / `Error::CommitFailed` on storage failures
    /// - `Error::UnknownStream` / `Error::StoreClosed` immediately, without
    ///   queueing anything
    pub fn persist(&self, stream_type: &str, event: Event) -> PersistFuture {
        if !self.lifecycle.is_running() {
            return PersistFuture::failed(Error::StoreClosed);
        }

        match self.registry.resolve(stream_type) {
            Ok(schema) => self.writer.enqueue(schema, event),
            Err(e) => PersistFuture::failed(e),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns every committed event of one aggregate, ascending by version.
    ///
    /// Events still in the queue, or in a batch that hasn't committed, are
    /// not included. An aggregate without events yields an empty vector.
    pub fn events(&self, stream_type: &str, aggregate_id: AggregateId) -> Result<Vec<Event>> {
        let schema = self.registry.resolve(stream_type)?;
        self.with_read_connection(|conn| reader::read_events(conn, &schema, aggregate_id))
    }

    /// Returns the highest committed version of an aggregate, if any.
    pub fn current_version(
        &self,
        stream_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<Version>> {
        let schema = self.registry.resolve(stream_type)?;
        self.with_read_connection(|conn| reader::current_version(conn, &schema, aggregate_id))
    }

    fn with_read_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.read_conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::StoreClosed),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Registered stream types, sorted by name.
    pub fn stream_types(&self) -> Vec<String> {
        self.registry.stream_types()
    }

    /// Where the store is in its lifecycle.
    pub fn state(&self) -> StoreState {
        self.lifecycle.state()
    }

    /// Writer counters since the store was opened.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The database file this store was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops accepting work, lets the writer finish what is queued, and
    /// releases both connections.
    ///
    /// Waits at most `close_timeout` for the writer. If it is still busy
    /// after that, it is left to finish in the background and the store is
    /// marked closed anyway.
    ///
    /// Calling `close` again (or dropping the store afterwards) does nothing.
    pub fn close(&self) {
        if !self
            .lifecycle
            .transition(StoreState::Running, StoreState::Closing)
        {
            return;
        }
        info!(path = %self.path.display(), "closing event store");

        // Queued behind any outstanding work, so everything before it drains.
        self.writer.request_shutdown();

        let writer_thread = self
            .writer_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer_thread) = writer_thread {
            if !writer_thread.join(self.config.close_timeout) {
                warn!(
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "batch writer didn't stop within the close timeout"
                );
            }
        }

        self.read_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.lifecycle.set(StoreState::Closed);
        info!(path = %self.path.display(), "closed event store");
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
