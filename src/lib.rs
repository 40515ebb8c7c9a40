//! # Eventful - Embedded Event Store
//!
//! Eventful is an append-only event store for event-sourced applications,
//! built on SQLite. It provides:
//!
//! - **Streams per aggregate type**: one table per stream type, events keyed
//!   by aggregate and version
//! - **Optimistic concurrency**: a version that is already taken, or lower
//!   than the latest, is rejected
//! - **High-throughput writes**: group commit of everything queued while
//!   the previous batch was being written
//! - **Non-blocking persists**: `persist` returns a completion handle right
//!   away; await it or wait on it
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          EventStore                             │
//! │              (initialize, persist, events, close)               │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ bounded queue                   │
//!                 ▼                                 │
//! ┌───────────────────────────────────┐             │
//! │          Batch Writer             │             │
//! │  (single thread, owns write conn) │             │
//! │                                   │             │
//! │  drain ─► BEGIN IMMEDIATE         │             │
//! │           check + insert ...      │             │
//! │           COMMIT / ROLLBACK       │             │
//! └───────────────┬───────────────────┘             │
//!                 │                    read-only    │
//!                 ▼                    connection   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SQLite (WAL)                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: only the writer thread modifies the database
//! 2. **Unique versions**: `(aggregate_id, version)` is unique per stream
//! 3. **All-or-nothing batches**: a batch commits completely or not at all
//! 4. **Ordered history**: `events` returns an aggregate's events by
//!    ascending version
//! 5. **Nothing lost on close**: work accepted before `close` is finished
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventful::{Event, EventStore};
//! use uuid::Uuid;
//!
//! # async fn run() -> eventful::Result<()> {
//! let store = EventStore::open("events.db")?;
//! store.initialize("customer")?;
//!
//! let id = Uuid::new_v4();
//! store
//!     .persist("customer", Event::new("created", id, 1, b"{}".to_vec())?)
//!     .await?;
//!
//! for event in store.events("customer", id)? {
//!     println!("{} v{}", event.event_type(), event.version());
//! }
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for store operations.
pub mod error;

/// Events, versions and stream type names.
pub mod types;

/// SQLite DDL, per-stream SQL handles and database bootstrap.
pub mod schema;

/// Registered stream types and their SQL handles.
pub mod registry;

/// Store state machine.
pub mod lifecycle;

/// Batch writer with group commit.
///
/// One thread owns the read-write connection and drains a bounded queue in
/// batches. Each batch is a single transaction: it commits completely or is
/// rolled back completely, in which case the failing event reports its own
/// error and its batch-mates report [`Error::RetryBatch`].
pub mod writer;

/// Read operations on the read-only connection.
pub mod reader;

/// The [`EventStore`] facade and its configuration.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{EventStore, StoreConfig};
pub use error::{Error, Result};
pub use lifecycle::StoreState;
pub use types::{AggregateId, Event, StreamType, Version};
pub use writer::{PersistFuture, StatsSnapshot, WriterConfig};
