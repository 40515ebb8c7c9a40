//! # Error Handling for Eventful
//!
//! This module defines the error types used throughout the store. A single
//! error enum ([`Error`]) covers every failure mode, so callers can match on
//! one type whether the failure came back synchronously (`initialize`,
//! `events`) or through a [`PersistFuture`](crate::PersistFuture).
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Schema | `AlreadyExists`, `UnknownStream`, `InvalidStreamType` | Fix the caller |
//! | Concurrency | `InconsistentVersion`, `DuplicateVersion` | Reload aggregate, re-decide |
//! | Batch | `RetryBatch` | Re-submit the same event |
//! | Lifecycle | `StoreClosed` | Stop using the handle |
//! | Internal | `Persistence`, `CommitFailed`, `Schema`, `Io` | Log and investigate |
//!
//! `InvalidEvent` and `InvalidCommand` are raised by the code that builds
//! events (aggregate logic), never by the store itself.

use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in store operations.
///
/// # Example
///
/// ```rust,ignore
/// use eventful::{Error, EventStore};
///
/// match store.persist("customer", event).await {
///     Ok(()) => {}
///     Err(Error::RetryBatch) => { /* re-submit */ }
///     Err(Error::DuplicateVersion { .. }) => { /* reload and re-decide */ }
///     Err(other) => return Err(other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Schema Errors (synchronous)
    // =========================================================================

    /// `initialize` was called for a stream type that already has a table.
    ///
    /// No structural change is made when this is returned.
    #[error("stream type '{stream_type}' already exists")]
    AlreadyExists {
        /// The stream type that was already initialized
        stream_type: String,
    },

    /// The operation referenced a stream type that was never initialized.
    #[error("stream type '{stream_type}' doesn't exist")]
    UnknownStream {
        /// The unknown stream type
        stream_type: String,
    },

    /// The stream type can't be used as a table name.
    ///
    /// Stream types become SQLite identifiers, so only a conservative
    /// character set is accepted.
    #[error("invalid stream type '{stream_type}': {reason}")]
    InvalidStreamType {
        /// The rejected name
        stream_type: String,
        /// Why it was rejected
        reason: String,
    },

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The store is closing or closed; no new work is accepted.
    #[error("store is stopped already")]
    StoreClosed,

    // =========================================================================
    // Optimistic Concurrency Errors (asynchronous, via the completion handle)
    // =========================================================================

    /// The event's version is lower than the aggregate's highest committed
    /// version.
    ///
    /// # When This Happens
    ///
    /// Two command handlers loaded the same aggregate, and the one that lost
    /// the race tries to append behind the winner. The writer looks up the
    /// current maximum version before inserting and refuses to go backwards.
    ///
    /// # Recovery
    ///
    /// 1. Reload the aggregate's events
    /// 2. Re-run the command against the fresh state
    /// 3. Persist the newly produced event
    #[error(
        "inconsistent version {version} for aggregate {aggregate_id} of type '{stream_type}'; \
         an aggregate's versions must be monotonically increasing"
    )]
    InconsistentVersion {
        /// Stream the event was appended to
        stream_type: String,
        /// Aggregate that owns the event
        aggregate_id: Uuid,
        /// The rejected version
        version: u64,
    },

    /// An event with the same `(aggregate_id, version)` is already committed.
    ///
    /// This comes from the unique index on the stream table, which is the
    /// authoritative guard against duplicates.
    #[error("duplicate version {version} for aggregate {aggregate_id} of type '{stream_type}'")]
    DuplicateVersion {
        /// Stream the event was appended to
        stream_type: String,
        /// Aggregate that owns the event
        aggregate_id: Uuid,
        /// The duplicated version
        version: u64,
    },

    /// Another item in the same commit batch failed, so the whole batch was
    /// rolled back.
    ///
    /// The event itself may be perfectly valid; submit it again.
    #[error("other item in batch failed; try again")]
    RetryBatch,

    // =========================================================================
    // Validation (raised by event producers)
    // =========================================================================

    /// An event was constructed with invalid data (e.g. version 0).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A command was rejected by aggregate business logic.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // =========================================================================
    // Internal Errors (investigate)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any `rusqlite` error that isn't classified as a duplicate
    /// version: I/O failure, a full disk, corruption, a locked file.
    #[error("couldn't persist event: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Beginning or committing a batch transaction failed.
    ///
    /// Every item of the batch receives this error; none of them is durable.
    #[error("batch commit failed: {0}")]
    CommitFailed(String),

    /// Metadata version mismatch or a stored row that can't be decoded.
    #[error("schema error: {0}")]
    Schema(String),

    /// An operating-system call failed, e.g. spawning the writer thread.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value couldn't be parsed or is out of range.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the caller should simply submit the same event again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryBatch)
    }

    /// Returns true for storage-engine failures that aren't a concurrency
    /// conflict.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::CommitFailed(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
