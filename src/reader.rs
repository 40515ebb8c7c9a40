//! # Event Reader
//!
//! Read operations run on a dedicated **read-only** connection, separate from
//! the writer's. With the database in WAL mode, a reader never blocks the
//! writer and never sees a partially applied batch:
//!
//! ```text
//!   persist ──► queue ──► writer thread ──► read-write connection ─┐
//!                                                                  ▼
//!                                                           ┌────────────┐
//!                                                           │   SQLite   │
//!                                                           │   (WAL)    │
//!                                                           └────────────┘
//!                                                                  ▲
//!   events ─────────────────────────────► read-only connection ────┘
//! ```
//!
//! Each query is a single `SELECT`, which SQLite runs against one snapshot.
//! A batch is visible completely or not at all.
//!
//! The functions here take the connection explicitly; the store serializes
//! access to its one read connection.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::StreamSchema;
use crate::types::{AggregateId, Event, Version};

/// Opens the read-only connection used by the store's read path.
pub(crate) fn open_read_connection(
    path: &Path,
    busy_timeout: Duration,
    statement_cache_capacity: usize,
) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.set_prepared_statement_cache_capacity(statement_cache_capacity);
    Ok(conn)
}

/// Reads every committed event of one aggregate, in ascending version order.
///
/// An aggregate with no events yields an empty vector, not an error.
///
/// # Errors
///
/// - `Error::Persistence` if the query fails
/// - `Error::Schema` if a stored row can't be decoded (not written by this
///   store, or corrupted)
pub fn read_events(
    conn: &Connection,
    schema: &StreamSchema,
    aggregate_id: AggregateId,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare_cached(&schema.select_sql)?;

    let rows = stmt
        .query_map([aggregate_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, event_type, version, payload)| {
            let id = Uuid::parse_str(&id).map_err(|e| {
                Error::Schema(format!(
                    "stream '{}' holds an event with malformed id '{id}': {e}",
                    schema.stream_type()
                ))
            })?;
            Ok(Event::from_parts(
                id,
                event_type,
                aggregate_id,
                Version::from_sql(version)?,
                payload,
            ))
        })
        .collect()
}

/// Returns the highest committed version of an aggregate, or `None` if it
/// has no events yet.
pub fn current_version(
    conn: &Connection,
    schema: &StreamSchema,
    aggregate_id: AggregateId,
) -> Result<Option<Version>> {
    let max: Option<i64> = conn
        .prepare_cached(&schema.max_version_sql)?
        .query_row([aggregate_id.to_string()], |row| row.get(0))?;

    max.map(Version::from_sql).transpose()
}

// =============================================================================
// Tests
// =============================================================================
