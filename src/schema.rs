//! # SQLite Schema for Eventful
//!
//! This module owns everything structural: opening the writer connection with
//! the right pragmas, the store's own catalogue tables, and the per-stream
//! tables created by `initialize`.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  eventful_metadata      eventful_streams        <stream_type>           │
//! │  ┌──────────────┐       ┌─────────────────┐     ┌──────────────────┐    │
//! │  │ key (PK)     │       │ stream_type (PK)│────►│ id (PK)          │    │
//! │  │ value        │       │ created_ms      │     │ type             │    │
//! │  └──────────────┘       └─────────────────┘     │ aggregate_id ─┐  │    │
//! │                                                 │ version ──────┤  │    │
//! │                                                 │ payload BLOB  │  │    │
//! │                                                 └───────────────┼──┘    │
//! │                                  UNIQUE eventful_idx_<stream_type>      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### One table per stream type
//!
//! Every stream type is its own append-only partition. A table per stream
//! keeps the `(aggregate_id, version)` index small and lets the uniqueness
//! constraint be the authoritative duplicate check.
//!
//! ### Prepared handles
//!
//! The SQL for a stream is built once, in [`StreamSchema`], and never changes.
//! Connections prepare it through rusqlite's statement cache
//! (`prepare_cached`), which keeps the compiled statement alive between
//! uses. That is the "prepare once, execute many" handle the writer and the
//! reader rely on.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::types::StreamType;

// =============================================================================
// Schema Version
// =============================================================================

/// Current catalogue version. Increment when making breaking layout changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Key-value metadata about the database itself (schema version).
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS eventful_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Catalogue of initialized stream types.
///
/// Written in the same transaction as a stream's DDL, so a stream table never
/// exists without its catalogue row. On reopen, this is what gets loaded back
/// into the registry.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS eventful_streams (
    stream_type TEXT PRIMARY KEY COLLATE NOCASE,
    created_ms  INTEGER NOT NULL
)
"#;

// =============================================================================
// Stream Schema (per-stream handles)
// =============================================================================

/// The immutable SQL handles for one stream type.
///
/// Built once by `initialize` (or when a database is reopened) and shared by
/// `Arc` with the writer and the reader. Nothing in here is mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    stream_type: StreamType,
    pub(crate) create_table_sql: String,
    pub(crate) create_index_sql: String,
    pub(crate) insert_sql: String,
    pub(crate) max_version_sql: String,
    pub(crate) select_sql: String,
}

impl StreamSchema {
    /// Builds the SQL for a stream type.
    ///
    /// The name is interpolated into the statements. That is safe because
    /// [`StreamType`] only admits plain identifiers, and it is quoted anyway.
    pub fn new(stream_type: StreamType) -> Self {
        let table = stream_type.as_str();

        Self {
            create_table_sql: format!(
                r#"CREATE TABLE "{table}" (
    id           TEXT    PRIMARY KEY NOT NULL,
    type         TEXT    NOT NULL,
    aggregate_id TEXT    NOT NULL,
    version      INTEGER NOT NULL,
    payload      BLOB    NOT NULL
)"#
            ),
            create_index_sql: format!(
                r#"CREATE UNIQUE INDEX "eventful_idx_{table}" ON "{table}" (aggregate_id, version)"#
            ),
            insert_sql: format!(
                r#"INSERT INTO "{table}" (id, type, aggregate_id, version, payload) VALUES (?1, ?2, ?3, ?4, ?5)"#
            ),
            max_version_sql: format!(
                r#"SELECT MAX(version) FROM "{table}" WHERE aggregate_id = ?1"#
            ),
            select_sql: format!(
                r#"SELECT id, type, version, payload FROM "{table}" WHERE aggregate_id = ?1 ORDER BY version"#
            ),
            stream_type,
        }
    }

    /// The stream type these handles belong to.
    pub fn stream_type(&self) -> &StreamType {
        &self.stream_type
    }

    /// Prepares the writer's two handles (insert, max version) on `conn`.
    ///
    /// The statements stay in the connection's statement cache, so the
    /// first append doesn't pay for compilation.
    pub(crate) fn prepare_writer_handles(&self, conn: &Connection) -> Result<()> {
        conn.prepare_cached(&self.insert_sql)?;
        conn.prepare_cached(&self.max_version_sql)?;
        Ok(())
    }
}

/// Creates the table and unique index for a new stream type and commits.
///
/// # Errors
///
/// - `Error::AlreadyExists` if a table (or catalogue entry) with this name
///   already exists; nothing is changed in that case
/// - `Error::Persistence` if the DDL fails
///
/// # Commit Behavior
///
/// The structural change is committed immediately in its own transaction.
/// It must never be part of an append batch: appends for this stream can
/// only be accepted once the table is visible.
pub(crate) fn create_stream(conn: &mut Connection, stream_type: StreamType) -> Result<StreamSchema> {
    let tx = conn.transaction()?;

    // Tables, indexes and views share one namespace, and identifiers are
    // case-insensitive, so "Customer" collides with "customer".
    let exists: bool = tx.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM sqlite_master WHERE name = ?1 COLLATE NOCASE
         ) OR EXISTS(
             SELECT 1 FROM eventful_streams WHERE stream_type = ?1
         )",
        [stream_type.as_str()],
        |row| row.get(0),
    )?;

    if exists {
        // Dropping `tx` rolls back the (empty) transaction.
        return Err(Error::AlreadyExists {
            stream_type: stream_type.to_string(),
        });
    }

    let schema = StreamSchema::new(stream_type);

    tx.execute_batch(&schema.create_table_sql)?;
    tx.execute_batch(&schema.create_index_sql)?;
    tx.execute(
        "INSERT INTO eventful_streams (stream_type, created_ms) VALUES (?1, ?2)",
        params![schema.stream_type().as_str(), current_time_ms() as i64],
    )?;
    tx.commit()?;

    schema.prepare_writer_handles(conn)?;

    Ok(schema)
}

/// Loads every stream type recorded in the catalogue, oldest first.
pub(crate) fn load_streams(conn: &Connection) -> Result<Vec<StreamSchema>> {
    let mut stmt =
        conn.prepare("SELECT stream_type FROM eventful_streams ORDER BY created_ms, stream_type")?;

    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    names
        .into_iter()
        .map(|name| {
            StreamType::new(name)
                .map(StreamSchema::new)
                .map_err(|e| Error::Schema(format!("catalogue holds an unusable stream type: {e}")))
        })
        .collect()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// The writer's SQLite connection with the store's catalogue in place.
///
/// # Ownership
///
/// `Database` owns its `Connection`. The store converts it into the writer
/// thread's connection with [`Database::into_connection`]; from then on no
/// other thread touches it.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Persistence` if the file can't be opened or created
    /// - `Error::Schema` if the catalogue version doesn't match
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Sets pragmas, creates the catalogue tables and checks the version.
    fn initialize(&mut self) -> Result<()> {
        // WAL lets the read-only connection read while the writer writes.
        // journal_mode answers with the resulting mode, so read it back.
        let mode: String = self
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(Error::Schema(format!(
                "couldn't enable WAL journal mode (got '{mode}')"
            )));
        }

        // Sync the WAL on checkpoint rather than on every commit. A crash can
        // lose the last batch, whose callers never saw it succeed anyway.
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_STREAMS)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM eventful_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO eventful_metadata (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this store requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns the stream types recorded in this database.
    pub fn streams(&self) -> Result<Vec<StreamSchema>> {
        load_streams(&self.conn)
    }

    /// Consumes the wrapper and returns the raw connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
