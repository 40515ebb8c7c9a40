#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use eventful::{AggregateId, Event, EventStore, StoreConfig, WriterConfig};
use rusqlite::Connection;

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens a fresh store with the given stream types already initialized.
pub fn create_temp_store(name: &str, streams: &[&str]) -> (tempfile::TempDir, EventStore) {
    create_temp_store_with_config(name, streams, StoreConfig::default())
}

pub fn create_temp_store_with_config(
    name: &str,
    streams: &[&str],
    config: StoreConfig,
) -> (tempfile::TempDir, EventStore) {
    let (dir, path) = temp_db_path(name);
    let store = EventStore::open_with_config(&path, config).expect("open store");
    for stream in streams {
        store.initialize(stream).expect("initialize stream");
    }
    (dir, store)
}

pub fn config_with_busy_timeout(busy_timeout: Duration) -> StoreConfig {
    StoreConfig {
        busy_timeout,
        ..StoreConfig::default()
    }
}

pub fn config_with_queue_capacity(queue_capacity: usize) -> StoreConfig {
    StoreConfig {
        writer: WriterConfig {
            queue_capacity,
            max_batch_size: queue_capacity,
            ..WriterConfig::default()
        },
        ..StoreConfig::default()
    }
}

pub fn event(aggregate_id: AggregateId, version: u64) -> Event {
    Event::new(
        "changed",
        aggregate_id,
        version,
        format!("payload-{version}").into_bytes(),
    )
    .expect("valid event")
}

pub fn versions(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.version().as_raw()).collect()
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

/// Takes SQLite's write lock from a second connection until `release` is
/// called, stalling the store's writer at `BEGIN IMMEDIATE`.
pub struct WriteLock {
    conn: Connection,
}

impl WriteLock {
    pub fn acquire(path: &Path) -> Self {
        let conn = open_read_write(path);
        conn.execute_batch("BEGIN IMMEDIATE").expect("take write lock");
        Self { conn }
    }

    pub fn release(self) {
        self.conn.execute_batch("COMMIT").expect("release write lock");
    }
}

/// Gives the writer thread time to pick up what is queued.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(150));
}
