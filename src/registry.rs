//! # Stream Registry
//!
//! The registry maps stream type names to their [`StreamSchema`] handles. It
//! is owned by the [`EventStore`](crate::EventStore) and populated only by
//! `initialize` (and when an existing database is opened). The writer and the
//! reader never look streams up by themselves: the facade resolves the
//! schema and hands an `Arc` to whichever path needs it.
//!
//! ## Concurrency
//!
//! Lookups happen on every `persist` and `events` call, from many threads;
//! inserts happen a handful of times over the life of a store. An `RwLock`
//! around a `HashMap` fits that read-mostly pattern. Entries are never
//! replaced or removed, so a schema handed out once stays valid.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::schema::StreamSchema;

/// Registered stream types and their handles.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<StreamSchema>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from schemas loaded out of an existing database.
    pub fn with_streams(schemas: impl IntoIterator<Item = StreamSchema>) -> Self {
        let streams = schemas
            .into_iter()
            .map(|schema| (schema.stream_type().to_string(), Arc::new(schema)))
            .collect();
        Self {
            streams: RwLock::new(streams),
        }
    }

    /// Looks up the handles for a stream type.
    pub fn get(&self, stream_type: &str) -> Option<Arc<StreamSchema>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_type)
            .cloned()
    }

    /// Looks up the handles for a stream type, failing with `UnknownStream`.
    pub fn resolve(&self, stream_type: &str) -> Result<Arc<StreamSchema>> {
        self.get(stream_type).ok_or_else(|| Error::UnknownStream {
            stream_type: stream_type.to_string(),
        })
    }

    pub fn contains(&self, stream_type: &str) -> bool {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(stream_type)
    }

    /// Adds a freshly created stream.
    ///
    /// Registering the same name twice is an `AlreadyExists` error; the
    /// existing entry is left untouched.
    pub fn register(&self, schema: Arc<StreamSchema>) -> Result<()> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let name = schema.stream_type().to_string();
        if streams.contains_key(&name) {
            return Err(Error::AlreadyExists { stream_type: name });
        }
        streams.insert(name, schema);
        Ok(())
    }

    /// All schemas, in no particular order.
    pub fn schemas(&self) -> Vec<Arc<StreamSchema>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered stream type names, sorted.
    pub fn stream_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
