//! # Domain Types for Eventful
//!
//! This module defines the values that flow through the store: events, their
//! per-aggregate versions, and the names of the streams that hold them.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Like positions and revisions in any log, a version is "just a number" that
//! is very easy to mix up with other numbers. Wrapping it in [`Version`]:
//!
//! - Rejects the invalid value (0) once, at construction time
//! - Keeps function signatures self-documenting
//! - Lets the storage representation (`INTEGER`, i.e. `i64`) stay an
//!   implementation detail
//!
//! [`StreamType`] does the same for stream names, which end up as SQLite
//! table names and therefore have to be valid identifiers.
//!
//! ## Invariants
//!
//! - [`Version`]: starts at 1, never zero, fits in a SQLite `INTEGER`
//! - [`Event`]: immutable once constructed; `id` is random and never used
//!   for ordering
//! - [`StreamType`]: `[A-Za-z_][A-Za-z0-9_]*`, at most 64 characters, not in
//!   a reserved namespace

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of an aggregate instance.
pub type AggregateId = Uuid;

// =============================================================================
// Version
// =============================================================================

/// An event's position in its aggregate's history.
///
/// # Invariants
///
/// - Starts at 1 ([`Version::FIRST`])
/// - At most `i64::MAX`, the largest value a SQLite `INTEGER` can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// The version of an aggregate's first event.
    pub const FIRST: Version = Version(1);

    /// Creates a version, rejecting 0 and values SQLite can't store.
    pub fn new(value: u64) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidEvent(
                "version must be larger than 0".to_string(),
            ));
        }
        if value > i64::MAX as u64 {
            return Err(Error::InvalidEvent(format!(
                "version {value} exceeds the maximum storable version {}",
                i64::MAX
            )));
        }
        Ok(Self(value))
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the version following this one.
    ///
    /// # Errors
    ///
    /// `Error::InvalidEvent` if this is already the largest storable version.
    pub fn next(&self) -> Result<Self> {
        Self::new(self.0 + 1)
    }

    /// Storage representation (SQLite `INTEGER`).
    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    /// Decodes a stored version, rejecting values the store never writes.
    pub(crate) fn from_sql(value: i64) -> Result<Self> {
        if value < 1 {
            return Err(Error::Schema(format!("stored version {value} is not positive")));
        }
        Ok(Self(value as u64))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Stream Type
// =============================================================================

/// Maximum length of a stream type name.
pub const MAX_STREAM_TYPE_LEN: usize = 64;

/// Prefixes that can't be used as stream names.
///
/// `sqlite_` is reserved by SQLite itself; `eventful_` holds the store's own
/// catalogue tables.
const RESERVED_PREFIXES: [&str; 2] = ["sqlite_", "eventful_"];

/// The name of a stream, e.g. `"customer"` or `"order"`.
///
/// Each stream type gets its own table, so the name is validated to be a
/// plain SQL identifier. This keeps it safe to interpolate into DDL.
///
/// # Example
///
/// ```rust
/// use eventful::StreamType;
///
/// let stream = StreamType::new("customer")?;
/// assert_eq!(stream.as_str(), "customer");
///
/// assert!(StreamType::new("drop table; --").is_err());
/// # Ok::<(), eventful::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamType(String);

impl StreamType {
    /// Validates and wraps a stream type name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if let Some(reason) = Self::invalid_reason(&name) {
            return Err(Error::InvalidStreamType {
                stream_type: name,
                reason,
            });
        }
        Ok(Self(name))
    }

    fn invalid_reason(name: &str) -> Option<String> {
        let mut chars = name.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => return Some("must not be empty".to_string()),
        };
        if name.len() > MAX_STREAM_TYPE_LEN {
            return Some(format!("must be at most {MAX_STREAM_TYPE_LEN} characters"));
        }
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Some("must start with a letter or underscore".to_string());
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Some("may only contain letters, digits and underscores".to_string());
        }
        let lower = name.to_ascii_lowercase();
        RESERVED_PREFIXES
            .iter()
            .find(|prefix| lower.starts_with(*prefix))
            .map(|prefix| format!("the '{prefix}' prefix is reserved"))
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for StreamType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

// =============================================================================
// Event
// =============================================================================

/// One immutable fact in an aggregate's history.
///
/// # Fields
///
/// - `event_type`: what happened, e.g. `"created"` or `"contact-added"`
/// - `id`: random, globally unique; for diagnostics only, never ordering
/// - `aggregate_id`: the aggregate instance this event belongs to
/// - `version`: position in the aggregate's history (≥ 1)
/// - `payload`: opaque bytes; the store never looks inside
///
/// # Example
///
/// ```rust
/// use eventful::Event;
/// use uuid::Uuid;
///
/// let customer = Uuid::new_v4();
/// let created = Event::new("created", customer, 1, br#"{"name":"ACME"}"#.to_vec())?;
/// assert_eq!(created.version().as_raw(), 1);
///
/// // Version 0 is rejected up front
/// assert!(Event::new("created", customer, 0, Vec::<u8>::new()).is_err());
/// # Ok::<(), eventful::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_type: String,
    id: Uuid,
    aggregate_id: AggregateId,
    version: Version,
    payload: Vec<u8>,
}

impl Event {
    /// Creates an event with a fresh random id.
    ///
    /// # Errors
    ///
    /// `Error::InvalidEvent` if `version` is 0.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: AggregateId,
        version: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        Self::with_id(Uuid::new_v4(), event_type, aggregate_id, version, payload)
    }

    /// Creates an event with a caller-supplied id.
    ///
    /// Used when rehydrating events from storage, or by producers that
    /// derive ids deterministically.
    pub fn with_id(
        id: Uuid,
        event_type: impl Into<String>,
        aggregate_id: AggregateId,
        version: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        Ok(Self {
            event_type: event_type.into(),
            id,
            aggregate_id,
            version: Version::new(version)?,
            payload: payload.into(),
        })
    }

    /// Assembles an event from already-validated parts.
    pub(crate) fn from_parts(
        id: Uuid,
        event_type: String,
        aggregate_id: AggregateId,
        version: Version,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type,
            id,
            aggregate_id,
            version,
            payload,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the event, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

// =============================================================================
// Tests
// =============================================================================
