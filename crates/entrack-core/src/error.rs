//! Error types for change tracking and save execution.
//!
//! The taxonomy splits into model errors (fatal, raised before any store
//! interaction), concurrency and not-found errors (reported per offending
//! entry, recoverable by caller action), and transport errors (wrapped, never
//! retried here).

use crate::value::Value;
use std::fmt;

/// The primary error type for all entrack operations.
#[derive(Debug)]
pub enum Error {
    /// Model construction/validation failure.
    Model(ModelError),
    /// A key property was null/unset at tracking time.
    InvalidKey(InvalidKeyError),
    /// Two different instances resolve to the same identity.
    IdentityConflict(IdentityConflictError),
    /// A cycle of non-nullable foreign keys cannot be ordered.
    DependencyCycle(DependencyCycleError),
    /// A concurrency token check failed during save.
    Concurrency(ConcurrencyError),
    /// An expected row was missing without a concurrency token involved.
    RowNotFound(RowNotFoundError),
    /// Transport/store failure wrapping the underlying cause.
    Store(StoreError),
    /// Operation was cancelled via asupersync.
    Cancelled,
    /// Custom error with message.
    Custom(String),
}

/// Model construction or validation problem.
#[derive(Debug, Clone)]
pub struct ModelError {
    pub message: String,
}

/// A key property was null or unset when an identity was required.
#[derive(Debug, Clone)]
pub struct InvalidKeyError {
    /// Entity type name.
    pub entity: String,
    /// The offending key property.
    pub property: String,
}

/// Two distinct instances mapped to one identity.
#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    /// Entity type name.
    pub entity: String,
    /// The conflicting key values.
    pub key: Vec<Value>,
}

/// A reference cycle that cannot be broken by deferring a nullable foreign key.
#[derive(Debug, Clone)]
pub struct DependencyCycleError {
    /// Entity type names participating in the cycle, in walk order.
    pub entities: Vec<String>,
}

/// Identifies one tracked entry in an error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStamp {
    /// Entity type name.
    pub entity: String,
    /// Key values of the entry.
    pub key: Vec<Value>,
}

/// An optimistic concurrency check failed for one or more entries.
#[derive(Debug, Clone)]
pub struct ConcurrencyError {
    /// The entries whose condition columns matched no row.
    pub entries: Vec<EntryStamp>,
}

/// A row expected to exist matched nothing, with no concurrency token checked.
#[derive(Debug, Clone)]
pub struct RowNotFoundError {
    /// The entry whose row was missing.
    pub entry: EntryStamp,
}

/// Lower-level transport failure.
#[derive(Debug)]
pub struct StoreError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    /// Create a store error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

fn fmt_key(key: &[Value], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "(")?;
    for (i, v) in key.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{v}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Model(e) => write!(f, "model error: {}", e.message),
            Error::InvalidKey(e) => write!(
                f,
                "key property '{}.{}' is null or unset",
                e.entity, e.property
            ),
            Error::IdentityConflict(e) => {
                write!(f, "another '{}' instance is already tracked with key ", e.entity)?;
                fmt_key(&e.key, f)
            }
            Error::DependencyCycle(e) => write!(
                f,
                "dependency cycle of non-nullable foreign keys: {}",
                e.entities.join(" -> ")
            ),
            Error::Concurrency(e) => {
                write!(f, "concurrency conflict for {} entries: ", e.entries.len())?;
                for (i, s) in e.entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", s.entity)?;
                    fmt_key(&s.key, f)?;
                }
                Ok(())
            }
            Error::RowNotFound(e) => {
                write!(f, "expected row not found for {}", e.entry.entity)?;
                fmt_key(&e.entry.key, f)
            }
            Error::Store(e) => write!(f, "store communication error: {}", e.message),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

/// Convenience result alias for entrack operations.
pub type Result<T> = std::result::Result<T, Error>;
