use crate::key::Key;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no such entity")]
    NoSuchEntity,

    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("{0}")]
    FieldMismatch(FieldMismatch),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("property {name:?} is {len} bytes long, indexed values are limited to {limit} bytes")]
    PropertyTooLong {
        name: String,
        len: usize,
        limit: usize,
    },

    #[error("decode error in field {field:?}: {reason}")]
    Decode { field: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("concurrent transaction: too many concurrent-modification retries")]
    ConcurrentTransaction,

    #[error("transaction is read-only")]
    ReadOnlyTransaction,

    #[error("transaction has already been committed or rolled back")]
    TransactionFinished,

    #[error("{0}")]
    Multi(MultiError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidKey(_) => "INVALID_KEY",
            Error::NoSuchEntity => "NO_SUCH_ENTITY",
            Error::InvalidEntityType(_) => "INVALID_ENTITY_TYPE",
            Error::FieldMismatch(_) => "FIELD_MISMATCH",
            Error::Encode(_) => "ENCODE_ERROR",
            Error::PropertyTooLong { .. } => "PROPERTY_TOO_LONG",
            Error::Decode { .. } => "DECODE_ERROR",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::ConcurrentTransaction => "CONCURRENT_TRANSACTION",
            Error::ReadOnlyTransaction => "READ_ONLY_TRANSACTION",
            Error::TransactionFinished => "TRANSACTION_FINISHED",
            Error::Multi(_) => "MULTI_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Cancelled => "CANCELLED",
            Error::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Returns true if a transaction commit failing with this error may be
    /// retried from a fresh transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_no_such_entity(&self) -> bool {
        matches!(self, Error::NoSuchEntity)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_field_mismatch(&self) -> bool {
        matches!(self, Error::FieldMismatch(_))
    }

    /// Cancellation-class errors: the caller's context fired before or during
    /// the call.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Returns true if the error was raised before any request reached the
    /// backend (validation and configuration failures).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey(_)
                | Error::InvalidEntityType(_)
                | Error::InvalidQuery(_)
                | Error::Encode(_)
                | Error::PropertyTooLong { .. }
                | Error::ReadOnlyTransaction
                | Error::TransactionFinished
                | Error::Config(_)
        )
    }

    pub fn as_multi(&self) -> Option<&MultiError> {
        match self {
            Error::Multi(m) => Some(m),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A property that could not be matched to a field of the target record.
///
/// Decoding continues past a mismatch; the target keeps every field that did
/// decode, and the mismatch is reported once the whole entity was processed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMismatch {
    /// Type name of the record being loaded
    pub record: &'static str,
    /// Name of the offending property
    pub property: String,
    pub reason: String,
    /// Key of the entity being decoded, when it has one
    pub key: Option<Key>,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot load property {:?} into a {}: {}",
            self.property, self.record, self.reason
        )?;
        if let Some(key) = &self.key {
            write!(f, " (entity {})", key)?;
        }
        Ok(())
    }
}

/// Positional outcome of a batch operation.
///
/// Slot `i` is `None` when item `i` succeeded, otherwise the error for that
/// item alone.
#[derive(Debug, Default)]
pub struct MultiError(Vec<Option<Error>>);

impl MultiError {
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| None).collect())
    }

    pub fn set(&mut self, index: usize, err: Error) {
        self.0[index] = Some(err);
    }

    pub fn get(&self, index: usize) -> Option<&Error> {
        self.0.get(index).and_then(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failed slots.
    pub fn failures(&self) -> usize {
        self.0.iter().filter(|e| e.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Error>> {
        self.0.iter().map(|e| e.as_ref())
    }

    pub fn into_inner(self) -> Vec<Option<Error>> {
        self.0
    }

    /// `Ok(())` when every slot succeeded, otherwise `Err(Error::Multi)`.
    pub fn into_result(self) -> Result<()> {
        if self.failures() == 0 {
            Ok(())
        } else {
            Err(Error::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = None;
        let mut n = 0;
        for err in self.0.iter().flatten() {
            if first.is_none() {
                first = Some(err);
            }
            n += 1;
        }
        match (first, n) {
            (None, _) => write!(f, "(0 errors)"),
            (Some(err), 1) => write!(f, "{}", err),
            (Some(err), 2) => write!(f, "{} (and 1 other error)", err),
            (Some(err), n) => write!(f, "{} (and {} other errors)", err, n - 1),
        }
    }
}

impl FromIterator<Option<Error>> for MultiError {
    fn from_iter<I: IntoIterator<Item = Option<Error>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
