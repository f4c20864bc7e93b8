/// Keel datastore client
///
/// Typed access to a hierarchical document store: load and store records,
/// run queries with cursors, apply batches with positional errors, and run
/// transactions with optimistic retry.

pub mod batch;
pub mod client;
pub mod iterator;
pub mod transaction;

// Re-export key types
pub use client::Client;
pub use iterator::QueryIter;
pub use transaction::{Commit, PendingKey, Transaction};
pub use keel_core::{
    ClientConfig, Context, Cursor, Entity, Error, FieldMismatch, FieldOptions, FieldValue,
    GeoPoint, Key, MultiError, Mutation, Property, PropertyReader, PropertyWriter, Query, Record,
    Result, TransactionOptions, Transport, Value,
};
