//! Core types for the Keel datastore client.
//!
//! Keys, values and entities, the record codec, query values, mutations, and
//! the [`Transport`] trait that backends implement.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod mutation;
pub mod query;
pub mod transport;
pub mod types;

pub use codec::{FieldOptions, FieldValue, PropertyReader, PropertyWriter, Record};
pub use config::{ClientConfig, TransactionOptions};
pub use context::Context;
pub use error::{Error, FieldMismatch, MultiError, Result};
pub use key::{Key, KeyId, KeyPath, PartitionId, PathElement, KEY_PROPERTY};
pub use mutation::Mutation;
pub use query::{Cursor, Direction, Filter, Operator, Order, Query};
pub use transport::{
    CommitRequest, CommitResponse, LookupRequest, LookupResponse, MoreResults, MutationResult,
    QueryBatch, QueryResult, ReadOptions, RunQueryRequest, TransactionId, TransactionMode,
    Transport,
};
pub use types::{Entity, GeoPoint, Property, Value, MAX_INDEXED_LEN};
