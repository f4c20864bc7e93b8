/// Transport capability set
///
/// The client talks to the backend only through [`Transport`]. Every call is
/// a synchronous request/response exchange; implementations classify backend
/// failures into `Conflict`, `NotFound`, `AlreadyExists`, `InvalidArgument`,
/// and `Transport` for anything else.

use crate::context::Context;
use crate::key::PartitionId;
use crate::mutation::Mutation;
use crate::query::{Cursor, Query};
use crate::types::Entity;
use crate::{Key, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-issued transaction handle
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Bytes);

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId(")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Consistency of a read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadOptions {
    #[default]
    Strong,
    Eventual,
    /// Read inside a transaction's snapshot
    Transaction(TransactionId),
    /// Read the data as committed at this instant
    ReadTime(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupRequest {
    pub keys: Vec<Key>,
    pub read: ReadOptions,
}

/// Lookup outcome. Every requested key lands in exactly one list; deferred
/// keys were not processed and should be requested again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupResponse {
    pub found: Vec<Entity>,
    pub missing: Vec<Key>,
    pub deferred: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunQueryRequest {
    pub partition: PartitionId,
    pub query: Query,
    /// Maximum rows per batch (0 = backend default)
    pub page_size: usize,
    pub read: ReadOptions,
}

/// One query row
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub key: Key,
    /// Empty property list for keys-only queries
    pub entity: Entity,
    /// Position just after this row
    pub cursor: Cursor,
}

/// Whether the backend has more rows after a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreResults {
    /// Batch size cut the results short; ask again from `end_cursor`
    NotFinished,
    /// The query limit was reached
    MoreResultsAfterLimit,
    /// The end cursor was reached
    MoreResultsAfterCursor,
    NoMoreResults,
}

/// One page of query results
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBatch {
    pub results: Vec<QueryResult>,
    /// Offset rows consumed by this batch
    pub skipped_results: i32,
    /// Position after the last skipped row
    pub skipped_cursor: Option<Cursor>,
    /// Position after the last row this batch examined
    pub end_cursor: Cursor,
    pub more_results: MoreResults,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    /// `None` for a non-transactional commit
    pub transaction: Option<TransactionId>,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    /// Final key of the written entity; allocated when the mutation's key was
    /// incomplete
    pub key: Key,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResponse {
    /// One result per mutation, in request order
    pub mutation_results: Vec<MutationResult>,
    pub index_updates: i32,
    /// When the backend applied the commit, if it reports one
    pub commit_time: Option<DateTime<Utc>>,
}

/// Backend capability set used by the client
pub trait Transport: Send + Sync {
    fn lookup(&self, ctx: &Context, req: LookupRequest) -> Result<LookupResponse>;

    fn run_query(&self, ctx: &Context, req: RunQueryRequest) -> Result<QueryBatch>;

    fn begin_transaction(&self, ctx: &Context, mode: TransactionMode) -> Result<TransactionId>;

    fn commit(&self, ctx: &Context, req: CommitRequest) -> Result<CommitResponse>;

    fn rollback(&self, ctx: &Context, txn: &TransactionId) -> Result<()>;

    /// Complete each incomplete key, in order.
    fn allocate_ids(&self, ctx: &Context, keys: Vec<Key>) -> Result<Vec<Key>>;
}
