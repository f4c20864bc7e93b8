/// Keel datastore client
use crate::iterator::QueryIter;
use crate::transaction::{Commit, Transaction};
use chrono::{DateTime, Utc};
use keel_core::{
    ClientConfig, Context, Error, Key, PartitionId, Query, ReadOptions, Record, Result,
    TransactionMode, TransactionOptions, Transport, Value,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Datastore client
///
/// Cheap to clone; clones share the transport and configuration. All
/// operations are synchronous and may be called from several threads at once.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish()
    }
}

impl Client {
    /// Create a client over `transport`
    ///
    /// # Example
    /// ```ignore
    /// let client = Client::new(MemoryDatastore::new(), ClientConfig::new().with_project_id("dev"))?;
    /// ```
    pub fn new(transport: impl Transport + 'static, config: ClientConfig) -> Result<Self> {
        Self::with_transport(Arc::new(transport), config)
    }

    /// Create a client over a shared transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        info!(
            project = %config.project_id,
            namespace = %config.namespace,
            "datastore client ready"
        );
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    /// Create a client configured from the environment
    pub fn from_env(transport: impl Transport + 'static) -> Result<Self> {
        Self::new(transport, ClientConfig::from_env()?)
    }

    /// A client sharing this one's transport whose reads outside
    /// transactions see the data as committed at `at`
    pub fn with_read_time(&self, at: DateTime<Utc>) -> Client {
        Client {
            transport: Arc::clone(&self.transport),
            config: Arc::new(self.config.as_ref().clone().with_read_time(at)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Places a key without a namespace in the client's namespace.
    pub(crate) fn resolve_key(&self, key: &Key) -> Key {
        if key.namespace().is_empty() && !self.config.namespace.is_empty() {
            key.clone().with_namespace(self.config.namespace.clone())
        } else {
            key.clone()
        }
    }

    pub(crate) fn read_options(&self, eventual: bool) -> ReadOptions {
        if let Some(at) = self.config.read_time {
            ReadOptions::ReadTime(at)
        } else if eventual || self.config.eventual_reads {
            ReadOptions::Eventual
        } else {
            ReadOptions::Strong
        }
    }

    /// Partition a query runs in, and the query with its keys resolved.
    pub(crate) fn resolve_query(&self, query: &Query) -> (PartitionId, Query) {
        let mut q = query.clone();
        let namespace = q
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.namespace.clone());
        q.namespace = Some(namespace.clone());
        q.ancestor = q.ancestor.as_ref().map(|k| self.resolve_key(k));
        for f in &mut q.filters {
            f.value = match &f.value {
                Value::Key(k) => Value::Key(self.resolve_key(k)),
                Value::Array(values) => Value::Array(
                    values
                        .iter()
                        .map(|v| match v {
                            Value::Key(k) => Value::Key(self.resolve_key(k)),
                            other => other.clone(),
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
        }
        let partition = PartitionId {
            project: self.config.project_id.clone(),
            namespace,
        };
        (partition, q)
    }

    // ------------------------------------------------------------------------
    // Single-entity operations
    // ------------------------------------------------------------------------

    /// Load the entity stored under `key` into `dst`
    ///
    /// Returns `Error::NoSuchEntity` when nothing is stored there. On
    /// `Error::FieldMismatch`, `dst` holds every field that did decode.
    pub fn get<R: Record>(&self, ctx: &Context, key: &Key, dst: &mut R) -> Result<()> {
        self.get_multi(ctx, std::slice::from_ref(key), std::slice::from_mut(dst))
            .map_err(first_slot_error)
    }

    /// Store `src` under `key`, returning the complete key
    pub fn put<R: Record>(&self, ctx: &Context, key: &Key, src: &R) -> Result<Key> {
        let mut keys = self
            .put_multi(ctx, std::slice::from_ref(key), std::slice::from_ref(src))
            .map_err(first_slot_error)?;
        keys.pop()
            .ok_or_else(|| Error::Transport("commit returned no key".to_string()))
    }

    /// Delete the entity stored under `key`
    pub fn delete(&self, ctx: &Context, key: &Key) -> Result<()> {
        self.delete_multi(ctx, std::slice::from_ref(key))
            .map_err(first_slot_error)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Start running `query`. Validation errors surface from the first call
    /// to `next`.
    pub fn run(&self, ctx: &Context, query: &Query) -> QueryIter {
        QueryIter::new(self.clone(), ctx.clone(), query)
    }

    /// Number of results `query` yields
    pub fn count(&self, ctx: &Context, query: &Query) -> Result<usize> {
        query.validate()?;
        let q = if query.is_projection() {
            query.clone()
        } else {
            query.keys_only()
        };
        let mut it = self.run(ctx, &q);
        let mut n = 0;
        while it.next_key()?.is_some() {
            n += 1;
        }
        debug!(kind = %query.kind, count = n, "count");
        Ok(n)
    }

    /// Run `query`, appending one record per result to `dst`
    ///
    /// Keys-only queries leave `dst` untouched. A field mismatch does not stop
    /// collection; every row is still appended and the first mismatch is
    /// returned once the query is exhausted. Use [`Client::get_all_into`] to
    /// keep the keys when that happens.
    pub fn get_all<R: Record + Default>(
        &self,
        ctx: &Context,
        query: &Query,
        dst: &mut Vec<R>,
    ) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        self.get_all_into(ctx, query, dst, &mut keys)?;
        Ok(keys)
    }

    /// Like [`Client::get_all`], appending result keys to `keys`
    ///
    /// `keys` stays index-aligned with the records appended to `dst`, including
    /// when a field mismatch is reported.
    pub fn get_all_into<R: Record + Default>(
        &self,
        ctx: &Context,
        query: &Query,
        dst: &mut Vec<R>,
        keys: &mut Vec<Key>,
    ) -> Result<()> {
        let mut it = self.run(ctx, query);
        let mut mismatch = None;
        while let Some(row) = it.next_row()? {
            if !query.keys_only {
                let mut record = R::default();
                match keel_core::codec::decode(&row.entity, &mut record) {
                    Ok(()) => {}
                    Err(e @ Error::FieldMismatch(_)) => {
                        if mismatch.is_none() {
                            mismatch = Some(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
                dst.push(record);
            }
            keys.push(row.key);
        }
        match mismatch {
            Some(e) => {
                warn!(kind = %query.kind, rows = keys.len(), "field mismatch while collecting rows");
                Err(e)
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Begin a transaction driven by the caller
    pub fn new_transaction(&self, ctx: &Context, opts: TransactionOptions) -> Result<Transaction> {
        ctx.check()?;
        let mode = if opts.read_only {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        };
        let id = self.transport.begin_transaction(ctx, mode)?;
        debug!(txn = ?id, ?mode, "transaction started");
        Ok(Transaction::new(self.clone(), ctx.clone(), id, mode))
    }

    /// Run `work` inside a transaction, retrying on commit conflicts
    ///
    /// An error from `work` rolls the transaction back and is returned as-is.
    /// A conflicting commit starts over with a fresh transaction until the
    /// attempt budget is spent, then fails with
    /// `Error::ConcurrentTransaction`.
    pub fn run_in_transaction<F, E>(
        &self,
        ctx: &Context,
        opts: TransactionOptions,
        mut work: F,
    ) -> std::result::Result<Commit, E>
    where
        F: FnMut(&mut Transaction) -> std::result::Result<(), E>,
        E: From<Error>,
    {
        let attempts = opts.attempts_or(self.config.max_attempts);
        for attempt in 1..=attempts {
            let mut tx = self.new_transaction(ctx, opts)?;

            if let Err(e) = work(&mut tx) {
                if tx.is_active() {
                    if let Err(rollback_err) = tx.rollback() {
                        warn!(error = %rollback_err, "rollback after failed work");
                    }
                }
                return Err(e);
            }

            match tx.commit() {
                Ok(commit) => {
                    debug!(attempt, "transaction committed");
                    return Ok(commit);
                }
                Err(e) if e.is_conflict() => {
                    warn!(attempt, max_attempts = attempts, error = %e, "transaction conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::ConcurrentTransaction.into())
    }
}

/// Single-item wrappers report the error of their only slot.
fn first_slot_error(err: Error) -> Error {
    match err {
        Error::Multi(m) => m
            .into_inner()
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_else(|| Error::Transport("empty batch error".to_string())),
        other => other,
    }
}
