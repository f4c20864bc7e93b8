/// In-memory datastore
///
/// Keeps every committed version of every entity, tagged with the commit
/// sequence number that wrote it. Transactions read the snapshot as of their
/// begin sequence and fail to commit if any key they read or write changed
/// after it. Read-time reads map an instant to the last commit at or before
/// it. Versions no open transaction and no read inside the retention window
/// can see are pruned on commit. All data is lost when the last handle is
/// dropped.

use crate::eval;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use keel_core::{
    CommitRequest, CommitResponse, Context, Entity, Error, Key, LookupRequest, LookupResponse,
    Mutation, MutationResult, QueryBatch, ReadOptions, Result, RunQueryRequest, TransactionId,
    TransactionMode, Transport,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keys served per lookup before the rest are deferred.
pub const DEFAULT_LOOKUP_BATCH: usize = 300;

/// Rows examined per query batch when the request does not set a page size.
pub const DEFAULT_PAGE_SIZE: usize = 300;

/// How far back read-time reads may go.
pub const DEFAULT_VERSION_RETENTION_SECS: i64 = 3600;

struct Version {
    seq: u64,
    /// `None` marks a delete
    entity: Option<Entity>,
}

struct Txn {
    begin_seq: u64,
    mode: TransactionMode,
    reads: HashSet<Key>,
}

struct Inner {
    entities: BTreeMap<Key, Vec<Version>>,
    txns: HashMap<TransactionId, Txn>,
    /// Sequence of the last commit
    seq: u64,
    /// `(seq, commit time)` per commit, strictly increasing in both
    commits: Vec<(u64, DateTime<Utc>)>,
    retention: Duration,
    next_id: i64,
    next_txn: u64,
}

impl Inner {
    /// Entity as of `at`, or the latest committed one.
    fn read(&self, key: &Key, at: Option<u64>) -> Option<&Entity> {
        let versions = self.entities.get(key)?;
        let version = match at {
            Some(seq) => versions.iter().rev().find(|v| v.seq <= seq)?,
            None => versions.last()?,
        };
        version.entity.as_ref()
    }

    fn modified_since(&self, key: &Key, seq: u64) -> bool {
        self.entities
            .get(key)
            .and_then(|v| v.last())
            .map_or(false, |v| v.seq > seq)
    }

    fn snapshot(&self, read: &ReadOptions) -> Result<Option<u64>> {
        match read {
            ReadOptions::Strong | ReadOptions::Eventual => Ok(None),
            ReadOptions::Transaction(id) => self
                .txns
                .get(id)
                .map(|t| Some(t.begin_seq))
                .ok_or_else(|| Error::InvalidArgument(format!("unknown transaction {:?}", id))),
            ReadOptions::ReadTime(at) => {
                if *at < self.retention_cutoff(Utc::now()) {
                    return Err(Error::InvalidArgument(format!(
                        "read time {} is older than the version retention window",
                        at
                    )));
                }
                Ok(Some(self.seq_at(*at)))
            }
        }
    }

    /// Oldest instant read-time reads may still ask for.
    fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Sequence of the last commit at or before `at`, 0 if none.
    fn seq_at(&self, at: DateTime<Utc>) -> u64 {
        let n = self.commits.partition_point(|(_, t)| *t <= at);
        if n == 0 {
            0
        } else {
            self.commits[n - 1].0
        }
    }

    /// Stamp the next commit, keeping commit times strictly increasing.
    fn commit_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.commits.last() {
            Some((_, last)) if *last >= now => *last + Duration::nanoseconds(1),
            _ => now,
        }
    }

    /// Drop versions of `keys` that no reader can reach any more.
    ///
    /// Readers never ask for a sequence below the horizon: the oldest open
    /// transaction's begin sequence, or the last commit before the retention
    /// cutoff. Each key keeps its newest version at or below the horizon.
    fn prune<'a>(&mut self, keys: impl IntoIterator<Item = &'a Key>, now: DateTime<Utc>) -> usize {
        let cutoff = self.retention_cutoff(now);
        let horizon = self
            .txns
            .values()
            .map(|t| t.begin_seq)
            .fold(self.seq_at(cutoff), u64::min);

        let mut pruned = 0;
        for key in keys {
            if let Some(versions) = self.entities.get_mut(key) {
                let visible = versions.partition_point(|v| v.seq <= horizon);
                if visible > 1 {
                    versions.drain(..visible - 1);
                    pruned += visible - 1;
                }
            }
        }

        // the commit log only needs its last entry before the cutoff
        let stale = self.commits.partition_point(|(_, t)| *t <= cutoff);
        if stale > 1 {
            self.commits.drain(..stale - 1);
        }
        pruned
    }

    fn record_reads(&mut self, read: &ReadOptions, keys: impl IntoIterator<Item = Key>) {
        if let ReadOptions::Transaction(id) = read {
            if let Some(txn) = self.txns.get_mut(id) {
                txn.reads.extend(keys);
            }
        }
    }

    fn allocate(&mut self, key: &Key) -> Key {
        loop {
            let candidate = key.with_id(self.next_id);
            self.next_id += 1;
            if !self.entities.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// In-memory [`Transport`] backend
#[derive(Clone)]
pub struct MemoryDatastore {
    inner: Arc<RwLock<Inner>>,
    lookup_batch: usize,
    page_size: usize,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    /// Create an empty datastore
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entities: BTreeMap::new(),
                txns: HashMap::new(),
                seq: 0,
                commits: Vec::new(),
                retention: Duration::seconds(DEFAULT_VERSION_RETENTION_SECS),
                next_id: 1,
                next_txn: 1,
            })),
            lookup_batch: DEFAULT_LOOKUP_BATCH,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set how many keys one lookup serves before deferring the rest
    pub fn with_lookup_batch(mut self, keys: usize) -> Self {
        self.lookup_batch = keys.max(1);
        self
    }

    /// Set the default number of rows examined per query batch
    pub fn with_page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    /// Set how far back read-time reads may go; older versions are pruned
    pub fn with_version_retention(self, retention: Duration) -> Self {
        self.inner.write().retention = retention.max(Duration::zero());
        self
    }

    /// Number of stored versions, deletes included
    pub fn versions(&self) -> usize {
        self.inner.read().entities.values().map(Vec::len).sum()
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner
            .entities
            .values()
            .filter(|v| v.last().map_or(false, |v| v.entity.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entities and open transactions
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entities.clear();
        inner.txns.clear();
        inner.commits.clear();
    }

    /// Number of transactions begun but not yet committed or rolled back
    pub fn open_transactions(&self) -> usize {
        self.inner.read().txns.len()
    }
}

impl Transport for MemoryDatastore {
    fn lookup(&self, ctx: &Context, req: LookupRequest) -> Result<LookupResponse> {
        ctx.check()?;
        if let Some(key) = req.keys.iter().find(|k| k.validate_complete().is_err()) {
            return Err(Error::InvalidArgument(format!("cannot look up key {}", key)));
        }

        let mut inner = self.inner.write();
        let at = inner.snapshot(&req.read)?;

        let split = req.keys.len().min(self.lookup_batch);
        let mut resp = LookupResponse {
            deferred: req.keys[split..].to_vec(),
            ..Default::default()
        };
        for key in &req.keys[..split] {
            match inner.read(key, at) {
                Some(entity) => {
                    let mut entity = entity.clone();
                    entity.key = Some(key.clone());
                    resp.found.push(entity);
                }
                None => resp.missing.push(key.clone()),
            }
        }
        inner.record_reads(&req.read, req.keys[..split].iter().cloned());

        debug!(
            found = resp.found.len(),
            missing = resp.missing.len(),
            deferred = resp.deferred.len(),
            "lookup"
        );
        Ok(resp)
    }

    fn run_query(&self, ctx: &Context, req: RunQueryRequest) -> Result<QueryBatch> {
        ctx.check()?;
        let mut inner = self.inner.write();
        let at = inner.snapshot(&req.read)?;
        let page_size = if req.page_size == 0 {
            self.page_size
        } else {
            req.page_size
        };

        let visible = inner
            .entities
            .keys()
            .filter_map(|k| inner.read(k, at).map(|e| (k, e)));
        let (batch, matched) = eval::run_batch(visible, &req.query, &req.partition.namespace, page_size)?;
        inner.record_reads(&req.read, matched);

        debug!(
            kind = %req.query.kind,
            results = batch.results.len(),
            skipped = batch.skipped_results,
            more = ?batch.more_results,
            "query batch"
        );
        Ok(batch)
    }

    fn begin_transaction(&self, ctx: &Context, mode: TransactionMode) -> Result<TransactionId> {
        ctx.check()?;
        let mut inner = self.inner.write();
        let id = TransactionId(Bytes::copy_from_slice(&inner.next_txn.to_be_bytes()));
        inner.next_txn += 1;
        let txn = Txn {
            begin_seq: inner.seq,
            mode,
            reads: HashSet::new(),
        };
        inner.txns.insert(id.clone(), txn);
        debug!(txn = ?id, ?mode, "begin transaction");
        Ok(id)
    }

    fn commit(&self, ctx: &Context, req: CommitRequest) -> Result<CommitResponse> {
        ctx.check()?;
        let mut inner = self.inner.write();

        let txn = match &req.transaction {
            Some(id) => Some(
                inner
                    .txns
                    .remove(id)
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown transaction {:?}", id)))?,
            ),
            None => None,
        };

        if let Some(txn) = &txn {
            if txn.mode == TransactionMode::ReadOnly && !req.mutations.is_empty() {
                return Err(Error::InvalidArgument(
                    "read-only transaction cannot write".to_string(),
                ));
            }
            let touched = txn.reads.iter().chain(req.mutations.iter().map(|m| m.key()));
            for key in touched {
                if inner.modified_since(key, txn.begin_seq) {
                    warn!(key = %key, "transaction conflict");
                    return Err(Error::Conflict(format!(
                        "entity {} was modified by another writer",
                        key
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for m in &req.mutations {
            m.validate().map_err(|e| Error::InvalidArgument(e.to_string()))?;
            if m.key().is_complete() && !seen.insert(m.key().clone()) {
                return Err(Error::InvalidArgument(format!(
                    "multiple mutations of entity {} in one commit",
                    m.key()
                )));
            }
            let exists = inner.read(m.key(), None).is_some();
            match m {
                Mutation::Insert { key, .. } if exists => {
                    return Err(Error::AlreadyExists(format!("entity {} already exists", key)))
                }
                Mutation::Update { key, .. } if !exists => {
                    return Err(Error::NotFound(format!("entity {} does not exist", key)))
                }
                _ => {}
            }
        }

        let commit_time = inner.commit_time();
        inner.seq += 1;
        let seq = inner.seq;
        inner.commits.push((seq, commit_time));
        let mut resp = CommitResponse {
            commit_time: Some(commit_time),
            ..Default::default()
        };
        for mut m in req.mutations {
            if m.key().is_incomplete() {
                let allocated = inner.allocate(m.key());
                m.set_key(allocated);
            }
            let key = m.key().clone();
            let entity = match m {
                Mutation::Insert { entity, .. }
                | Mutation::Update { entity, .. }
                | Mutation::Upsert { entity, .. } => {
                    resp.index_updates += entity.properties.iter().filter(|p| p.indexed).count() as i32;
                    Some(entity)
                }
                Mutation::Delete { .. } => None,
            };
            inner
                .entities
                .entry(key.clone())
                .or_default()
                .push(Version { seq, entity });
            resp.mutation_results.push(MutationResult { key });
        }
        let pruned = inner.prune(resp.mutation_results.iter().map(|r| &r.key), commit_time);

        debug!(
            seq,
            mutations = resp.mutation_results.len(),
            pruned,
            transactional = txn.is_some(),
            "commit"
        );
        Ok(resp)
    }

    fn rollback(&self, ctx: &Context, txn: &TransactionId) -> Result<()> {
        ctx.check()?;
        let mut inner = self.inner.write();
        match inner.txns.remove(txn) {
            Some(_) => {
                debug!(txn = ?txn, "rollback");
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("unknown transaction {:?}", txn))),
        }
    }

    fn allocate_ids(&self, ctx: &Context, keys: Vec<Key>) -> Result<Vec<Key>> {
        ctx.check()?;
        for key in &keys {
            key.validate().map_err(|e| Error::InvalidArgument(e.to_string()))?;
            if key.is_complete() {
                return Err(Error::InvalidArgument(format!(
                    "cannot allocate an id for complete key {}",
                    key
                )));
            }
        }
        let mut inner = self.inner.write();
        Ok(keys.iter().map(|k| inner.allocate(k)).collect())
    }
}
