/// Integration tests for the Keel client
///
/// These drive the client through a transport that wraps the in-memory
/// backend, so the tests can observe and shape every request the client
/// sends.

use keel_client::{Client, ClientConfig, Context, Entity, Error, Key, Query, TransactionOptions};
use keel_core::{
    CommitRequest, CommitResponse, LookupRequest, LookupResponse, QueryBatch, RunQueryRequest,
    TransactionId, TransactionMode, Transport,
};
use keel_memory::MemoryDatastore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Forwards to a memory store, counting calls and optionally failing commits
#[derive(Default)]
struct RecordingTransport {
    inner: MemoryDatastore,
    lookups: AtomicUsize,
    largest_lookup: AtomicUsize,
    queries: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    /// Commits still to reject with a conflict
    conflicts: AtomicUsize,
    /// Defer every lookup key without resolving any
    stall_lookups: bool,
}

impl Transport for RecordingTransport {
    fn lookup(&self, ctx: &Context, req: LookupRequest) -> keel_core::Result<LookupResponse> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.largest_lookup.fetch_max(req.keys.len(), Ordering::SeqCst);
        if self.stall_lookups {
            return Ok(LookupResponse {
                deferred: req.keys,
                ..Default::default()
            });
        }
        self.inner.lookup(ctx, req)
    }

    fn run_query(&self, ctx: &Context, req: RunQueryRequest) -> keel_core::Result<QueryBatch> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.run_query(ctx, req)
    }

    fn begin_transaction(&self, ctx: &Context, mode: TransactionMode) -> keel_core::Result<TransactionId> {
        self.inner.begin_transaction(ctx, mode)
    }

    fn commit(&self, ctx: &Context, req: CommitRequest) -> keel_core::Result<CommitResponse> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if req.transaction.is_some()
            && self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            if let Some(txn) = &req.transaction {
                self.inner.rollback(ctx, txn)?;
            }
            return Err(Error::Conflict("injected".to_string()));
        }
        self.inner.commit(ctx, req)
    }

    fn rollback(&self, ctx: &Context, txn: &TransactionId) -> keel_core::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback(ctx, txn)
    }

    fn allocate_ids(&self, ctx: &Context, keys: Vec<Key>) -> keel_core::Result<Vec<Key>> {
        self.inner.allocate_ids(ctx, keys)
    }
}

fn setup(transport: RecordingTransport, config: ClientConfig) -> (Client, Arc<RecordingTransport>) {
    let transport = Arc::new(transport);
    let client = Client::with_transport(transport.clone(), config.with_project_id("it")).unwrap();
    (client, transport)
}

fn entities(n: usize) -> (Vec<Key>, Vec<Entity>) {
    let keys = (0..n).map(|i| Key::id_key("Item", i as i64 + 1, None)).collect();
    let rows = (0..n).map(|i| Entity::new().set("I", i as i64)).collect();
    (keys, rows)
}

#[test]
fn test_lookup_is_chunked() -> anyhow::Result<()> {
    let (client, transport) = setup(
        RecordingTransport::default(),
        ClientConfig::new().with_max_lookup_keys(10),
    );
    let ctx = Context::background();
    let (keys, rows) = entities(25);
    client.put_multi(&ctx, &keys, &rows)?;

    let mut dst = vec![Entity::new(); 25];
    client.get_multi(&ctx, &keys, &mut dst)?;
    assert_eq!(transport.lookups.load(Ordering::SeqCst), 3);
    assert_eq!(transport.largest_lookup.load(Ordering::SeqCst), 10);
    for (i, e) in dst.iter().enumerate() {
        assert_eq!(e.get("I").and_then(|v| v.as_int()), Some(i as i64));
    }
    Ok(())
}

#[test]
fn test_deferred_keys_are_fetched_again() -> anyhow::Result<()> {
    let (client, transport) = setup(
        RecordingTransport {
            inner: MemoryDatastore::new().with_lookup_batch(4),
            ..Default::default()
        },
        ClientConfig::new(),
    );
    let ctx = Context::background();
    let (keys, rows) = entities(10);
    client.put_multi(&ctx, &keys, &rows)?;

    let mut dst = vec![Entity::new(); 10];
    client.get_multi(&ctx, &keys, &mut dst)?;
    assert_eq!(transport.lookups.load(Ordering::SeqCst), 3);
    assert!(dst.iter().all(|e| e.get("I").is_some()));
    Ok(())
}

#[test]
fn test_lookup_without_progress_fails() -> anyhow::Result<()> {
    let (client, transport) = setup(
        RecordingTransport {
            stall_lookups: true,
            ..Default::default()
        },
        ClientConfig::new(),
    );
    let ctx = Context::background();
    let (keys, rows) = entities(3);
    client.put_multi(&ctx, &keys, &rows)?;

    let mut dst = vec![Entity::new(); 3];
    let err = client.get_multi(&ctx, &keys, &mut dst).unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {}", err);
    assert_eq!(transport.lookups.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_duplicate_keys_are_looked_up_once() -> anyhow::Result<()> {
    let (client, transport) = setup(RecordingTransport::default(), ClientConfig::new());
    let ctx = Context::background();
    let key = Key::name_key("Item", "dup", None);
    client.put(&ctx, &key, &Entity::new().set("I", 3))?;

    let keys = vec![key.clone(), key.clone(), key];
    let mut dst = vec![Entity::new(); 3];
    client.get_multi(&ctx, &keys, &mut dst)?;
    assert_eq!(transport.largest_lookup.load(Ordering::SeqCst), 1);
    assert!(dst.iter().all(|e| e.get("I").and_then(|v| v.as_int()) == Some(3)));
    Ok(())
}

#[test]
fn test_validation_fails_before_any_request() {
    let (client, transport) = setup(RecordingTransport::default(), ClientConfig::new());
    let ctx = Context::background();

    let mut dst = vec![Entity::new(); 2];
    let keys = [Key::name_key("Item", "a", None), Key::incomplete("Item", None)];
    let err = client.get_multi(&ctx, &keys, &mut dst).unwrap_err();
    let multi = err.as_multi().expect("positional error");
    assert!(multi.get(0).is_none());
    assert!(matches!(multi.get(1), Some(Error::InvalidKey(_))));

    let mut it = client.run(&ctx, &Query::new("Item").offset(-1));
    assert!(it.next_key().is_err());

    assert_eq!(transport.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 0);
}

#[test]
fn test_conflicts_are_retried() -> anyhow::Result<()> {
    let (client, transport) = setup(
        RecordingTransport {
            conflicts: AtomicUsize::new(2),
            ..Default::default()
        },
        ClientConfig::new(),
    );
    let ctx = Context::background();
    let key = Key::name_key("Item", "retried", None);

    let mut runs = 0;
    client.run_in_transaction(&ctx, TransactionOptions::new(), |tx| {
        runs += 1;
        tx.put(&key, &Entity::new().set("Run", runs)).map(|_| ())
    })?;
    assert_eq!(runs, 3);
    assert_eq!(transport.commits.load(Ordering::SeqCst), 3);

    let mut got = Entity::new();
    client.get(&ctx, &key, &mut got)?;
    assert_eq!(got.get("Run").and_then(|v| v.as_int()), Some(3));
    Ok(())
}

#[test]
fn test_work_error_rolls_back() {
    let (client, transport) = setup(RecordingTransport::default(), ClientConfig::new());
    let ctx = Context::background();

    let res: std::result::Result<_, anyhow::Error> =
        client.run_in_transaction(&ctx, TransactionOptions::new(), |tx| {
            tx.put(&Key::name_key("Item", "x", None), &Entity::new())?;
            Err(anyhow::anyhow!("bang"))
        });
    assert_eq!(res.unwrap_err().to_string(), "bang");
    assert_eq!(transport.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(transport.commits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_exhausted_attempts() {
    let (client, transport) = setup(
        RecordingTransport {
            conflicts: AtomicUsize::new(usize::MAX),
            ..Default::default()
        },
        ClientConfig::new().with_max_attempts(2),
    );
    let ctx = Context::background();
    let err = client
        .run_in_transaction(&ctx, TransactionOptions::new(), |tx| {
            tx.delete(&Key::name_key("Item", "x", None))
        })
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentTransaction));
    assert_eq!(transport.commits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_count_uses_keys_only_batches() -> anyhow::Result<()> {
    let (client, transport) = setup(
        RecordingTransport {
            inner: MemoryDatastore::new().with_page_size(10),
            ..Default::default()
        },
        ClientConfig::new(),
    );
    let ctx = Context::background();
    let (keys, rows) = entities(35);
    client.put_multi(&ctx, &keys, &rows)?;

    assert_eq!(client.count(&ctx, &Query::new("Item"))?, 35);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 4);
    Ok(())
}
