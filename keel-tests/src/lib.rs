/// Test utilities and helpers for Keel testing
///
/// Provides a client wired to a fresh in-memory backend, shared record types
/// used across the scenario tests, and one-time logging setup.

use anyhow::Context as _;
use keel_client::{
    Client, ClientConfig, Context, Key, PropertyReader, PropertyWriter, Record, Result,
};
use keel_memory::MemoryDatastore;
use std::sync::Once;

pub use keel_client as client;
pub use keel_core as core;

static LOGGING: Once = Once::new();

/// Install a `tracing` subscriber once per test binary.
///
/// Filter with `RUST_LOG`, e.g. `RUST_LOG=keel_client=debug`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Client over a private in-memory datastore
pub struct TestClient {
    pub client: Client,
    pub store: MemoryDatastore,
    pub ctx: Context,
}

impl TestClient {
    /// Create a client with default configuration
    pub fn new() -> Self {
        Self::with_store(MemoryDatastore::new(), ClientConfig::new().with_project_id("keel-test"))
    }

    /// Create a client with custom configuration (project id defaults to
    /// `keel-test` when unset)
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_store(MemoryDatastore::new(), config)
    }

    /// Create a client over a prepared store
    pub fn with_store(store: MemoryDatastore, mut config: ClientConfig) -> Self {
        init_logging();
        if config.project_id.is_empty() {
            config.project_id = "keel-test".to_string();
        }
        let client = Client::new(store.clone(), config).expect("Failed to create client");
        Self {
            client,
            store,
            ctx: Context::background(),
        }
    }

    /// Store one `SQChild` entity per record, each under `parent` with an
    /// allocated id, returning the stored keys in order
    pub fn put_children(
        &self,
        parent: Option<&Key>,
        children: &[SQChild],
    ) -> anyhow::Result<Vec<Key>> {
        let keys: Vec<Key> = children
            .iter()
            .map(|_| Key::incomplete("SQChild", parent))
            .collect();
        self.put_multi(&self.ctx, &keys, children)
            .with_context(|| format!("storing {} SQChild entities", children.len()))
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

/// Query test record: an integer plus two timestamps-as-integers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SQChild {
    pub i: i64,
    pub t: i64,
    pub u: i64,
    pub v: f64,
    pub j: i64,
}

impl Record for SQChild {
    fn save(&self, w: &mut PropertyWriter) -> Result<()> {
        w.field("I", &self.i)?;
        w.field("T", &self.t)?;
        w.field("U", &self.u)?;
        w.field("V", &self.v)?;
        w.field("J", &self.j)
    }

    fn load(&mut self, r: &mut PropertyReader<'_>) -> Result<()> {
        r.field("I", &mut self.i)?;
        r.field("T", &mut self.t)?;
        r.field("U", &mut self.u)?;
        r.field("V", &mut self.v)?;
        r.field("J", &mut self.j)
    }
}

impl SQChild {
    pub fn new(i: i64, t: i64) -> Self {
        Self {
            i,
            t,
            u: t,
            ..Default::default()
        }
    }
}

/// Sum of `I` over `children`
pub fn sum_i(children: &[SQChild]) -> i64 {
    children.iter().map(|c| c.i).sum()
}
