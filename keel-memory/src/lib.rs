//! In-memory backend for the Keel client.
//!
//! [`MemoryDatastore`] implements [`keel_core::Transport`] against a
//! process-local versioned store. Use it for tests and local development:
//!
//! ```ignore
//! let client = Client::new(MemoryDatastore::new(), ClientConfig::new().with_project_id("dev"))?;
//! ```

mod eval;
pub mod store;

pub use store::{MemoryDatastore, DEFAULT_LOOKUP_BATCH, DEFAULT_PAGE_SIZE};
