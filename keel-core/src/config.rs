use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming the project.
pub const PROJECT_ID_ENV: &str = "DATASTORE_PROJECT_ID";

/// Environment variable naming the default namespace.
pub const NAMESPACE_ENV: &str = "DATASTORE_NAMESPACE";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project every key and request is scoped to
    pub project_id: String,

    /// Namespace applied to keys and queries that do not set one
    pub namespace: String,

    /// Maximum commit attempts per transaction run
    pub max_attempts: u32,

    /// Maximum keys per lookup request
    pub max_lookup_keys: usize,

    /// Page size requested from the backend (0 = backend default)
    pub query_batch_size: usize,

    /// Use eventually consistent reads outside transactions
    pub eventual_reads: bool,

    /// Read data as of this instant outside transactions
    pub read_time: Option<DateTime<Utc>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            namespace: String::new(),
            max_attempts: 3,
            max_lookup_keys: 1000,
            query_batch_size: 0,
            eventual_reads: false,
            read_time: None,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `DATASTORE_PROJECT_ID` and
    /// `DATASTORE_NAMESPACE`.
    pub fn from_env() -> Result<Self> {
        let project_id = std::env::var(PROJECT_ID_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "project id could not be detected from the environment, set {}",
                    PROJECT_ID_ENV
                ))
            })?;
        let namespace = std::env::var(NAMESPACE_ENV).unwrap_or_default();

        let config = Self::new().with_project_id(project_id).with_namespace(namespace);
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ClientConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set maximum commit attempts per transaction run
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set maximum keys per lookup request
    pub fn with_max_lookup_keys(mut self, keys: usize) -> Self {
        self.max_lookup_keys = keys;
        self
    }

    pub fn with_query_batch_size(mut self, size: usize) -> Self {
        self.query_batch_size = size;
        self
    }

    pub fn with_eventual_reads(mut self, eventual: bool) -> Self {
        self.eventual_reads = eventual;
        self
    }

    /// Serve reads outside transactions as of `read_time`
    pub fn with_read_time(mut self, read_time: DateTime<Utc>) -> Self {
        self.read_time = Some(read_time);
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(Error::Config("project id must not be empty".to_string()));
        }

        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be greater than 0".to_string()));
        }

        if self.max_lookup_keys == 0 {
            return Err(Error::Config("max_lookup_keys must be greater than 0".to_string()));
        }

        Ok(())
    }
}

/// Per-call transaction options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_only: bool,

    /// Commit attempts for this run (0 = use the client's configured value)
    pub max_attempts: u32,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the transaction in read-only mode; writes are rejected.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Attempts to make, falling back to `default` when unset.
    pub fn attempts_or(&self, default: u32) -> u32 {
        if self.max_attempts == 0 {
            default
        } else {
            self.max_attempts
        }
    }
}
