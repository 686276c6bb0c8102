//! Runtime configuration.
//!
//! Loaded from a JSON host file (`rpc.json`) and overridable from the
//! environment.

use clio_cluster::Protocol;
use clio_core::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the pool size
pub const WORKERS_ENV: &str = "CLIO_WORKERS";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid JSON for this shape
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds an unusable value
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Field name
        field: String,
        /// Why it was rejected
        reason: String,
    },
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { field, reason } => CoreError::Validation { field, reason },
            other => CoreError::Validation {
                field: "config".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// A host to pre-connect through the channel cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Protocol name (`thread`, `ipc`, `tcp`)
    pub protocol: String,
    /// Host, address or socket path
    pub destination: String,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pool size; hardware concurrency when unset
    pub workers: Option<usize>,
    /// Skip invoking `main`
    pub no_main: bool,
    /// Argument vector for `main`; the process arguments when unset
    pub argv: Option<Vec<String>>,
    /// Hosts to pre-connect
    pub servers: Vec<EndpointConfig>,
    /// Worker threads are named `{prefix}-{index}`
    pub worker_thread_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            no_main: false,
            argv: None,
            servers: Vec::new(),
            worker_thread_prefix: "clio-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pool size
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Skip `main`
    #[must_use]
    pub fn with_no_main(mut self, no_main: bool) -> Self {
        self.no_main = no_main;
        self
    }

    /// Set the argument vector
    #[must_use]
    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = Some(argv);
        self
    }

    /// Add a host to pre-connect
    #[must_use]
    pub fn with_server(mut self, protocol: impl Into<String>, destination: impl Into<String>) -> Self {
        self.servers.push(EndpointConfig {
            protocol: protocol.into(),
            destination: destination.into(),
        });
        self
    }

    /// Set the worker thread name prefix
    #[must_use]
    pub fn with_worker_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_thread_prefix = prefix.into();
        self
    }

    /// Parse from JSON text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a JSON host file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an override is not a valid value.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`
    ///
    /// # Errors
    ///
    /// Returns error if an override is not a valid value.
    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(WORKERS_ENV) {
            let workers = raw.trim().parse::<usize>().map_err(|_| ConfigError::Invalid {
                field: WORKERS_ENV.to_string(),
                reason: format!("not a worker count: {raw}"),
            })?;
            self.workers = Some(workers);
        }
        Ok(self)
    }

    /// Check field values
    ///
    /// # Errors
    ///
    /// Rejects a pool size of zero and unknown server protocols.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for server in &self.servers {
            if server.protocol.parse::<Protocol>().is_err() {
                return Err(ConfigError::Invalid {
                    field: "servers".to_string(),
                    reason: format!("unknown protocol: {}", server.protocol),
                });
            }
        }
        Ok(())
    }

    /// Pool size to spawn
    #[must_use]
    pub fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}
