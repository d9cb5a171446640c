//! Proxy Configuration
//!
//! All tunables consumed by the core are collected in [`ProxyConfig`].
//! The struct is filled in by the CLI layer (see `main.rs`) and handed to
//! [`crate::server::Proxy::start`]; nothing in the core reads the
//! environment or arguments directly.

use thiserror::Error;

/// Largest `set` payload accepted from a client, in bytes.
pub const DEFAULT_MAX_DATA_SIZE: usize = 4096;

/// Slack added on top of the payload for the request line itself.
pub const REQUEST_BUFFER_SLACK: usize = 1024;

/// Default upper bound on keys in one multi-key `get`.
pub const DEFAULT_MAX_KEYS: usize = 12;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 8;

/// Errors produced by [`ProxyConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one backend address is required")]
    NoBackends,

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("max keys per request must be at least 1")]
    NoKeys,

    #[error("invalid backend address: {0}")]
    BadBackendAddress(String),
}

/// Configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on, `host:port`.
    pub listen: String,

    /// Backend memcached addresses, `host:port`, in shard order.
    pub backends: Vec<String>,

    /// Number of worker tasks in the pool.
    pub workers: usize,

    /// Whether multi-key gets are sharded across all backends.
    pub sharded_get: bool,

    /// Maximum number of keys accepted in one `get` request.
    pub max_keys: usize,

    /// Maximum `set` payload size in bytes.
    pub max_data_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: format!("{}:{}", crate::DEFAULT_HOST, crate::DEFAULT_PORT),
            backends: Vec::new(),
            workers: DEFAULT_WORKERS,
            sharded_get: false,
            max_keys: DEFAULT_MAX_KEYS,
            max_data_size: DEFAULT_MAX_DATA_SIZE,
        }
    }
}

impl ProxyConfig {
    /// Size of the per-connection request buffer: one full request line
    /// plus the largest payload.
    pub fn request_buffer_size(&self) -> usize {
        self.max_data_size + REQUEST_BUFFER_SLACK
    }

    /// Size of the per-connection reply buffer. A reply to a multi-key get
    /// can carry one value per requested key.
    pub fn reply_buffer_size(&self) -> usize {
        self.request_buffer_size() * self.max_keys
    }

    /// Number of configured backends.
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Checks the configuration for values the core cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_keys == 0 {
            return Err(ConfigError::NoKeys);
        }
        for addr in &self.backends {
            // host:port, port numeric
            let valid = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::BadBackendAddress(addr.clone()));
            }
        }
        Ok(())
    }
}
