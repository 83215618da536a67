//! Application state management for the collector.
//!
//! This module defines the shared state passed to HTTP handlers and to the
//! ingestion middleware.

use std::sync::Arc;

use ipnet::IpNet;
use prometheus::Registry;
use rsa::RsaPrivateKey;

use crate::handlers::ApiError;
use crate::metrics::ServerMetrics;
use crate::storage::Storage;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Collector state shared across requests.
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub registry: Registry,
    pub metrics: ServerMetrics,
    /// HMAC key for request verification and response signing.
    pub hash_key: Option<String>,
    pub private_key: Option<RsaPrivateKey>,
    pub trusted_subnet: Option<IpNet>,
}

impl AppState {
    /// State with a fresh registry and no security filters.
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let metrics = ServerMetrics::new(&registry)?;
        Ok(Self {
            storage,
            registry,
            metrics,
            hash_key: None,
            private_key: None,
            trusted_subnet: None,
        })
    }

    pub fn with_hash_key(mut self, key: Option<String>) -> Self {
        self.hash_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_private_key(mut self, key: Option<RsaPrivateKey>) -> Self {
        self.private_key = key;
        self
    }

    pub fn with_trusted_subnet(mut self, subnet: Option<IpNet>) -> Self {
        self.trusted_subnet = subnet;
        self
    }

    /// Counts a rejected request and hands the error back.
    pub fn reject(&self, error: ApiError) -> ApiError {
        self.metrics.record_rejected(error.reason());
        error
    }
}
