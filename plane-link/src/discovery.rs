//! Service discovery.
//!
//! A scan returns addresses advertising the shareplane service within a
//! time window. Candidates are only hints: the orchestrator still probes
//! each one before committing to it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::transport::MemoryNetwork;

/// Discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The platform refused the radio or network permission.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// The scan could not run.
    #[error("scan failed: {0}")]
    Failed(String),
}

/// Finds addresses that may host a Master.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Scan for up to `window` and return candidate addresses, best first.
    ///
    /// An empty list is a successful scan that found nothing.
    async fn scan(&self, window: Duration) -> Result<Vec<String>, DiscoveryError>;
}

/// Fixed candidate list, e.g. from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    candidates: Vec<String>,
}

impl StaticDiscovery {
    /// Discovery that always returns `candidates`.
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn scan(&self, _window: Duration) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.candidates.clone())
    }
}

/// Listening addresses on the network, in address order.
#[async_trait]
impl Discovery for MemoryNetwork {
    async fn scan(&self, _window: Duration) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.listening_addresses())
    }
}
