use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PolicySecretStore, Secret};
use crate::authorization::policy::Policy;

/// In-process store, for local runs without a management plane and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    policies: RwLock<Vec<Policy>>,
    secrets: RwLock<Vec<Secret>>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policies(&self, policies: Vec<Policy>) {
        *self.policies.write() = policies;
    }

    pub fn set_secrets(&self, secrets: Vec<Secret>) {
        *self.secrets.write() = secrets;
    }

    /// While set, every listing fails as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of full refreshes served (one per policy listing).
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicySecretStore for MemoryStore {
    async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.policies.read().clone())
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.secrets.read().clone())
    }
}
