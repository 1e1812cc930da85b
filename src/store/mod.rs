//! Local copy of the management plane's policies and secrets.

pub mod bus;
pub mod http_store;
pub mod load;
pub mod memory;
pub mod notification;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::authorization::policy::{CompiledPolicy, Policy};

/// Symmetric key used to verify bearer tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub username: String,
    pub id: String,
    pub key: String,
    /// Absolute epoch seconds, 0 = never.
    #[serde(default)]
    pub expires: i64,
}

/// Source of truth the cache refreshes from.
#[async_trait]
pub trait PolicySecretStore: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<Policy>>;
    async fn list_secrets(&self) -> Result<Vec<Secret>>;
}

/// One complete, immutable generation of the cache.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
    policies: Vec<Arc<CompiledPolicy>>,
    by_subject: HashMap<String, Vec<usize>>,
    pattern_subjects: Vec<usize>,
    secrets: HashMap<String, Secret>,
}

impl Snapshot {
    pub fn build(generation: u64, policies: Vec<Policy>, secrets: Vec<Secret>) -> Self {
        let mut compiled = Vec::with_capacity(policies.len());
        for policy in policies {
            let id = policy.id.clone();
            match CompiledPolicy::compile(policy) {
                Ok(p) => compiled.push(Arc::new(p)),
                Err(err) => warn!(policy = %id, error = %err, "skipping policy that does not compile"),
            }
        }

        let mut by_subject: HashMap<String, Vec<usize>> = HashMap::new();
        let mut pattern_subjects = Vec::new();
        for (idx, policy) in compiled.iter().enumerate() {
            for subject in policy.literal_subjects() {
                let slot = by_subject.entry(subject.to_string()).or_default();
                if slot.last() != Some(&idx) {
                    slot.push(idx);
                }
            }
            if policy.has_pattern_subject() {
                pattern_subjects.push(idx);
            }
        }

        let secrets = secrets.into_iter().map(|s| (s.id.clone(), s)).collect();

        Self {
            generation,
            loaded_at: Some(Utc::now()),
            policies: compiled,
            by_subject,
            pattern_subjects,
            secrets,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn policies(&self) -> &[Arc<CompiledPolicy>] {
        &self.policies
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    /// Policies that can apply to `subject`, in snapshot order.
    pub fn candidates(&self, subject: &str) -> Vec<Arc<CompiledPolicy>> {
        let literal = self.by_subject.get(subject).map(Vec::as_slice).unwrap_or_default();
        let mut idx: Vec<usize> = literal
            .iter()
            .chain(self.pattern_subjects.iter())
            .copied()
            .collect();
        idx.sort_unstable();
        idx.dedup();
        idx.into_iter().map(|i| self.policies[i].clone()).collect()
    }

    pub fn secret(&self, kid: &str) -> Option<&Secret> {
        self.secrets.get(kid)
    }
}

/// Owns the current snapshot and swaps it wholesale on reload.
pub struct PolicyCache {
    store: Arc<dyn PolicySecretStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    reload_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl PolicyCache {
    pub fn new(store: Arc<dyn PolicySecretStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            reload_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot; stays valid even if a reload swaps it out.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn get_secret(&self, kid: &str) -> Option<Secret> {
        self.snapshot.read().secret(kid).cloned()
    }

    /// Fetch everything from the store and replace the snapshot. On error the
    /// previous snapshot stays in place.
    pub async fn reload(&self) -> Result<()> {
        let _serialized = self.reload_lock.lock().await;

        let policies = self.store.list_policies().await.context("listing policies")?;
        let secrets = self.store.list_secrets().await.context("listing secrets")?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new(Snapshot::build(generation, policies, secrets));
        debug!(
            generation,
            policies = next.policies().len(),
            secrets = next.secret_count(),
            "swapping cache snapshot"
        );
        *self.snapshot.write() = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::policy::Effect;
    use memory::MemoryStore;

    fn policy(id: &str, subjects: &[&str]) -> Policy {
        Policy {
            id: id.to_string(),
            description: String::new(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            resources: vec!["*".to_string()],
            actions: vec!["*".to_string()],
            effect: Effect::Allow,
            conditions: HashMap::new(),
        }
    }

    fn secret(id: &str) -> Secret {
        Secret {
            username: "alice".to_string(),
            id: id.to_string(),
            key: "k".to_string(),
            expires: 0,
        }
    }

    #[test]
    fn test_candidates_use_subject_index() {
        let snap = Snapshot::build(
            1,
            vec![
                policy("a", &["alice"]),
                policy("b", &["bob"]),
                policy("c", &["users:<.*>"]),
                policy("d", &["alice", "bob"]),
            ],
            vec![],
        );
        let ids: Vec<_> = snap.candidates("alice").iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);

        let ids: Vec<_> = snap.candidates("nobody").iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_uncompilable_policy_skipped() {
        let snap = Snapshot::build(1, vec![policy("bad", &["<("]), policy("ok", &["x"])], vec![]);
        assert_eq!(snap.policies().len(), 1);
        assert_eq!(snap.policies()[0].id(), "ok");
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.set_policies(vec![policy("a", &["alice"])]);
        store.set_secrets(vec![secret("kid-1")]);
        let cache = PolicyCache::new(store.clone());

        cache.reload().await.unwrap();
        assert_eq!(cache.snapshot().generation(), 1);

        store.set_failing(true);
        assert!(cache.reload().await.is_err());

        let snap = cache.snapshot();
        assert_eq!(snap.generation(), 1);
        assert_eq!(snap.policies().len(), 1);
        assert!(cache.get_secret("kid-1").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_mixed_generations() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(PolicyCache::new(store.clone()));

        let generation_set = |g: usize| -> Vec<Policy> {
            (0..50).map(|i| policy(&format!("g{g}-{i}"), &["<.*>"])).collect()
        };
        store.set_policies(generation_set(0));
        cache.reload().await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..2000 {
                    let snap = cache.snapshot();
                    let candidates = snap.candidates("anyone");
                    assert_eq!(candidates.len(), 50);
                    let prefix = candidates[0].id().split('-').next().unwrap().to_string();
                    assert!(candidates.iter().all(|p| p.id().starts_with(&format!("{prefix}-"))));
                    tokio::task::yield_now().await;
                }
            }));
        }

        for g in 1..30 {
            store.set_policies(generation_set(g));
            cache.reload().await.unwrap();
            tokio::task::yield_now().await;
        }

        for r in readers {
            r.await.unwrap();
        }
    }
}
