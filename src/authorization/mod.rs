//! Deny-overrides evaluation of access requests against the cached policy set.

pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::analytics::{Analytics, AnalyticsRecord};
use crate::store::PolicyCache;
use policy::{CompiledPolicy, Effect};

/// Context key that always carries the authenticated caller.
pub const USERNAME_KEY: &str = "username";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub subject: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl AccessRequest {
    pub fn new(
        subject: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            resource: resource.into(),
            action: action.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Bind the authenticated caller so policies can reference it.
    #[must_use]
    pub fn with_identity(self, username: &str) -> Self {
        self.with_context_value(USERNAME_KEY, Value::String(username.to_string()))
    }

    pub fn username(&self) -> &str {
        self.context
            .get(USERNAME_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(default)]
    pub reason: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Evaluates requests over the local snapshot and forwards every outcome to
/// the audit pipeline.
#[derive(Clone)]
pub struct Authorizer {
    cache: Arc<PolicyCache>,
    analytics: Option<Arc<Analytics>>,
    record_expiration_secs: i64,
}

impl Authorizer {
    pub fn new(cache: Arc<PolicyCache>) -> Self {
        Self {
            cache,
            analytics: None,
            record_expiration_secs: 0,
        }
    }

    #[must_use]
    pub fn with_analytics(mut self, analytics: Arc<Analytics>, expiration_secs: i64) -> Self {
        self.analytics = Some(analytics);
        self.record_expiration_secs = expiration_secs;
        self
    }

    pub fn evaluate(&self, request: &AccessRequest) -> Decision {
        let snapshot = self.cache.snapshot();
        let candidates = snapshot.candidates(&request.subject);
        let matched: Vec<&Arc<CompiledPolicy>> =
            candidates.iter().filter(|p| p.matches(request)).collect();

        let (decision, deciders) = match matched.iter().find(|p| p.effect() == Effect::Deny) {
            Some(deny) => (
                Decision::deny(format!("request was denied by policy {}", deny.id())),
                vec![*deny],
            ),
            None if matched.is_empty() => (Decision::deny("request was denied by default"), vec![]),
            None => (Decision::allow(), matched),
        };

        debug!(
            subject = %request.subject,
            resource = %request.resource,
            action = %request.action,
            candidates = candidates.len(),
            allowed = decision.allowed,
            "evaluated access request"
        );

        self.audit(request, &candidates, &deciders, &decision);
        decision
    }

    fn audit(
        &self,
        request: &AccessRequest,
        candidates: &[Arc<CompiledPolicy>],
        deciders: &[&Arc<CompiledPolicy>],
        decision: &Decision,
    ) {
        let Some(analytics) = self.analytics.as_ref() else {
            return;
        };

        let conclusion = if decision.allowed {
            let ids: Vec<&str> = deciders.iter().map(|p| p.id()).collect();
            format!("policies {} allow access", ids.join(", "))
        } else {
            decision.reason.clone()
        };
        let effect = if decision.allowed { Effect::Allow } else { Effect::Deny };

        let record = AnalyticsRecord::new(
            request.username(),
            effect.as_str(),
            conclusion,
            serde_json::to_string(request).unwrap_or_default(),
            serialize_policies(candidates.iter()),
            serialize_policies(deciders.iter().copied()),
            self.record_expiration_secs,
        );

        if let Err(err) = analytics.record(record) {
            warn!(error = %err, "dropping decision audit record");
        }
    }
}

fn serialize_policies<'a>(policies: impl Iterator<Item = &'a Arc<CompiledPolicy>>) -> String {
    let docs: Vec<_> = policies.map(|p| &p.policy).collect();
    serde_json::to_string(&docs).unwrap_or_default()
}
