use tracing::{info, warn};

/// Security events for the `audit` log target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn auth_success(&self, username: &str, kid: &str) {
        info!(target: "audit", event = "auth_success", username, kid);
    }

    pub fn auth_failure(&self, kid: Option<&str>, code: &str, reason: &str) {
        warn!(target: "audit", event = "auth_failure", kid = kid.unwrap_or(""), code, reason);
    }

    pub fn secret_expired(&self, username: &str, kid: &str, expired_at: &str) {
        warn!(target: "audit", event = "secret_expired", username, kid, expired_at);
    }

    pub fn access_denied(&self, username: &str, resource: &str, action: &str, reason: &str) {
        warn!(target: "audit", event = "access_denied", username, resource, action, reason);
    }
}
