//! Bearer-token authentication against secrets held in the local cache.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use thiserror::Error;

use crate::security::audit_log::AuditLogger;
use crate::store::{PolicyCache, Secret};

/// Resolves a key id to its secret without leaving the process.
pub type SecretLookup = Arc<dyn Fn(&str) -> Option<Secret> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization header cannot be empty")]
    MissingHeader,
    #[error("Authorization header must use the Bearer scheme")]
    Malformed,
    #[error("invalid token format: missing kid field in header")]
    MissingKeyId,
    #[error("can not obtain secret information from cache")]
    MissingSecret,
    #[error("signature is invalid: {0}")]
    InvalidSignature(String),
    #[error("expired at: {0}")]
    Expired(String),
}

impl AuthError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "MissingHeader",
            AuthError::Malformed => "Malformed",
            AuthError::MissingKeyId => "MissingKeyID",
            AuthError::MissingSecret => "MissingSecret",
            AuthError::InvalidSignature(_) => "InvalidSignature",
            AuthError::Expired(_) => "Expired",
        }
    }
}

/// `expires` is epoch seconds; 0 (or below) never expires.
pub fn key_expired(expires: i64) -> bool {
    expires >= 1 && Utc::now().timestamp() > expires
}

fn format_expiry(expires: i64) -> String {
    DateTime::<Utc>::from_timestamp(expires, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| expires.to_string())
}

#[derive(Clone)]
pub struct CacheStrategy {
    get: SecretLookup,
    audience: Option<String>,
    audit: AuditLogger,
}

impl CacheStrategy {
    pub fn new(get: impl Fn(&str) -> Option<Secret> + Send + Sync + 'static) -> Self {
        Self {
            get: Arc::new(get),
            audience: None,
            audit: AuditLogger::new(),
        }
    }

    pub fn from_cache(cache: Arc<PolicyCache>) -> Self {
        Self::new(move |kid| cache.get_secret(kid))
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    /// Authenticate the value of an `Authorization` header.
    pub fn authenticate_header(&self, header: Option<&str>) -> Result<String, AuthError> {
        let header = header.map(str::trim).unwrap_or_default();
        if header.is_empty() {
            self.audit.auth_failure(None, AuthError::MissingHeader.code(), "no credentials");
            return Err(AuthError::MissingHeader);
        }
        let token = match header.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
                token.trim()
            }
            _ => {
                self.audit.auth_failure(None, AuthError::Malformed.code(), "not a bearer token");
                return Err(AuthError::Malformed);
            }
        };
        self.authenticate(token)
    }

    /// Verify a signed token and return the username bound to its secret.
    pub fn authenticate(&self, raw: &str) -> Result<String, AuthError> {
        let mut kid = None;
        let result = self.verify(raw, &mut kid);
        if let Err(err) = &result {
            self.audit.auth_failure(kid.as_deref(), err.code(), &err.to_string());
        }
        result
    }

    fn verify(&self, raw: &str, kid_out: &mut Option<String>) -> Result<String, AuthError> {
        let header = decode_header(raw).map_err(|e| AuthError::InvalidSignature(e.to_string()))?;
        if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AuthError::InvalidSignature(format!(
                "unexpected signing method: {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingKeyId)?;
        *kid_out = Some(kid.clone());

        let secret = (self.get)(&kid).ok_or(AuthError::MissingSecret)?;

        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims.clear();
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        decode::<HashMap<String, Value>>(
            raw,
            &DecodingKey::from_secret(secret.key.as_bytes()),
            &validation,
        )
        .map_err(|e| AuthError::InvalidSignature(e.to_string()))?;

        if key_expired(secret.expires) {
            let at = format_expiry(secret.expires);
            self.audit.secret_expired(&secret.username, &kid, &at);
            return Err(AuthError::Expired(at));
        }

        self.audit.auth_success(&secret.username, &kid);
        Ok(secret.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn secret(kid: &str, expires: i64) -> Secret {
        Secret {
            username: "alice".to_string(),
            id: kid.to_string(),
            key: format!("key-of-{kid}"),
            expires,
        }
    }

    fn strategy(secrets: Vec<Secret>) -> CacheStrategy {
        let map: HashMap<String, Secret> = secrets.into_iter().map(|s| (s.id.clone(), s)).collect();
        CacheStrategy::new(move |kid| map.get(kid).cloned())
    }

    fn token(kid: Option<&str>, key: &str, claims: Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        encode(&header, &claims, &EncodingKey::from_secret(key.as_bytes())).unwrap()
    }

    fn claims() -> Value {
        json!({"aud": "iam.authz", "exp": Utc::now().timestamp() + 3600})
    }

    #[test]
    fn test_valid_token_yields_username() {
        let auth = strategy(vec![secret("kid-1", 0)]);
        let t = token(Some("kid-1"), "key-of-kid-1", claims());
        assert_eq!(auth.authenticate(&t), Ok("alice".to_string()));
    }

    #[test]
    fn test_missing_kid() {
        let auth = strategy(vec![secret("kid-1", 0)]);
        let t = token(None, "key-of-kid-1", claims());
        assert_eq!(auth.authenticate(&t), Err(AuthError::MissingKeyId));
    }

    #[test]
    fn test_unknown_kid() {
        let auth = strategy(vec![secret("kid-1", 0)]);
        let t = token(Some("kid-2"), "whatever", claims());
        assert_eq!(auth.authenticate(&t), Err(AuthError::MissingSecret));
    }

    #[test]
    fn test_wrong_key_is_invalid_signature() {
        let auth = strategy(vec![secret("kid-1", 0)]);
        let t = token(Some("kid-1"), "not-the-key", claims());
        assert!(matches!(auth.authenticate(&t), Err(AuthError::InvalidSignature(_))));
    }

    #[test]
    fn test_garbage_token_is_invalid_signature() {
        let auth = strategy(vec![]);
        assert!(matches!(auth.authenticate("abc.def"), Err(AuthError::InvalidSignature(_))));
    }

    #[test]
    fn test_audience_enforced_when_configured() {
        let auth = strategy(vec![secret("kid-1", 0)]).with_audience(Some("other".to_string()));
        let t = token(Some("kid-1"), "key-of-kid-1", claims());
        assert!(matches!(auth.authenticate(&t), Err(AuthError::InvalidSignature(_))));

        let auth = strategy(vec![secret("kid-1", 0)]).with_audience(Some("iam.authz".to_string()));
        assert!(auth.authenticate(&t).is_ok());
    }

    #[test]
    fn test_default_config_rejects_foreign_audience() {
        let audience = crate::server::config::Config::default().jwt.audience;
        let auth = strategy(vec![secret("kid-1", 0)]).with_audience(audience.clone());

        let foreign = token(
            Some("kid-1"),
            "key-of-kid-1",
            json!({"aud": "some-other-service", "exp": Utc::now().timestamp() + 3600}),
        );
        assert!(matches!(auth.authenticate(&foreign), Err(AuthError::InvalidSignature(_))));

        let own = token(
            Some("kid-1"),
            "key-of-kid-1",
            json!({"aud": audience, "exp": Utc::now().timestamp() + 3600}),
        );
        assert_eq!(auth.authenticate(&own), Ok("alice".to_string()));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now().timestamp();
        assert!(key_expired(now - 1));
        assert!(!key_expired(0));
        assert!(!key_expired(now + 60));

        let auth = strategy(vec![secret("old", now - 1), secret("forever", 0)]);
        let expired = token(Some("old"), "key-of-old", claims());
        match auth.authenticate(&expired) {
            Err(AuthError::Expired(at)) => assert_eq!(at, format_expiry(now - 1)),
            other => panic!("expected expiry, got {other:?}"),
        }

        let forever = token(Some("forever"), "key-of-forever", claims());
        assert!(auth.authenticate(&forever).is_ok());
    }

    #[test]
    fn test_header_parsing() {
        let auth = strategy(vec![secret("kid-1", 0)]);
        assert_eq!(auth.authenticate_header(None), Err(AuthError::MissingHeader));
        assert_eq!(auth.authenticate_header(Some("  ")), Err(AuthError::MissingHeader));
        assert_eq!(auth.authenticate_header(Some("Basic abc")), Err(AuthError::Malformed));
        assert_eq!(auth.authenticate_header(Some("Bearer")), Err(AuthError::Malformed));

        let t = token(Some("kid-1"), "key-of-kid-1", claims());
        assert_eq!(
            auth.authenticate_header(Some(&format!("Bearer {t}"))),
            Ok("alice".to_string())
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthError::MissingKeyId.code(), "MissingKeyID");
        assert_eq!(AuthError::Expired("x".into()).code(), "Expired");
    }
}
