use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::security::audit_log::AuditLogger;

/// Claims of a verified caller.
#[derive(Debug, Clone, Serialize)]
pub struct CallerIdentity {
    pub uid: String,
    pub email: Option<String>,
    pub claims: HashMap<String, Value>,
}

impl CallerIdentity {
    /// Build an identity from decoded token claims; `sub` must be present.
    pub fn from_claims(claims: HashMap<String, Value>) -> Result<Self, AuthError> {
        let uid = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::Rejected("token has no subject".to_string()))?
            .to_string();
        let email = claims.get("email").and_then(Value::as_str).map(str::to_string);
        Ok(Self { uid, email, claims })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,

    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("token has expired")]
    Expired,

    #[error("token rejected: {0}")]
    Rejected(String),

    #[error("identity provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// Short reason used as a structured log field.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing",
            AuthError::Malformed(_) => "malformed",
            AuthError::Expired => "expired",
            AuthError::Rejected(_) => "rejected",
            AuthError::Provider(_) => "provider",
        }
    }
}

/// External check of a bearer token.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError>;
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());
    let Some(header) = header else {
        return Err(AuthError::MissingCredential);
    };
    let Some((scheme, token)) = header.split_once(' ') else {
        return Err(AuthError::Malformed("expected 'Bearer <token>'".to_string()));
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Malformed(format!("unsupported scheme '{scheme}'")));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Malformed("empty bearer token".to_string()));
    }
    Ok(token)
}

/// Gate in front of the prediction endpoint.
#[derive(Clone)]
pub struct AccessGuard {
    verifier: Arc<dyn CredentialVerifier>,
    audit: AuditLogger,
}

impl AccessGuard {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            verifier,
            audit: AuditLogger::new(),
        }
    }

    pub async fn authorize(
        &self,
        authorization: Option<&str>,
        request_id: &str,
    ) -> Result<CallerIdentity, AuthError> {
        let result = match bearer_token(authorization) {
            Ok(token) => self.verifier.verify(token).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(identity) => self.audit.auth_success(&identity.uid, request_id),
            Err(e) => self.audit.auth_failure(request_id, e.reason(), &e.to_string()),
        }
        result
    }
}
