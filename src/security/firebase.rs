use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::security::auth::{AuthError, CallerIdentity, CredentialVerifier};
use crate::security::key_cache::KeyCache;

/// Public JWKS for Firebase ID tokens.
pub const GOOGLE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

const ISSUER_PREFIX: &str = "https://securetoken.google.com/";

// Lower bound between refetches while a key set is already cached.
const MIN_REFETCH_SECS: u64 = 30;

// Allowed clock skew for `exp` and `iat`.
const CLOCK_SKEW_SECS: u64 = 60;

/// Fields of the service-account JSON the verifier needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    #[serde(rename = "type")]
    pub account_type: String,
    pub project_id: String,
    #[serde(default)]
    pub client_email: Option<String>,
}

impl ServiceAccount {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading service account file '{}'", path.display()))?;
        let account: ServiceAccount =
            serde_json::from_str(&raw).context("parsing service account JSON")?;
        if account.account_type != "service_account" {
            bail!(
                "credential file has type '{}', expected 'service_account'",
                account.account_type
            );
        }
        if account.project_id.trim().is_empty() {
            bail!("service account has an empty project_id");
        }
        Ok(account)
    }
}

/// Verifies Firebase ID tokens (RS256 JWTs) against Google's published keys.
#[derive(Debug, Clone)]
pub struct FirebaseVerifier {
    project_id: String,
    jwks_url: String,
    key_max_age_secs: u64,
    min_refetch_secs: u64,
    keys: KeyCache,
    http_client: Client,
}

impl FirebaseVerifier {
    pub fn new(
        project_id: impl Into<String>,
        jwks_url: impl Into<String>,
        key_max_age_secs: u64,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("creating HTTP client")?;

        Ok(Self {
            project_id: project_id.into(),
            jwks_url: jwks_url.into(),
            key_max_age_secs,
            min_refetch_secs: MIN_REFETCH_SECS,
            keys: KeyCache::new(),
            http_client,
        })
    }

    /// Initialise from the service-account file named in the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let account = ServiceAccount::from_file(&config.service_account_path)?;
        info!(
            project_id = %account.project_id,
            client_email = account.client_email.as_deref().unwrap_or(""),
            "Identity provider initialised"
        );
        Self::new(account.project_id, config.jwks_url.clone(), config.key_refresh_secs)
    }

    /// Minimum spacing between refetches once keys are cached: applies to
    /// unknown `kid`s and to retries after a failed refresh.
    pub fn with_min_refetch_secs(mut self, secs: u64) -> Self {
        self.min_refetch_secs = secs;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn issuer(&self) -> String {
        format!("{ISSUER_PREFIX}{}", self.project_id)
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        debug!(url = %self.jwks_url, "Fetching signing keys");
        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("fetching signing keys: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Signing key endpoint returned an error");
            return Err(AuthError::Provider(format!(
                "signing key endpoint returned {status}"
            )));
        }

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("parsing signing keys: {e}")))?;
        self.keys.store(set).await;
        Ok(())
    }

    /// Refresh the key set if it is older than `max_age_secs`, one caller at
    /// a time. A failed refresh keeps serving the cached set when there is one.
    async fn refresh_if_older_than(&self, max_age_secs: u64) -> Result<(), AuthError> {
        let mut last_attempt = self.keys.begin_refresh().await;
        if !self.keys.is_stale(max_age_secs).await {
            return Ok(());
        }

        let have_keys = !self.keys.is_empty().await;
        if have_keys {
            if let Some(at) = *last_attempt {
                if (Utc::now() - at).num_seconds() < self.min_refetch_secs as i64 {
                    return Ok(());
                }
            }
        }

        *last_attempt = Some(Utc::now());
        match self.refresh_keys().await {
            Err(e) if have_keys => {
                warn!(error = %e, "Key refresh failed, keeping cached signing keys");
                Ok(())
            }
            other => other,
        }
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if self.keys.is_stale(self.key_max_age_secs).await {
            self.refresh_if_older_than(self.key_max_age_secs).await?;
        }

        let jwk = match self.keys.find(kid).await {
            Some(jwk) => jwk,
            None => {
                self.refresh_if_older_than(self.min_refetch_secs).await?;
                self.keys
                    .find(kid)
                    .await
                    .ok_or_else(|| AuthError::Rejected(format!("no signing key matches kid '{kid}'")))?
            }
        };

        DecodingKey::from_jwk(&jwk).map_err(|e| AuthError::Rejected(format!("unusable signing key: {e}")))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[self.issuer()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        validation.leeway = CLOCK_SKEW_SECS;
        validation
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            AuthError::Malformed(err.to_string())
        }
        _ => AuthError::Rejected(err.to_string()),
    }
}

/// `iat` must not lie in the future beyond the allowed skew.
fn check_issued_at(claims: &HashMap<String, Value>, now: i64) -> Result<(), AuthError> {
    let iat = match claims.get("iat") {
        Some(value) => value
            .as_f64()
            .ok_or_else(|| AuthError::Malformed("iat is not a number".to_string()))?,
        None => return Err(AuthError::Rejected("token has no iat claim".to_string())),
    };
    if iat > (now + CLOCK_SKEW_SECS as i64) as f64 {
        return Err(AuthError::Rejected("token issued in the future".to_string()));
    }
    Ok(())
}

#[async_trait]
impl CredentialVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let header = decode_header(token).map_err(map_jwt_error)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Rejected(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("token header has no kid".to_string()))?;

        let key = self.decoding_key(&kid).await?;
        let decoded = decode::<HashMap<String, Value>>(token, &key, &self.validation())
            .map_err(map_jwt_error)?;
        check_issued_at(&decoded.claims, Utc::now().timestamp())?;
        CallerIdentity::from_claims(decoded.claims)
    }
}
