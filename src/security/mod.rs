pub mod audit_log;
pub mod auth;
pub mod firebase;
pub mod key_cache;

pub use auth::{AccessGuard, AuthError, CallerIdentity, CredentialVerifier};
pub use firebase::FirebaseVerifier;
