use tracing::{error, info, warn};

/// Security and outcome events, emitted under the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn auth_success(&self, uid: &str, request_id: &str) {
        info!(target: "audit", event = "auth_success", uid, request_id);
    }

    pub fn auth_failure(&self, request_id: &str, reason: &str, detail: &str) {
        warn!(target: "audit", event = "auth_failure", request_id, reason, detail);
    }

    pub fn prediction_served(&self, uid: &str, request_id: &str, label: &str, category: &str) {
        info!(target: "audit", event = "prediction_served", uid, request_id, label, category);
    }

    pub fn inference_failed(&self, uid: &str, request_id: &str, stage: &str, error_msg: &str) {
        error!(target: "audit", event = "inference_failed", uid, request_id, stage, error = error_msg);
    }
}
