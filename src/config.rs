use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::security::firebase::GOOGLE_JWKS_URL;

pub const DEFAULT_ORIGINS: [&str; 4] = [
    "http://localhost:4200",
    "http://localhost:8000",
    "http://127.0.0.1:8000",
    "http://localhost:8080",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model_path: PathBuf,
    pub service_account_path: PathBuf,
    pub jwks_url: String,
    pub key_refresh_secs: u64,
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/bcn20000_model_8classes.pth"),
            service_account_path: PathBuf::from("firebase-adminsdk.json"),
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            key_refresh_secs: 3600,
            allowed_origins: DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        Ok(cfg)
    }

    /// Read the file when it exists, fall back to defaults otherwise, then
    /// apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut cfg = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            warn!("config file '{}' not found, using defaults", path);
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FINDOUTMOLE_MODEL_PATH") {
            self.model_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FINDOUTMOLE_SERVICE_ACCOUNT") {
            self.service_account_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FINDOUTMOLE_ALLOWED_ORIGINS") {
            self.allowed_origins = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}
