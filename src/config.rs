//! Runtime configuration.
//!
//! Defaults target the production portal. Each value can be overridden
//! through the environment, which is how hosts usually point the integration
//! at a staging API.

use std::path::PathBuf;

use crate::vrm_api::broker::DEFAULT_BROKER_USERNAME_PREFIX;
use crate::vrm_api::client::DEFAULT_API_URL;
use crate::vrm_api::credentials::DEFAULT_DOCUMENT_PATH;

/// Overrides the VRM API base URL
pub const API_URL_ENV: &str = "VRM_API_URL";
/// Overrides the broker username prefix
pub const BROKER_USERNAME_PREFIX_ENV: &str = "VRM_BROKER_USERNAME_PREFIX";
/// Overrides the directory holding the credential document
pub const STORE_DIR_ENV: &str = "VRM_STORE_DIR";

/// Settings for the VRM integration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrmConfig {
    /// Base URL of the VRM API
    pub api_url: String,
    /// Prefix joined with the portal username to form the broker username
    pub broker_username_prefix: String,
    /// Root directory for the storage backend
    pub store_dir: PathBuf,
    /// Path of the credential document relative to `store_dir`
    pub document_path: String,
}

impl Default for VrmConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            broker_username_prefix: DEFAULT_BROKER_USERNAME_PREFIX.to_string(),
            store_dir: default_store_dir(),
            document_path: DEFAULT_DOCUMENT_PATH.to_string(),
        }
    }
}

impl VrmConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides taken from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty(API_URL_ENV) {
            tracing::debug!("Using VRM API URL from {}: {}", API_URL_ENV, url);
            config.api_url = url;
        }
        if let Some(prefix) = non_empty(BROKER_USERNAME_PREFIX_ENV) {
            config.broker_username_prefix = prefix;
        }
        if let Some(dir) = non_empty(STORE_DIR_ENV) {
            config.store_dir = PathBuf::from(dir);
        }
        config
    }
}

fn default_store_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".vrm"),
        None => {
            tracing::warn!("Cannot determine home directory, storing VRM data in ./.vrm");
            PathBuf::from(".vrm")
        }
    }
}
