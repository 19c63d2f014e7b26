//! Pipeline configuration and API key resolution
//!
//! Keys resolve in three tiers: a key set at runtime, then the `api_key`
//! field of the persisted `config.json`, then the `WAVESPEED_API_KEY`
//! environment variable. The provider is built once at the composition root
//! and handed to the pipeline as a [`CredentialSource`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;

pub const DEFAULT_API_BASE: &str = "https://api.wavespeed.ai";
pub const DEFAULT_UPLOAD_PATH: &str = "/api/v3/media/upload/binary";
pub const API_KEY_ENV: &str = "WAVESPEED_API_KEY";

/// Endpoints and timeouts for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub api_base: String,
    pub upload_path: String,
    pub upload_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub dispatch_timeout_secs: u64,
    /// Per-request timeout for submit and poll calls.
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            upload_path: DEFAULT_UPLOAD_PATH.to_string(),
            upload_timeout_secs: 180,
            poll_interval_secs: 5,
            dispatch_timeout_secs: 300,
            request_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_dispatch_timeout(mut self, secs: u64) -> Self {
        self.dispatch_timeout_secs = secs;
        self
    }

    pub fn upload_url(&self) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), self.upload_path)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Supplies the API key for a pipeline run, or nothing.
pub trait CredentialSource: Send + Sync {
    fn get(&self) -> Option<String>;
}

/// `<config dir>/wavespeed/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wavespeed").join("config.json"))
}

fn non_empty(key: impl AsRef<str>) -> Option<String> {
    let key = key.as_ref().trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

pub struct ApiKeyProvider {
    runtime_key: RwLock<Option<String>>,
    config_path: Option<PathBuf>,
    env_var: String,
}

impl ApiKeyProvider {
    pub fn new() -> Self {
        Self {
            runtime_key: RwLock::new(None),
            config_path: default_config_path(),
            env_var: API_KEY_ENV.to_string(),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn set_runtime_key(&self, key: impl AsRef<str>) {
        if let Ok(mut slot) = self.runtime_key.write() {
            *slot = non_empty(key);
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.get().is_some()
    }

    /// Persist `key` into the config file, keeping any other fields.
    pub fn save_api_key(&self, key: &str) -> Result<PathBuf> {
        let path = self.require_path()?;
        let mut config = self.read_config();
        config.insert("api_key".to_string(), Value::String(key.trim().to_string()));
        write_config(&path, &config)?;
        info!("Saved API key to {}", path.display());
        Ok(path)
    }

    /// Remove the persisted and runtime key. Returns whether a persisted key
    /// existed.
    pub fn delete_api_key(&self) -> Result<bool> {
        if let Ok(mut slot) = self.runtime_key.write() {
            *slot = None;
        }
        let Some(path) = self.config_path.clone() else {
            return Ok(false);
        };
        let mut config = self.read_config();
        if config.remove("api_key").is_none() {
            return Ok(false);
        }
        if config.is_empty() {
            fs::remove_file(&path)?;
        } else {
            write_config(&path, &config)?;
        }
        info!("Removed API key from {}", path.display());
        Ok(true)
    }

    fn require_path(&self) -> Result<PathBuf> {
        self.config_path.clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no configuration directory available").into()
        })
    }

    fn read_config(&self) -> Map<String, Value> {
        let Some(path) = self.config_path.as_ref() else {
            return Map::new();
        };
        let Ok(raw) = fs::read_to_string(path) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("Ignoring malformed config file {}", path.display());
                Map::new()
            }
        }
    }

    fn config_key(&self) -> Option<String> {
        self.read_config()
            .get("api_key")
            .and_then(Value::as_str)
            .and_then(non_empty)
    }
}

impl Default for ApiKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialSource for ApiKeyProvider {
    fn get(&self) -> Option<String> {
        if let Some(key) = self.runtime_key.read().ok().and_then(|slot| slot.clone()) {
            debug!("Using runtime API key");
            return Some(key);
        }
        if let Some(key) = self.config_key() {
            debug!("Using API key from config file");
            return Some(key);
        }
        std::env::var(&self.env_var).ok().and_then(non_empty).map(|key| {
            debug!("Using API key from {}", self.env_var);
            key
        })
    }
}

fn write_config(path: &Path, config: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(config)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dir: &tempfile::TempDir, env_var: &str) -> ApiKeyProvider {
        ApiKeyProvider::new()
            .with_config_path(dir.path().join("wavespeed").join("config.json"))
            .with_env_var(env_var)
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.upload_url(), "https://api.wavespeed.ai/api/v3/media/upload/binary");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(300));

        let parsed: PipelineConfig = serde_json::from_str(r#"{"poll_interval_secs": 2}"#).unwrap();
        assert_eq!(parsed.poll_interval_secs, 2);
        assert_eq!(parsed.upload_timeout_secs, 180);
    }

    #[test]
    fn test_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let env_var = "WAVESPEED_TEST_KEY_RESOLUTION";
        std::env::set_var(env_var, "from-env");
        let provider = provider(&dir, env_var);

        assert_eq!(provider.get().as_deref(), Some("from-env"));

        provider.save_api_key("from-file").unwrap();
        assert_eq!(provider.get().as_deref(), Some("from-file"));

        provider.set_runtime_key("from-runtime");
        assert_eq!(provider.get().as_deref(), Some("from-runtime"));

        std::env::remove_var(env_var);
    }

    #[test]
    fn test_absent_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, "WAVESPEED_TEST_KEY_NEVER_SET");
        assert!(!provider.has_api_key());
        provider.set_runtime_key("   ");
        assert_eq!(provider.get(), None);
    }

    #[test]
    fn test_save_keeps_other_fields_and_delete_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, "WAVESPEED_TEST_KEY_SAVE");
        let path = provider.config_path().unwrap().to_path_buf();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"theme": "dark"}"#).unwrap();

        provider.save_api_key(" secret ").unwrap();
        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["api_key"], "secret");
        assert_eq!(saved["theme"], "dark");

        assert!(provider.delete_api_key().unwrap());
        assert!(!provider.delete_api_key().unwrap());
        let remaining: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(remaining.get("api_key").is_none());
    }

    #[test]
    fn test_delete_removes_file_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, "WAVESPEED_TEST_KEY_DELETE");
        let path = provider.save_api_key("k").unwrap();
        assert!(path.exists());
        assert!(provider.delete_api_key().unwrap());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = provider(&dir, "WAVESPEED_TEST_KEY_MODE").save_api_key("k").unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
