//! Bridge configuration
//!
//! Loaded from TOML. Every key is optional; missing keys take their defaults.
//!
//! ```toml
//! default_container = "default"
//! string_encoding = "ansi"      # ansi, utf16
//! signature_scheme = "ordered"  # ordered, legacy
//!
//! [unload]
//! timeout_ms = 5000
//! poll_interval_ms = 1
//!
//! [hot_reload]
//! enabled = false
//! debounce_ms = 500
//! ```

use crate::codec::StringEncoding;
use crate::error::{InteropError, Result};
use crate::signature::SignatureScheme;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a config file read by `initialize`
pub const CONFIG_ENV_VAR: &str = "VOID_INTEROP_CONFIG";

/// Settings for container teardown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloadConfig {
    /// Upper bound on waiting for a container's units to become unreachable
    pub timeout_ms: u64,
    /// Sleep between reachability checks
    pub poll_interval_ms: u64,
}

impl Default for UnloadConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_interval_ms: 1,
        }
    }
}

impl UnloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for the unit file watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadSettings {
    /// Start a watcher when the service is created
    pub enabled: bool,
    /// Wait for file changes to settle before reloading
    pub debounce_ms: u64,
}

impl Default for HotReloadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
        }
    }
}

impl HotReloadSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the non-collectible container that always exists
    pub default_container: String,
    /// Encoding used for strings in invocation argument slots
    pub string_encoding: StringEncoding,
    /// How method handles are derived
    pub signature_scheme: SignatureScheme,
    /// Container teardown
    pub unload: UnloadConfig,
    /// Unit file watching
    pub hot_reload: HotReloadSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_container: "default".to_string(),
            string_encoding: StringEncoding::Ansi,
            signature_scheme: SignatureScheme::Ordered,
            unload: UnloadConfig::default(),
            hot_reload: HotReloadSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| InteropError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::info!("Loaded interop config from {}", path.display());
        Ok(config)
    }

    /// Load the file named by [`CONFIG_ENV_VAR`]; `None` when it is unset
    pub fn try_from_env() -> Result<Option<Self>> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::load_from_file(&path)
                .map(Some)
                .map_err(|e| InteropError::Config(format!("ignoring '{}': {}", path, e))),
            _ => Ok(None),
        }
    }

    /// Like [`try_from_env`](Self::try_from_env), falling back to defaults
    pub fn from_env() -> Self {
        Self::try_from_env()
            .unwrap_or_else(|e| {
                log::warn!("{}", e);
                None
            })
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.default_container.is_empty() {
            return Err(InteropError::Config("default_container cannot be empty".into()));
        }
        if self.unload.poll_interval_ms > self.unload.timeout_ms {
            return Err(InteropError::Config(
                "unload.poll_interval_ms exceeds unload.timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_container, "default");
        assert_eq!(config.string_encoding, StringEncoding::Ansi);
        assert_eq!(config.unload.timeout(), Duration::from_secs(5));
        assert!(!config.hot_reload.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
            string_encoding = "utf16"
            signature_scheme = "legacy"

            [unload]
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.string_encoding, StringEncoding::Utf16);
        assert_eq!(config.signature_scheme, SignatureScheme::Legacy);
        assert_eq!(config.unload.timeout_ms, 250);
        assert_eq!(config.unload.poll_interval_ms, 1);
        assert_eq!(config.default_container, "default");
    }

    #[test]
    fn test_rejects_empty_default_container() {
        assert!(BridgeConfig::from_toml_str("default_container = \"\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interop.toml");
        std::fs::write(&path, "[hot_reload]\nenabled = true\ndebounce_ms = 50\n").unwrap();

        let config = BridgeConfig::load_from_file(&path).unwrap();
        assert!(config.hot_reload.enabled);
        assert_eq!(config.hot_reload.debounce(), Duration::from_millis(50));
    }
}
