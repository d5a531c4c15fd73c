//! DRM layer configuration loaded from YAML.
//!
//! Every field has a default, so an empty document is a valid configuration.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which [`crate::session::DrmSession`] implementation sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    /// Native CDM through the configured binding.
    #[default]
    Ocdm,
    /// In-process clear key for every session.
    ClearKey,
    /// No decryption at all.
    Null,
}

/// Static output link description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub source_uhd: bool,
    pub hdcp_2_2: bool,
}

/// Settings of the process-fatal hardware error policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FatalConfig {
    /// Command names of vendor CDM helper processes to kill.
    pub helper_processes: Vec<String>,
    /// Delay before self-termination so logs reach their sinks.
    pub flush_delay_ms: u64,
}

impl Default for FatalConfig {
    fn default() -> Self {
        Self {
            helper_processes: vec!["WPEcdmi".to_string()],
            flush_delay_ms: 1000,
        }
    }
}

/// DRM layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrmConfig {
    /// How long to wait for the CDM challenge (0 waits forever).
    pub key_request_timeout_ms: u64,
    /// How long to wait for the key status after a license (0 waits forever).
    pub license_timeout_ms: u64,
    /// Refuse decrypt when HDCP 2.2 is required and missing.
    pub output_protection: bool,
    pub backend: SessionBackend,
    /// Serve the clear key system in-process even with the OCDM backend.
    pub native_clear_key: bool,
    pub platform: PlatformConfig,
    pub fatal: FatalConfig,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            key_request_timeout_ms: 5000,
            license_timeout_ms: 5000,
            output_protection: true,
            backend: SessionBackend::default(),
            native_clear_key: true,
            platform: PlatformConfig::default(),
            fatal: FatalConfig::default(),
        }
    }
}

impl DrmConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn key_request_timeout(&self) -> Duration {
        Duration::from_millis(self.key_request_timeout_ms)
    }

    pub fn license_timeout(&self) -> Duration {
        Duration::from_millis(self.license_timeout_ms)
    }
}
