use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use outpost_crypto::cipher::ConfigCipher;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

const VALID_LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

/// Agent configuration, stored on disk only as a sealed config-domain
/// envelope. Machine-bound: the file cannot be decrypted on another host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub store_id: String,
    pub port: u16,
    pub sync_interval_secs: u32,
    pub max_offline_hours: u32,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            store_id: String::new(),
            port: 8080,
            sync_interval_secs: 59,
            max_offline_hours: 24,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Check the invariants a provisioned agent must satisfy. Fresh defaults
    /// fail validation until server_url and store_id are filled in.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            color_eyre::eyre::bail!("server_url cannot be empty");
        }
        if self.store_id.is_empty() {
            color_eyre::eyre::bail!("store_id cannot be empty");
        }
        if self.port == 0 {
            color_eyre::eyre::bail!("port must be between 1 and 65535");
        }
        if self.sync_interval_secs == 0 {
            color_eyre::eyre::bail!("sync_interval_secs must be at least 1");
        }
        if self.max_offline_hours == 0 {
            color_eyre::eyre::bail!("max_offline_hours must be at least 1");
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            color_eyre::eyre::bail!("log_level must be one of debug, info, warn, error");
        }
        Ok(())
    }
}

/// Loads and saves the encrypted configuration file. Writes go through a
/// temp file in the target directory followed by an atomic rename, so a
/// crash mid-save never leaves a torn config behind.
pub struct ConfigManager {
    path: PathBuf,
    cipher: ConfigCipher,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>, fingerprint: &str) -> Result<Self> {
        let cipher = ConfigCipher::new(fingerprint)?;
        Ok(Self {
            path: path.into(),
            cipher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration; a missing file yields defaults. Decrypt
    /// failures surface to the caller, never a silent fallback to defaults.
    pub fn load(&self) -> Result<AgentConfig> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no config file; using defaults");
            return Ok(AgentConfig::default());
        }

        let envelope = fs::read_to_string(&self.path)?;
        let plaintext = self.cipher.open(envelope.trim())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Seal and persist the configuration with whole-file atomic replace.
    pub fn save(&self, config: &AgentConfig) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| color_eyre::eyre::eyre!("config path has no parent directory"))?;
        fs::create_dir_all(parent)?;

        let body = serde_json::to_vec_pretty(config)?;
        let envelope = self.cipher.seal(&body)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(envelope.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Write an encrypted default config if none exists; returns the path.
    pub fn write_default_if_missing(&self) -> Result<&Path> {
        if !self.path.exists() {
            self.save(&AgentConfig::default())?;
        }
        Ok(&self.path)
    }

    /// Apply a mutation and persist the result.
    pub fn update<F>(&self, apply: F) -> Result<AgentConfig>
    where
        F: FnOnce(&mut AgentConfig) -> Result<()>,
    {
        let mut config = self.load()?;
        apply(&mut config)?;
        self.save(&config)?;
        Ok(config)
    }
}
