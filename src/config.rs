// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent configuration at `~/.modelyard/config.json`.
//!
//! Every field has a default so a missing or partial file is valid.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::DownloadSettings;
use crate::error::ConfigurationError;
use crate::loader::ollama::DEFAULT_OLLAMA_URL;
use crate::registry::{ModelDescriptor, Registry};
use crate::utils::mask_sensitive;

/// Environment variable that overrides `models_dir`.
pub const MODELS_DIR_ENV: &str = "MODELYARD_MODELS_DIR";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Where artifacts live. Defaults to `~/.modelyard/models`.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Model used when none is named. Defaults to the catalogue default.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Bytes per second, 0 for unlimited.
    #[serde(default)]
    pub bandwidth_limit_bps: u64,
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    /// Bearer tokens keyed by model id. Environment variables take precedence.
    #[serde(default)]
    pub auth_tokens: BTreeMap<String, String>,
    /// Extra catalogue entries appended after the built-in ones.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    /// Command-line override; wins over the environment. Never persisted.
    #[serde(skip)]
    pub models_dir_override: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_inactivity_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_load_timeout_secs() -> u64 {
    300
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: None,
            default_model: None,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
            bandwidth_limit_bps: 0,
            load_timeout_secs: default_load_timeout_secs(),
            ollama_url: default_ollama_url(),
            auth_tokens: BTreeMap::new(),
            models: Vec::new(),
            models_dir_override: None,
        }
    }
}

/// `~/.modelyard`, created if missing.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".modelyard");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

impl Config {
    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Effective models directory: command-line override, env override,
    /// config, then `~/.modelyard/models`.
    pub fn resolve_models_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.models_dir_override {
            return Ok(dir.clone());
        }
        if let Some(dir) = std::env::var_os(MODELS_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.models_dir {
            return Ok(dir.clone());
        }
        Ok(config_dir()?.join("models"))
    }

    pub fn download_settings(&self, models_dir: PathBuf) -> Result<DownloadSettings, ConfigurationError> {
        if self.chunk_size == 0 {
            return Err(ConfigurationError::Invalid("chunk_size must be greater than zero".into()));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "inactivity_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigurationError::Invalid(
                "retry_base_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }

        Ok(DownloadSettings {
            models_dir,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            chunk_size: self.chunk_size,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.max(1))
    }

    /// Built-in catalogue plus configured entries and tokens.
    pub fn registry(&self) -> Result<Registry, ConfigurationError> {
        let builtin = Registry::builtin();
        let mut models: Vec<ModelDescriptor> = builtin.descriptors().cloned().collect();
        models.extend(self.models.iter().cloned());

        let default_id = self
            .default_model
            .clone()
            .unwrap_or_else(|| builtin.default_id().to_string());
        let mut registry = Registry::new(models, default_id)?;

        for (id, token) in &self.auth_tokens {
            registry.describe(id)?;
            registry = registry.with_token(id.clone(), token.clone());
        }
        Ok(registry)
    }

    /// Copy safe to print: tokens masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for token in copy.auth_tokens.values_mut() {
            *token = mask_sensitive(token, 5);
        }
        copy
    }
}
