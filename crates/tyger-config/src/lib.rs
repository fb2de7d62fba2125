//! Process configuration (spec §6: "the core's only observable
//! configuration surface is ... process environment variables").
//!
//! [`ServerConfig::from_env`] reads a `TYGER_*`-prefixed environment, with
//! an optional TOML defaults file (`tyger.toml`, path overridable by
//! `TYGER_CONFIG_FILE`) supplying a base layer underneath the environment
//! overrides — env always wins, matching how the teacher's config crate
//! layers file defaults under explicit overrides.
//!
//! # Example
//!
//! ```
//! use tyger_config::ServerConfig;
//!
//! let config = ServerConfig::default();
//! assert_eq!(config.buffer.active_lifetime_secs, 24 * 3600);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_active_lifetime_secs() -> i64 {
    24 * 3600
}

fn default_soft_lifetime_secs() -> i64 {
    7 * 24 * 3600
}

fn default_deleter_interval_secs() -> u64 {
    30
}

fn default_access_url_validity_secs() -> i64 {
    3600
}

fn default_block_size_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_dop() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() * 2).min(16))
        .unwrap_or(4)
}

fn default_run_timeout_secs() -> i64 {
    12 * 3600
}

fn default_prune_interval_secs() -> u64 {
    5 * 60
}

fn default_idempotency_ttl_secs() -> i64 {
    24 * 3600
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Local
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Cluster,
}

/// Buffer Manager tunables (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub active_lifetime_secs: i64,
    pub soft_lifetime_secs: i64,
    pub deleter_interval_secs: u64,
    pub access_url_validity_secs: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            active_lifetime_secs: default_active_lifetime_secs(),
            soft_lifetime_secs: default_soft_lifetime_secs(),
            deleter_interval_secs: default_deleter_interval_secs(),
            access_url_validity_secs: default_access_url_validity_secs(),
        }
    }
}

/// Data-Plane Client tunables (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    pub block_size_bytes: usize,
    pub degree_of_parallelism: usize,
    pub max_block_retries: u32,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            block_size_bytes: default_block_size_bytes(),
            degree_of_parallelism: default_dop(),
            max_block_retries: 5,
        }
    }
}

/// Run Creator / Reconciler tunables (spec §4.3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub default_timeout_secs: i64,
    pub prune_modified_at_interval_secs: u64,
    pub idempotency_key_ttl_secs: i64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_run_timeout_secs(),
            prune_modified_at_interval_secs: default_prune_interval_secs(),
            idempotency_key_ttl_secs: default_idempotency_ttl_secs(),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_backend_kind")]
    pub backend: BackendKind,
    pub buffer: BufferConfig,
    pub data_plane: DataPlaneConfig,
    pub run: RunConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backend: default_backend_kind(),
            buffer: BufferConfig::default(),
            data_plane: DataPlaneConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl BufferConfig {
    pub fn active_lifetime(&self) -> Duration {
        Duration::from_secs(self.active_lifetime_secs.max(0) as u64)
    }

    pub fn soft_lifetime(&self) -> Duration {
        Duration::from_secs(self.soft_lifetime_secs.max(0) as u64)
    }
}

impl ServerConfig {
    /// Loads the optional TOML file (if present) as a base layer, then
    /// applies `TYGER_*` environment overrides on top.
    pub fn from_env() -> Result<Self> {
        let file_path = std::env::var("TYGER_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tyger.toml"));

        let mut config = if file_path.exists() {
            Self::from_toml_file(&file_path)?
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var("TYGER_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(backend) = std::env::var("TYGER_BACKEND") {
            config.backend = match backend.as_str() {
                "cluster" => BackendKind::Cluster,
                _ => BackendKind::Local,
            };
        }
        if let Ok(v) = std::env::var("TYGER_BUFFER_ACTIVE_LIFETIME_SECS") {
            config.buffer.active_lifetime_secs = v
                .parse()
                .context("TYGER_BUFFER_ACTIVE_LIFETIME_SECS must be an integer")?;
        }
        if let Ok(v) = std::env::var("TYGER_BUFFER_SOFT_LIFETIME_SECS") {
            config.buffer.soft_lifetime_secs = v
                .parse()
                .context("TYGER_BUFFER_SOFT_LIFETIME_SECS must be an integer")?;
        }
        if let Ok(v) = std::env::var("TYGER_DATA_PLANE_BLOCK_SIZE_BYTES") {
            config.data_plane.block_size_bytes = v
                .parse()
                .context("TYGER_DATA_PLANE_BLOCK_SIZE_BYTES must be an integer")?;
        }
        if let Ok(v) = std::env::var("TYGER_RUN_DEFAULT_TIMEOUT_SECS") {
            config.run.default_timeout_secs = v
                .parse()
                .context("TYGER_RUN_DEFAULT_TIMEOUT_SECS must be an integer")?;
        }

        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.buffer.active_lifetime_secs, 24 * 3600);
        assert_eq!(config.buffer.soft_lifetime_secs, 7 * 24 * 3600);
        assert_eq!(config.run.default_timeout_secs, 12 * 3600);
        assert_eq!(config.data_plane.block_size_bytes, 4 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn env_overrides_default() {
        unsafe {
            std::env::set_var("TYGER_LISTEN_ADDR", "127.0.0.1:9999");
            std::env::remove_var("TYGER_CONFIG_FILE");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        unsafe {
            std::env::remove_var("TYGER_LISTEN_ADDR");
        }
    }

    #[test]
    #[serial]
    fn toml_file_is_base_layer_under_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tyger.toml");
        std::fs::write(&path, "listen_addr = \"10.0.0.1:7000\"\n").unwrap();

        unsafe {
            std::env::set_var("TYGER_CONFIG_FILE", &path);
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "10.0.0.1:7000");
        unsafe {
            std::env::remove_var("TYGER_CONFIG_FILE");
        }
    }

    #[test]
    #[serial]
    fn invalid_int_env_var_errors() {
        unsafe {
            std::env::set_var("TYGER_RUN_DEFAULT_TIMEOUT_SECS", "not-a-number");
            std::env::remove_var("TYGER_CONFIG_FILE");
        }
        let result = ServerConfig::from_env();
        unsafe {
            std::env::remove_var("TYGER_RUN_DEFAULT_TIMEOUT_SECS");
        }
        assert!(result.is_err());
    }
}
