//! Engine configuration – reads/writes `~/.cogmem/config.toml`.
//!
//! Values come from the file first and `COGMEM_*` environment variables
//! second, so the environment always wins.  A missing file is not an error:
//! defaults plus the environment are used instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cogmem_memory::{DecayConfig, StoreOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Database target selecting a private in-memory SQLite database.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Persisted engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path, or `:memory:`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Decay rate `k`, per second.
    #[serde(default = "default_decay_base_rate")]
    pub decay_base_rate: f64,

    /// How strongly `|polarity|` slows decay, in `[0, 1]`.
    #[serde(default = "default_decay_valence_weight")]
    pub decay_valence_weight: f64,

    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Default deadline of one persistence call.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_database_url() -> String {
    "cogmem.db".to_string()
}
fn default_embedding_dim() -> usize {
    1536
}
fn default_decay_base_rate() -> f64 {
    1e-6
}
fn default_decay_valence_weight() -> f64 {
    0.5
}
fn default_decay_interval_secs() -> u64 {
    3600
}
fn default_pool_size() -> u32 {
    8
}
fn default_op_timeout_ms() -> u64 {
    5000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            embedding_dim: default_embedding_dim(),
            decay_base_rate: default_decay_base_rate(),
            decay_valence_weight: default_decay_valence_weight(),
            decay_interval_secs: default_decay_interval_secs(),
            pool_size: default_pool_size(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.database_url.trim().is_empty() {
            return invalid("database_url", "must not be empty");
        }
        if self.embedding_dim == 0 {
            return invalid("embedding_dim", "must be positive");
        }
        if !self.decay_base_rate.is_finite() || self.decay_base_rate < 0.0 {
            return invalid("decay_base_rate", "must be finite and ≥ 0");
        }
        if !(0.0..=1.0).contains(&self.decay_valence_weight) {
            return invalid("decay_valence_weight", "must be in [0, 1]");
        }
        if self.decay_interval_secs == 0 {
            return invalid("decay_interval_secs", "must be positive");
        }
        if self.pool_size == 0 {
            return invalid("pool_size", "must be positive");
        }
        if self.op_timeout_ms == 0 {
            return invalid("op_timeout_ms", "must be positive");
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url == IN_MEMORY
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            embedding_dim: self.embedding_dim,
            pool_size: self.pool_size,
            op_timeout: self.op_timeout(),
        }
    }

    pub fn decay_config(&self) -> DecayConfig {
        DecayConfig {
            base_rate: self.decay_base_rate,
            valence_weight: self.decay_valence_weight,
            interval: Duration::from_secs(self.decay_interval_secs),
            scope: None,
            op_timeout: self.op_timeout(),
        }
    }
}

/// Return the path to `~/.cogmem/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cogmem").join("config.toml")
}

/// Load from the default path.
pub fn load() -> Result<MemoryConfig, ConfigError> {
    load_from(&config_path())
}

/// Load from `path`, apply environment overrides and validate.
pub fn load_from(path: &Path) -> Result<MemoryConfig, ConfigError> {
    let mut cfg = read_file(path)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// File layer only; defaults when the file is absent.
pub(crate) fn read_file(path: &Path) -> Result<MemoryConfig, ConfigError> {
    if !path.exists() {
        return Ok(MemoryConfig::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&raw)?)
}

/// Apply `COGMEM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `COGMEM_DATABASE_URL` | `database_url` |
/// | `COGMEM_EMBEDDING_DIM` | `embedding_dim` |
/// | `COGMEM_DECAY_BASE_RATE` | `decay_base_rate` |
/// | `COGMEM_DECAY_VALENCE_WEIGHT` | `decay_valence_weight` |
/// | `COGMEM_DECAY_INTERVAL_SECS` | `decay_interval_secs` |
/// | `COGMEM_POOL_SIZE` | `pool_size` |
/// | `COGMEM_OP_TIMEOUT_MS` | `op_timeout_ms` |
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_overrides(cfg: &mut MemoryConfig) {
    if let Ok(v) = std::env::var("COGMEM_DATABASE_URL") {
        cfg.database_url = v;
    }
    override_parsed("COGMEM_EMBEDDING_DIM", &mut cfg.embedding_dim);
    override_parsed("COGMEM_DECAY_BASE_RATE", &mut cfg.decay_base_rate);
    override_parsed("COGMEM_DECAY_VALENCE_WEIGHT", &mut cfg.decay_valence_weight);
    override_parsed("COGMEM_DECAY_INTERVAL_SECS", &mut cfg.decay_interval_secs);
    override_parsed("COGMEM_POOL_SIZE", &mut cfg.pool_size);
    override_parsed("COGMEM_OP_TIMEOUT_MS", &mut cfg.op_timeout_ms);
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        match v.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var, value = %v, "ignoring unparseable environment override"),
        }
    }
}

/// Save to the default path, creating `~/.cogmem/` if necessary.
pub fn save(cfg: &MemoryConfig) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &MemoryConfig, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}
