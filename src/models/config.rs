//! Configuration models for geobatch.
//!
//! All tunable parameters are resolved here from a TOML file; every field
//! has a sensible default so a minimal config is valid.

use crate::models::GeometryKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for geobatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chunked processing engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Pre-flight validation settings
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Transaction manager settings
    #[serde(default)]
    pub transaction: TransactionConfig,
}

/// Chunked processing engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Records per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum concurrent workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Advisory memory ceiling in MB. Measured and reported, never enforced:
    /// a chunk exceeding it is logged, not killed or retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<f64>,
}

fn default_chunk_size() -> usize {
    100
}

fn default_max_workers() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_workers: default_max_workers(),
            memory_limit_mb: None,
        }
    }
}

/// Pre-flight validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Fields every record is expected to carry (matched case-insensitively)
    #[serde(default)]
    pub required_fields: Vec<String>,

    /// Expected CRS identifier
    #[serde(default = "default_crs")]
    pub expected_crs: String,

    /// Expected geometry kind for every record
    #[serde(default = "default_geometry_kind")]
    pub expected_geometry: GeometryKind,
}

fn default_crs() -> String {
    "EPSG:4326".to_string()
}

fn default_geometry_kind() -> GeometryKind {
    GeometryKind::Polygon
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            expected_crs: default_crs(),
            expected_geometry: default_geometry_kind(),
        }
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Path to the SQLite database. Omit for an in-memory database.
    /// Supports ${ENV_VAR} expansion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Directory for checkpoint files. Supports ${ENV_VAR} expansion.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            database: None,
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.engine.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_workers".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Checkpoint directory with environment variables expanded.
    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.transaction.checkpoint_dir))
    }

    /// Database path with environment variables expanded, if configured.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.transaction
            .database
            .as_ref()
            .map(|p| PathBuf::from(expand_env_vars(p)))
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax. If the variable is not set, the placeholder
/// is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    static ENV_VAR_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ENV_VAR_RE.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
