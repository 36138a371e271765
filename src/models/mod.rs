//! Core data models: datasets, configuration, statistics, errors.

mod config;
mod dataset;
mod error;
mod stats;

pub use config::{expand_env_vars, Config, ConfigError, EngineConfig, TransactionConfig, ValidationConfig};
pub use dataset::{Chunk, Dataset, DatasetSchema, Geometry, GeometryKind, Record};
pub use error::{GeobatchError, Result};
pub use stats::ProcessingStats;
