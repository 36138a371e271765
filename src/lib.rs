//! geobatch - Resilient chunked processing for geospatial batch runs.
//!
//! ## Architecture
//!
//! - **Validator**: pre-flight schema/geometry/CRS gate over a dataset
//! - **Engine**: splits a dataset into ordered chunks, runs a caller-supplied
//!   transform across isolated parallel workers, aggregates outcomes, and
//!   reassembles the successes in original order
//! - **Transaction manager**: wraps named-table mutations in a
//!   snapshot/commit/restore protocol with durable checkpointing
//!
//! ## Failure model
//!
//! - A chunk failure is local: it lands in `ProcessingStats::failed_chunks`
//!   and the run continues. Only a run with zero successful chunks produces
//!   no output.
//! - A transaction failure is never swallowed: the table is restored from
//!   its backup and the original error is returned to the caller.

pub mod engine;
pub mod models;
pub mod monitor;
pub mod transaction;
pub mod validate;

// Re-exports for convenience
pub use engine::{ChunkError, ChunkTransform, ChunkedProcessor, RunOutcome};
pub use models::{Chunk, Config, Dataset, DatasetSchema, GeobatchError, ProcessingStats, Record, Result};
pub use monitor::{LogMonitor, Monitor, NoopMonitor};
pub use transaction::{TransactionManager, TransactionRecord};
pub use validate::{ValidationIssue, ValidationReport, Validator};
