//! Per-run processing statistics.
//!
//! One `ProcessingStats` is created empty at run start, mutated once per
//! chunk outcome, finalized once every chunk future has resolved, and never
//! reused across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated counters for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run finished (stamped by `finalize`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Number of chunks the dataset was split into
    pub total_chunks: usize,

    /// Chunks whose transform succeeded
    pub processed_chunks: usize,

    /// Ids of chunks whose transform failed, in ascending order
    pub failed_chunks: Vec<usize>,

    /// Records in the input dataset
    pub total_records: usize,

    /// Records in successfully processed chunks
    pub processed_records: usize,

    /// Orchestrator RSS delta per chunk, in MB (diagnostic, not enforcement)
    pub memory_usage: BTreeMap<usize, f64>,

    /// processed_chunks / total_chunks, stamped by `finalize`
    pub success_rate: f64,
}

impl ProcessingStats {
    /// Create empty stats for a run over `total_records` records split into
    /// `total_chunks` chunks.
    pub fn new(total_records: usize, total_chunks: usize) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            total_chunks,
            processed_chunks: 0,
            failed_chunks: Vec::new(),
            total_records,
            processed_records: 0,
            memory_usage: BTreeMap::new(),
            success_rate: 0.0,
        }
    }

    /// Record a successful chunk outcome.
    pub fn record_success(&mut self, chunk_id: usize, records: usize, memory_delta_mb: f64) {
        self.processed_chunks += 1;
        self.processed_records += records;
        self.memory_usage.insert(chunk_id, memory_delta_mb);
    }

    /// Record a failed chunk outcome.
    pub fn record_failure(&mut self, chunk_id: usize, memory_delta_mb: f64) {
        self.failed_chunks.push(chunk_id);
        self.memory_usage.insert(chunk_id, memory_delta_mb);
    }

    /// Stamp the end time and derived rates. Called exactly once, after all
    /// chunk futures have resolved.
    pub fn finalize(&mut self) {
        self.end_time = Some(Utc::now());
        self.failed_chunks.sort_unstable();
        self.success_rate = if self.total_chunks == 0 {
            1.0
        } else {
            self.processed_chunks as f64 / self.total_chunks as f64
        };
    }

    /// True when every chunk failed (the run produced no output).
    pub fn is_total_failure(&self) -> bool {
        self.processed_chunks == 0 && self.total_chunks > 0
    }
}
