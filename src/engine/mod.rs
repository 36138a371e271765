//! Resilient chunked processing engine.
//!
//! `run` partitions a dataset, executes the caller's transform across
//! isolated parallel workers, aggregates per-chunk outcomes into
//! `ProcessingStats`, and reassembles the successes in original order.
//!
//! Failure policy: one bad partition never sinks the run. A chunk whose
//! transform errors or panics is recorded in `failed_chunks` and skipped;
//! only a run where *zero* chunks succeed yields no output. Failed chunks
//! are never retried.

mod chunker;
mod memory;
mod pool;

pub use chunker::{reassemble, split_into_chunks};
pub use memory::MemorySampler;
pub use pool::{ChunkError, ChunkOutcome, ChunkTransform, ChunkWorkerPool};

use crate::models::{Dataset, EngineConfig, GeobatchError, ProcessingStats, Result};
use crate::monitor::{MetricsUpdate, Monitor, NoopMonitor};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one engine run: the reassembled dataset (None when every chunk
/// failed) plus the run's statistics. A non-None output can still carry
/// partial failures; callers must inspect `stats.failed_chunks`.
#[derive(Debug)]
pub struct RunOutcome {
    pub output: Option<Dataset>,
    pub stats: ProcessingStats,
}

/// Chunked processing engine.
pub struct ChunkedProcessor {
    config: EngineConfig,
    monitor: Arc<dyn Monitor>,
}

impl ChunkedProcessor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            monitor: Arc::new(NoopMonitor),
        }
    }

    pub fn with_monitor(config: EngineConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self { config, monitor }
    }

    /// Run `transform` over `dataset` in `chunk_size` partitions on at most
    /// `max_workers` concurrent workers. Blocks until every chunk resolves.
    ///
    /// Returns an error only for the type-contract precondition (a dataset
    /// that is not geometry-bearing); all per-chunk failures are aggregated
    /// into the returned stats instead.
    pub async fn run(
        &self,
        name: &str,
        dataset: Dataset,
        transform: ChunkTransform,
    ) -> Result<RunOutcome> {
        if !dataset.schema.is_geometry_bearing() {
            return Err(GeobatchError::InvalidInput(
                "dataset is not geometry-bearing: schema must declare a geometry field and CRS"
                    .to_string(),
            ));
        }

        let schema = dataset.schema.clone();
        let total_records = dataset.len();
        let chunks = split_into_chunks(&schema, dataset.records, self.config.chunk_size);
        let total_chunks = chunks.len();

        let mut stats = ProcessingStats::new(total_records, total_chunks);
        self.monitor.start_processing_metrics(name, total_chunks);

        info!(
            run = name,
            records = total_records,
            chunks = total_chunks,
            chunk_size = self.config.chunk_size,
            workers = self.config.max_workers,
            "Starting chunked run"
        );

        let pool = ChunkWorkerPool::new(self.config.max_workers, transform);
        let outcomes = pool.process_all(chunks).await;

        let mut successes = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if let Some(limit) = self.config.memory_limit_mb {
                if outcome.memory_delta_mb > limit {
                    // Advisory only: reported, never used to kill or retry.
                    warn!(
                        chunk_id = outcome.chunk_id,
                        memory_delta_mb = outcome.memory_delta_mb,
                        limit_mb = limit,
                        "Chunk exceeded advisory memory limit"
                    );
                }
            }

            match outcome.result {
                Ok(chunk) => {
                    stats.record_success(
                        outcome.chunk_id,
                        outcome.records_in,
                        outcome.memory_delta_mb,
                    );
                    self.monitor.update_processing_metrics(
                        name,
                        &MetricsUpdate {
                            processed: outcome.records_in,
                            elapsed_secs: outcome.elapsed.as_secs_f64(),
                            memory_mb: outcome.memory_delta_mb,
                            ..Default::default()
                        },
                    );
                    successes.push(chunk);
                }
                Err(error) => {
                    warn!(chunk_id = outcome.chunk_id, %error, "Chunk failed");
                    stats.record_failure(outcome.chunk_id, outcome.memory_delta_mb);
                    self.monitor.update_processing_metrics(
                        name,
                        &MetricsUpdate {
                            failed: 1,
                            processing_errors: 1,
                            elapsed_secs: outcome.elapsed.as_secs_f64(),
                            memory_mb: outcome.memory_delta_mb,
                            ..Default::default()
                        },
                    );
                }
            }
        }

        stats.finalize();

        let output = if successes.is_empty() {
            // Full-run failure: distinguishable from partial failure, which
            // still returns data.
            None
        } else {
            Some(reassemble(schema, successes))
        };

        info!(
            run = name,
            processed_chunks = stats.processed_chunks,
            failed_chunks = stats.failed_chunks.len(),
            processed_records = stats.processed_records,
            success_rate = stats.success_rate,
            "Chunked run complete"
        );

        Ok(RunOutcome { output, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DatasetSchema, Record};
    use serde_json::json;

    fn dataset(n: usize) -> Dataset {
        let records = (0..n)
            .map(|i| {
                let mut attrs = serde_json::Map::new();
                attrs.insert("seq".to_string(), json!(i));
                Record::new(attrs, None)
            })
            .collect();
        Dataset::new(DatasetSchema::new("geometry", "EPSG:4326"), records)
    }

    fn identity() -> ChunkTransform {
        Arc::new(|chunk: Chunk| Ok(chunk))
    }

    fn config(chunk_size: usize, max_workers: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            max_workers,
            memory_limit_mb: None,
        }
    }

    #[tokio::test]
    async fn identity_run_processes_everything() {
        // 1000 records, chunk_size 100, 4 workers.
        let engine = ChunkedProcessor::new(config(100, 4));
        let outcome = engine.run("scenario_a", dataset(1000), identity()).await.unwrap();

        assert_eq!(outcome.stats.total_chunks, 10);
        assert_eq!(outcome.stats.processed_chunks, 10);
        assert_eq!(outcome.stats.total_records, 1000);
        assert_eq!(outcome.stats.processed_records, 1000);
        assert!((outcome.stats.success_rate - 1.0).abs() < 1e-9);
        assert!(outcome.stats.failed_chunks.is_empty());

        let output = outcome.output.unwrap();
        assert_eq!(output.len(), 1000);
        assert_eq!(output.schema, DatasetSchema::new("geometry", "EPSG:4326"));
    }

    #[tokio::test]
    async fn output_is_deterministic_for_pure_transforms() {
        let transform: ChunkTransform = Arc::new(|mut chunk: Chunk| {
            for record in &mut chunk.records {
                let seq = record.attributes["seq"].as_i64().unwrap();
                record.attributes.insert("doubled".to_string(), json!(seq * 2));
            }
            Ok(chunk)
        });

        let engine = ChunkedProcessor::new(config(7, 3));
        let first = engine
            .run("det", dataset(50), Arc::clone(&transform))
            .await
            .unwrap()
            .output
            .unwrap();
        let second = engine.run("det", dataset(50), transform).await.unwrap().output.unwrap();

        assert_eq!(first.schema, second.schema);
        for (a, b) in first.records.iter().zip(&second.records) {
            assert_eq!(a.attributes, b.attributes);
        }
        for (i, record) in first.records.iter().enumerate() {
            assert_eq!(record.attributes["seq"], json!(i));
            assert_eq!(record.attributes["doubled"], json!(i as i64 * 2));
        }
    }

    #[tokio::test]
    async fn single_bad_chunk_is_contained() {
        // Chunk 2 (records 20..30) fails; everything else survives.
        let transform: ChunkTransform = Arc::new(|chunk: Chunk| {
            if chunk.chunk_id == 2 {
                Err(GeobatchError::Internal("poisoned partition".to_string()))
            } else {
                Ok(chunk)
            }
        });

        let engine = ChunkedProcessor::new(config(10, 4));
        let outcome = engine.run("partial", dataset(50), transform).await.unwrap();

        assert_eq!(outcome.stats.failed_chunks, vec![2]);
        assert_eq!(outcome.stats.processed_records, 40);
        assert_eq!(outcome.stats.total_records, 50);

        let output = outcome.output.unwrap();
        assert_eq!(output.len(), 40);
        let seqs: Vec<i64> = output
            .records
            .iter()
            .map(|r| r.attributes["seq"].as_i64().unwrap())
            .collect();
        let expected: Vec<i64> = (0..50).filter(|s| !(20..30).contains(s)).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn zero_successes_yield_no_output() {
        let transform: ChunkTransform =
            Arc::new(|_chunk: Chunk| Err(GeobatchError::Internal("all bad".to_string())));

        let engine = ChunkedProcessor::new(config(10, 2));
        let outcome = engine.run("all_fail", dataset(30), transform).await.unwrap();

        assert!(outcome.output.is_none());
        assert!(outcome.stats.is_total_failure());
        assert_eq!(outcome.stats.failed_chunks, vec![0, 1, 2]);
        assert_eq!(outcome.stats.processed_records, 0);
    }

    #[tokio::test]
    async fn non_geometry_bearing_dataset_is_rejected_up_front() {
        let bad = Dataset::new(DatasetSchema::new("", "EPSG:4326"), Vec::new());
        let engine = ChunkedProcessor::new(config(10, 2));

        let err = engine.run("bad", bad, identity()).await.unwrap_err();
        assert!(matches!(err, GeobatchError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn monitor_sees_per_chunk_updates() {
        use crate::monitor::LogMonitor;

        let monitor = Arc::new(LogMonitor::new());
        let transform: ChunkTransform = Arc::new(|chunk: Chunk| {
            if chunk.chunk_id == 0 {
                Err(GeobatchError::Internal("nope".to_string()))
            } else {
                Ok(chunk)
            }
        });

        let engine = ChunkedProcessor::with_monitor(config(10, 2), Arc::clone(&monitor) as Arc<dyn Monitor>);
        engine.run("monitored", dataset(30), transform).await.unwrap();

        let metrics = monitor.get_processing_metrics("monitored").unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.processed, 20);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.processing_errors, 1);
    }
}
