//! Worker pool executing chunk transforms in isolation.
//!
//! Every chunk runs the caller's transform on a dedicated blocking task, so
//! a panic or error stays local to that chunk: the orchestrator observes a
//! typed `ChunkError` and the run continues. Chunks are handed to workers as
//! owned values; nothing shared crosses the task boundary.

use crate::engine::memory::{sample_rss_mb, MemorySampler};
use crate::models::{Chunk, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

/// Caller-supplied transform run once per chunk.
pub type ChunkTransform = Arc<dyn Fn(Chunk) -> Result<Chunk> + Send + Sync>;

/// Failure local to one chunk. Never aborts the run.
#[derive(Debug, Clone, Error)]
pub enum ChunkError {
    /// The transform returned an error
    #[error("chunk {chunk_id}: transform failed: {message}")]
    Transform { chunk_id: usize, message: String },

    /// The transform panicked; the panic was contained in its task
    #[error("chunk {chunk_id}: transform panicked")]
    Panicked { chunk_id: usize },

    /// The transform returned a chunk that violates the shape contract
    #[error("chunk {chunk_id}: transform returned chunk id {found}")]
    ShapeMismatch { chunk_id: usize, found: usize },
}

/// Outcome of one chunk submission.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk_id: usize,

    /// Records handed to the transform
    pub records_in: usize,

    pub elapsed: Duration,

    /// Orchestrator RSS delta across the transform, in MB
    pub memory_delta_mb: f64,

    pub result: std::result::Result<Chunk, ChunkError>,
}

/// Bounded pool running one transform per chunk.
pub struct ChunkWorkerPool {
    transform: ChunkTransform,
    semaphore: Arc<Semaphore>,
    sampler: Arc<Mutex<MemorySampler>>,
}

impl ChunkWorkerPool {
    pub fn new(max_workers: usize, transform: ChunkTransform) -> Self {
        Self {
            transform,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            sampler: Arc::new(Mutex::new(MemorySampler::new())),
        }
    }

    /// Submit every chunk and block until all of them resolve.
    ///
    /// Outcomes are returned in submission order regardless of completion
    /// order.
    pub async fn process_all(&self, chunks: Vec<Chunk>) -> Vec<ChunkOutcome> {
        let mut handles = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let transform = Arc::clone(&self.transform);
            let semaphore = Arc::clone(&self.semaphore);
            let sampler = Arc::clone(&self.sampler);

            // Kept next to the handle so a lost task can still be reported
            // against the right chunk.
            let chunk_id = chunk.chunk_id;
            let records_in = chunk.records.len();
            let handle = tokio::spawn(async move {
                run_one(transform, semaphore, sampler, chunk).await
            });
            handles.push((chunk_id, records_in, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (chunk_id, records_in, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                // The wrapper task itself never panics; treat a lost task
                // like a contained transform panic.
                Err(e) => {
                    warn!(chunk_id, error = %e, "Chunk task lost");
                    outcomes.push(ChunkOutcome {
                        chunk_id,
                        records_in,
                        elapsed: Duration::ZERO,
                        memory_delta_mb: 0.0,
                        result: Err(ChunkError::Panicked { chunk_id }),
                    });
                }
            }
        }
        outcomes
    }
}

async fn run_one(
    transform: ChunkTransform,
    semaphore: Arc<Semaphore>,
    sampler: Arc<Mutex<MemorySampler>>,
    chunk: Chunk,
) -> ChunkOutcome {
    let chunk_id = chunk.chunk_id;
    let records_in = chunk.records.len();
    let expected_schema = chunk.schema.clone();

    let permit = semaphore.acquire_owned().await;
    if permit.is_err() {
        return ChunkOutcome {
            chunk_id,
            records_in,
            elapsed: Duration::ZERO,
            memory_delta_mb: 0.0,
            result: Err(ChunkError::Transform {
                chunk_id,
                message: "worker pool closed".to_string(),
            }),
        };
    }

    let rss_before = sample_rss_mb(&sampler);
    let started = Instant::now();

    let joined = tokio::task::spawn_blocking(move || transform(chunk)).await;

    let elapsed = started.elapsed();
    let memory_delta_mb = sample_rss_mb(&sampler) - rss_before;

    let result = match joined {
        // A panic inside the transform surfaces as a JoinError here and
        // stays contained to this chunk.
        Err(join_err) => {
            warn!(chunk_id, error = %join_err, "Transform panicked");
            Err(ChunkError::Panicked { chunk_id })
        }
        Ok(Err(e)) => Err(ChunkError::Transform {
            chunk_id,
            message: e.to_string(),
        }),
        Ok(Ok(mut output)) => {
            if output.chunk_id != chunk_id {
                Err(ChunkError::ShapeMismatch {
                    chunk_id,
                    found: output.chunk_id,
                })
            } else {
                // Schema stability is a hard guarantee of the reassembled
                // output: drift is corrected back, never propagated.
                if output.schema != expected_schema {
                    warn!(
                        chunk_id,
                        found_crs = %output.schema.crs,
                        expected_crs = %expected_schema.crs,
                        "Transform changed chunk schema; restoring original"
                    );
                    output.schema = expected_schema;
                }
                Ok(output)
            }
        }
    };

    ChunkOutcome {
        chunk_id,
        records_in,
        elapsed,
        memory_delta_mb,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chunker::split_into_chunks;
    use crate::models::{DatasetSchema, GeobatchError, Record};

    fn chunks(n: usize, chunk_size: usize) -> Vec<Chunk> {
        let records = (0..n).map(|_| Record::new(serde_json::Map::new(), None)).collect();
        split_into_chunks(&DatasetSchema::new("geometry", "EPSG:4326"), records, chunk_size)
    }

    #[tokio::test]
    async fn panic_in_transform_is_contained() {
        let transform: ChunkTransform = Arc::new(|chunk: Chunk| {
            if chunk.chunk_id == 1 {
                panic!("worker blew up");
            }
            Ok(chunk)
        });
        let pool = ChunkWorkerPool::new(2, transform);
        let outcomes = pool.process_all(chunks(30, 10)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(ChunkError::Panicked { chunk_id: 1 })
        ));
        assert!(outcomes[2].result.is_ok());
    }

    #[tokio::test]
    async fn transform_error_is_localized() {
        let transform: ChunkTransform = Arc::new(|chunk: Chunk| {
            if chunk.chunk_id == 0 {
                Err(GeobatchError::Internal("bad partition".to_string()))
            } else {
                Ok(chunk)
            }
        });
        let pool = ChunkWorkerPool::new(4, transform);
        let outcomes = pool.process_all(chunks(20, 10)).await;

        match &outcomes[0].result {
            Err(ChunkError::Transform { chunk_id: 0, message }) => {
                assert!(message.contains("bad partition"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn outcomes_track_submitted_chunks_not_submission_index() {
        // Submit out of id order: outcomes must still carry each chunk's
        // own id and record count.
        let mut batch = chunks(25, 10);
        batch.reverse();
        let sizes: Vec<(usize, usize)> =
            batch.iter().map(|c| (c.chunk_id, c.records.len())).collect();
        assert_eq!(sizes, vec![(2, 5), (1, 10), (0, 10)]);

        let pool = ChunkWorkerPool::new(2, Arc::new(|chunk: Chunk| Ok(chunk)));
        let outcomes = pool.process_all(batch).await;

        let seen: Vec<(usize, usize)> =
            outcomes.iter().map(|o| (o.chunk_id, o.records_in)).collect();
        assert_eq!(seen, sizes);
    }

    #[tokio::test]
    async fn schema_drift_is_corrected_back() {
        let transform: ChunkTransform = Arc::new(|mut chunk: Chunk| {
            chunk.schema = DatasetSchema::new("geom", "EPSG:3857");
            Ok(chunk)
        });
        let pool = ChunkWorkerPool::new(1, transform);
        let outcomes = pool.process_all(chunks(5, 5)).await;

        let chunk = outcomes[0].result.as_ref().unwrap();
        assert_eq!(chunk.schema, DatasetSchema::new("geometry", "EPSG:4326"));
    }

    #[tokio::test]
    async fn renumbered_chunk_fails_shape_contract() {
        let transform: ChunkTransform = Arc::new(|mut chunk: Chunk| {
            chunk.chunk_id += 100;
            Ok(chunk)
        });
        let pool = ChunkWorkerPool::new(1, transform);
        let outcomes = pool.process_all(chunks(5, 5)).await;

        assert!(matches!(
            outcomes[0].result,
            Err(ChunkError::ShapeMismatch { chunk_id: 0, found: 100 })
        ));
    }
}
