//! Durable checkpoints for transaction outcomes.
//!
//! Every transaction scope, successful or failed, leaves exactly one
//! `checkpoint_<transaction_id>.json` behind. Checkpoints are never
//! overwritten; together they form an append-only audit trail an external
//! recovery tool can replay (the backup table named in a failed checkpoint
//! is the restore source).

use crate::models::{GeobatchError, Result};
use crate::transaction::{TransactionRecord, TransactionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Terminal snapshot of one transaction, as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub transaction_id: String,
    pub table_name: String,
    pub schema: String,
    /// When the checkpoint was written
    pub timestamp: DateTime<Utc>,
    pub state: CheckpointState,
}

/// The transaction record's terminal form embedded in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub table_name: String,
    pub schema: String,
    pub start_time: DateTime<Utc>,
    pub state: TransactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Build a checkpoint from a transaction record's terminal state.
    pub fn from_record(record: &TransactionRecord) -> Self {
        Self {
            transaction_id: record.transaction_id.clone(),
            table_name: record.table_name.clone(),
            schema: record.schema.clone(),
            timestamp: Utc::now(),
            state: CheckpointState {
                table_name: record.table_name.clone(),
                schema: record.schema.clone(),
                start_time: record.start_time,
                state: record.state,
                error: record.error.clone(),
                error_time: record.error_time,
            },
        }
    }
}

/// Write one checkpoint file. Fails if the file already exists: the trail is
/// append-only.
pub fn write_checkpoint(dir: &Path, record: &TransactionRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| GeobatchError::io("creating checkpoint dir", e))?;

    let checkpoint = Checkpoint::from_record(record);
    let path = dir.join(format!("checkpoint_{}.json", checkpoint.transaction_id));

    let content = serde_json::to_string_pretty(&checkpoint)
        .map_err(|e| GeobatchError::Internal(format!("Serializing checkpoint: {e}")))?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| GeobatchError::io(format!("creating checkpoint {}", path.display()), e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| GeobatchError::io("writing checkpoint", e))?;
    file.sync_all()
        .map_err(|e| GeobatchError::io("syncing checkpoint", e))?;

    debug!(path = %path.display(), state = ?record.state, "Checkpoint written");
    Ok(path)
}

/// Load the full checkpoint trail from a directory, oldest first.
///
/// This is the entry point for the external recovery tool: a `failed`
/// checkpoint names the table and the backup that restored it.
pub fn load_checkpoints(dir: &Path) -> Result<Vec<Checkpoint>> {
    let pattern = dir.join("checkpoint_*.json");
    let pattern_str = pattern.to_string_lossy();

    let paths: Vec<_> = glob::glob(&pattern_str)
        .map_err(|e| GeobatchError::Internal(format!("Invalid glob pattern: {e}")))?
        .filter_map(|r| r.ok())
        .collect();

    let mut checkpoints = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(&path)
            .map_err(|e| GeobatchError::io(format!("reading checkpoint {}", path.display()), e))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            GeobatchError::ParseError(format!("Invalid checkpoint {}: {e}", path.display()))
        })?;
        checkpoints.push(checkpoint);
    }

    checkpoints.sort_by_key(|c| c.timestamp);
    Ok(checkpoints)
}
