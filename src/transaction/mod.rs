//! Transaction manager: guarded table mutations with durable checkpoints.

mod checkpoint;
mod manager;

pub use checkpoint::{load_checkpoints, write_checkpoint, Checkpoint, CheckpointState};
pub use manager::{TableHandle, TransactionManager, TransactionRecord, TransactionState};
