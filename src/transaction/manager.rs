//! Scoped backup/restore transactions over named tables.
//!
//! `with_transaction` snapshots the table into a backup before the body
//! runs, then on every exit path either commits (drop the backup) or
//! restores (drop the live table, recreate it from the backup, drop the
//! backup) and returns the body's error unchanged. Protocol statements run
//! in autocommit mode; atomicity across the whole scope is emulated by the
//! backup/restore protocol, not delegated to a native multi-statement
//! database transaction.
//!
//! A hard process kill that bypasses the error path leaves the backup table
//! orphaned. That gap is documented, not silently fixed: the checkpoint
//! trail names the backup so an external recovery tool can replay the
//! drop/recreate/drop sequence by hand.

use crate::models::{GeobatchError, Result};
use crate::monitor::{MetricsUpdate, Monitor, NoopMonitor};
use crate::transaction::checkpoint::write_checkpoint;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// SQLite's default schema name.
const DEFAULT_SCHEMA: &str = "main";

/// Lifecycle state of one guarded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Active,
    Completed,
    Failed,
}

/// One guarded mutation episode over a named table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// table name + timestamp
    pub transaction_id: String,
    pub table_name: String,
    pub schema: String,
    pub start_time: DateTime<Utc>,
    pub state: TransactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_time: Option<DateTime<Utc>>,
}

/// Handle yielded to a transaction body. Statements go through the shared
/// connection one at a time, so transactions on different tables can nest
/// and interleave freely.
pub struct TableHandle<'a> {
    manager: &'a TransactionManager,
    table: String,
}

impl TableHandle<'_> {
    /// Name of the guarded table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Execute one statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        self.manager.execute(sql, params)
    }

    /// Current row count of the guarded table.
    pub fn row_count(&self) -> Result<usize> {
        self.manager.row_count(&self.table)
    }
}

/// Manager wrapping named-table mutations in snapshot/commit/restore
/// semantics with durable checkpointing.
pub struct TransactionManager {
    conn: Arc<Mutex<Connection>>,
    checkpoint_dir: PathBuf,
    active: Mutex<HashMap<String, TransactionRecord>>,
    monitor: Arc<dyn Monitor>,
}

impl TransactionManager {
    /// Open a manager over a database file, or in memory when `database` is
    /// None.
    pub fn new(database: Option<&Path>, checkpoint_dir: &Path) -> Result<Self> {
        Self::with_monitor(database, checkpoint_dir, Arc::new(NoopMonitor))
    }

    /// Like `new`, but reporting transaction outcomes into `monitor`.
    pub fn with_monitor(
        database: Option<&Path>,
        checkpoint_dir: &Path,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        let conn = match database {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        std::fs::create_dir_all(checkpoint_dir)
            .map_err(|e| GeobatchError::io("creating checkpoint dir", e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            active: Mutex::new(HashMap::new()),
            monitor,
        })
    }

    /// Run `body` against `table` under the backup/restore protocol.
    ///
    /// On a clean exit the backup is dropped and a `completed` checkpoint is
    /// written. On error the table is restored from the backup, a `failed`
    /// checkpoint is written, and the body's error is returned unchanged.
    pub fn with_transaction<T, F>(&self, table: &str, body: F) -> Result<T>
    where
        F: FnOnce(&TableHandle<'_>) -> Result<T>,
    {
        let start_time = Utc::now();
        let scope_timer = Instant::now();
        let ts = start_time.format("%Y%m%d_%H%M%S_%3f");
        let transaction_id = format!("{table}_{ts}");
        let backup_table = format!("{table}_backup_{ts}");

        self.execute(
            &format!(
                "CREATE TABLE {} AS SELECT * FROM {}",
                quote_ident(&backup_table),
                quote_ident(table)
            ),
            [],
        )?;

        self.register(TransactionRecord {
            transaction_id: transaction_id.clone(),
            table_name: table.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            start_time,
            state: TransactionState::Active,
            error: None,
            error_time: None,
        });
        debug!(transaction_id = %transaction_id, backup = %backup_table, "Transaction started");

        let handle = TableHandle {
            manager: self,
            table: table.to_string(),
        };

        match body(&handle) {
            Ok(value) => {
                self.drop_table(&backup_table)?;
                let record = self.finish(&transaction_id, TransactionState::Completed, None);
                self.checkpoint(&record);
                self.monitor.update_processing_metrics(
                    table,
                    &MetricsUpdate {
                        processed: 1,
                        elapsed_secs: scope_timer.elapsed().as_secs_f64(),
                        ..Default::default()
                    },
                );
                info!(transaction_id = %transaction_id, "Transaction committed");
                Ok(value)
            }
            Err(body_err) => {
                let restore = self.restore_from_backup(table, &backup_table);
                let record = self.finish(
                    &transaction_id,
                    TransactionState::Failed,
                    Some(body_err.to_string()),
                );
                self.checkpoint(&record);
                self.monitor.update_processing_metrics(
                    table,
                    &MetricsUpdate {
                        failed: 1,
                        processing_errors: 1,
                        elapsed_secs: scope_timer.elapsed().as_secs_f64(),
                        ..Default::default()
                    },
                );
                warn!(
                    transaction_id = %transaction_id,
                    error = %body_err,
                    "Transaction rolled back"
                );

                match restore {
                    // Restore succeeded: re-raise the original error.
                    Ok(()) => Err(body_err),
                    Err(restore_err) => Err(GeobatchError::Transaction {
                        table: table.to_string(),
                        message: format!(
                            "rollback from {backup_table} failed: {restore_err} \
                             (original error: {body_err})"
                        ),
                    }),
                }
            }
        }
    }

    /// Snapshot of every currently open transaction.
    pub fn list_active_transactions(&self) -> Vec<TransactionRecord> {
        self.lock_active().values().cloned().collect()
    }

    /// Live-registry lookup by transaction id. Terminal transactions are no
    /// longer here; their fate lives in the checkpoint trail.
    pub fn get_transaction_status(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.lock_active().get(transaction_id).cloned()
    }

    /// Execute one statement on the shared connection.
    pub fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        Ok(self.conn().execute(sql, params)?)
    }

    /// Row count of a table.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Names of all user tables, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Directory the checkpoint trail is written into.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    fn restore_from_backup(&self, table: &str, backup_table: &str) -> Result<()> {
        self.drop_table(table)?;
        self.execute(
            &format!(
                "CREATE TABLE {} AS SELECT * FROM {}",
                quote_ident(table),
                quote_ident(backup_table)
            ),
            [],
        )?;
        self.drop_table(backup_table)?;
        debug!(table, backup = backup_table, "Table restored from backup");
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
        Ok(())
    }

    fn register(&self, record: TransactionRecord) {
        self.lock_active()
            .insert(record.transaction_id.clone(), record);
    }

    /// Stamp the record's terminal state and remove it from the live
    /// registry. The returned terminal form is what gets checkpointed.
    fn finish(
        &self,
        transaction_id: &str,
        state: TransactionState,
        error: Option<String>,
    ) -> TransactionRecord {
        let mut active = self.lock_active();
        let mut record = active.remove(transaction_id).unwrap_or_else(|| {
            // Registry entries are created on enter; a miss here is a bug
            // but must not lose the checkpoint.
            error!(transaction_id, "Transaction missing from live registry");
            TransactionRecord {
                transaction_id: transaction_id.to_string(),
                table_name: String::new(),
                schema: DEFAULT_SCHEMA.to_string(),
                start_time: Utc::now(),
                state: TransactionState::Active,
                error: None,
                error_time: None,
            }
        });
        record.state = state;
        if let Some(message) = error {
            record.error = Some(message);
            record.error_time = Some(Utc::now());
        }
        record
    }

    fn checkpoint(&self, record: &TransactionRecord) {
        // Checkpoint durability matters, but a failed write must not mask
        // the transaction outcome the caller is waiting on.
        if let Err(e) = write_checkpoint(&self.checkpoint_dir, record) {
            error!(
                transaction_id = %record.transaction_id,
                error = %e,
                "Failed to write checkpoint"
            );
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, TransactionRecord>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Double-quote an identifier for SQLite, escaping embedded quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::checkpoint::load_checkpoints;
    use tempfile::TempDir;

    fn manager_with_parcels(rows: usize) -> (TransactionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let manager = TransactionManager::new(None, dir.path()).unwrap();
        manager
            .execute("CREATE TABLE parcels (id INTEGER, ndvi REAL)", [])
            .unwrap();
        for i in 0..rows {
            manager
                .execute(
                    "INSERT INTO parcels (id, ndvi) VALUES (?1, ?2)",
                    rusqlite::params![i as i64, 0.5],
                )
                .unwrap();
        }
        (manager, dir)
    }

    fn backup_tables(manager: &TransactionManager) -> Vec<String> {
        manager
            .list_tables()
            .unwrap()
            .into_iter()
            .filter(|t| t.contains("_backup_"))
            .collect()
    }

    #[test]
    fn successful_append_commits_and_drops_backup() {
        // Scenario: append 5 rows to parcels successfully.
        let (manager, _dir) = manager_with_parcels(3);

        manager
            .with_transaction("parcels", |tx| {
                for i in 100..105 {
                    tx.execute(
                        "INSERT INTO parcels (id, ndvi) VALUES (?1, ?2)",
                        rusqlite::params![i, 0.7],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(manager.row_count("parcels").unwrap(), 8);
        assert!(backup_tables(&manager).is_empty());

        let trail = load_checkpoints(manager.checkpoint_dir()).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].table_name, "parcels");
        assert_eq!(trail[0].state.state, TransactionState::Completed);
        assert!(trail[0].state.error.is_none());
    }

    #[test]
    fn failed_body_restores_pre_transaction_content() {
        // Scenario: insert mid-way, then raise. The table must come back
        // exactly as it was and no backup may remain.
        let (manager, _dir) = manager_with_parcels(4);

        let result: Result<()> = manager.with_transaction("parcels", |tx| {
            tx.execute("INSERT INTO parcels (id, ndvi) VALUES (200, 0.9)", [])?;
            tx.execute("INSERT INTO parcels (id, ndvi) VALUES (201, 0.9)", [])?;
            assert_eq!(tx.row_count()?, 6);
            Err(GeobatchError::Internal("mid-way failure".to_string()))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, GeobatchError::Internal(_)), "original error must be re-raised");

        assert_eq!(manager.row_count("parcels").unwrap(), 4);
        assert!(backup_tables(&manager).is_empty());

        let trail = load_checkpoints(manager.checkpoint_dir()).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].state.state, TransactionState::Failed);
        let error = trail[0].state.error.as_deref().unwrap();
        assert!(error.contains("mid-way failure"));
        assert!(trail[0].state.error_time.is_some());
    }

    #[test]
    fn registry_tracks_scope_lifetime() {
        let (manager, _dir) = manager_with_parcels(1);

        manager
            .with_transaction("parcels", |_tx| {
                let active = manager.list_active_transactions();
                assert_eq!(active.len(), 1);
                assert_eq!(active[0].table_name, "parcels");
                assert_eq!(active[0].state, TransactionState::Active);
                assert!(manager
                    .get_transaction_status(&active[0].transaction_id)
                    .is_some());
                Ok(())
            })
            .unwrap();

        assert!(manager.list_active_transactions().is_empty());
    }

    #[test]
    fn transactions_on_different_tables_nest() {
        let (manager, _dir) = manager_with_parcels(2);
        manager
            .execute("CREATE TABLE plots (id INTEGER)", [])
            .unwrap();

        manager
            .with_transaction("parcels", |outer| {
                outer.execute("INSERT INTO parcels (id, ndvi) VALUES (1, 0.1)", [])?;
                manager.with_transaction("plots", |inner| {
                    inner.execute("INSERT INTO plots (id) VALUES (1)", [])?;
                    assert_eq!(manager.list_active_transactions().len(), 2);
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(manager.row_count("parcels").unwrap(), 3);
        assert_eq!(manager.row_count("plots").unwrap(), 1);
        assert!(backup_tables(&manager).is_empty());
        assert_eq!(load_checkpoints(manager.checkpoint_dir()).unwrap().len(), 2);
    }

    #[test]
    fn inner_rollback_does_not_disturb_outer_table() {
        let (manager, _dir) = manager_with_parcels(2);
        manager
            .execute("CREATE TABLE plots (id INTEGER)", [])
            .unwrap();

        manager
            .with_transaction("parcels", |outer| {
                outer.execute("INSERT INTO parcels (id, ndvi) VALUES (1, 0.1)", [])?;
                let inner: Result<()> = manager.with_transaction("plots", |tx| {
                    tx.execute("INSERT INTO plots (id) VALUES (1)", [])?;
                    Err(GeobatchError::Internal("inner failure".to_string()))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();

        assert_eq!(manager.row_count("parcels").unwrap(), 3);
        assert_eq!(manager.row_count("plots").unwrap(), 0);
    }

    #[test]
    fn every_scope_leaves_exactly_one_checkpoint() {
        let (manager, _dir) = manager_with_parcels(1);

        manager.with_transaction("parcels", |_tx| Ok(())).unwrap();
        // Ids carry millisecond timestamps; keep them distinct.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = manager.with_transaction("parcels", |_tx| {
            Err::<(), _>(GeobatchError::Internal("boom".to_string()))
        });

        let trail = load_checkpoints(manager.checkpoint_dir()).unwrap();
        assert_eq!(trail.len(), 2);
        let states: Vec<_> = trail.iter().map(|c| c.state.state).collect();
        assert!(states.contains(&TransactionState::Completed));
        assert!(states.contains(&TransactionState::Failed));
    }

    #[test]
    fn monitor_sees_transaction_outcomes() {
        use crate::monitor::{LogMonitor, Monitor};

        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(LogMonitor::new());
        let manager =
            TransactionManager::with_monitor(None, dir.path(), Arc::clone(&monitor) as Arc<dyn Monitor>)
                .unwrap();
        manager
            .execute("CREATE TABLE parcels (id INTEGER)", [])
            .unwrap();

        manager
            .with_transaction("parcels", |tx| {
                tx.execute("INSERT INTO parcels (id) VALUES (1)", [])?;
                Ok(())
            })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = manager.with_transaction("parcels", |_tx| {
            Err::<(), _>(GeobatchError::Internal("boom".to_string()))
        });

        let metrics = monitor.get_processing_metrics("parcels").unwrap();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.processing_errors, 1);
        assert!(metrics.total_time_secs > 0.0);
    }

    #[test]
    fn missing_table_fails_before_body_runs() {
        let dir = TempDir::new().unwrap();
        let manager = TransactionManager::new(None, dir.path()).unwrap();

        let mut body_ran = false;
        let result = manager.with_transaction("no_such_table", |_tx| {
            body_ran = true;
            Ok(())
        });

        assert!(result.is_err());
        assert!(!body_ran);
        assert!(load_checkpoints(dir.path()).unwrap().is_empty());
    }
}
