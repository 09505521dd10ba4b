//! Write-ahead transactions for flush batches.
//!
//! Epistemic foundation:
//! - K_i: A flush is all-or-nothing for the batch it covers
//! - K_i: Uses write-ahead pattern: record intent → apply → commit
//! - I^B: Crash mid-flush → pending file is replayed on the next open
//!
//! Replay is idempotent because partitions are deduplicated by item id.

use crate::models::{FinalizedItem, Result, TierError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::store::write_atomic;

/// Transaction state persisted to disk for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionState {
    /// Unique transaction ID
    pub id: String,
    /// Records the flush is about to apply
    pub records: Vec<FinalizedItem>,
    /// Timestamp when transaction started
    pub started_at: DateTime<Utc>,
}

/// Write-ahead record for one flush batch.
pub struct FlushTransaction {
    id: String,
    pending_path: PathBuf,
    records: usize,
    finished: bool,
}

impl FlushTransaction {
    /// Begin a transaction covering `records`.
    ///
    /// The pending file is written atomically before any partition is touched.
    pub fn begin(tx_dir: &Path, records: &[FinalizedItem]) -> Result<Self> {
        let id = format!(
            "tx_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S_%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let pending_path = tx_dir.join(format!("{id}.pending.json"));

        let state = TransactionState {
            id: id.clone(),
            records: records.to_vec(),
            started_at: Utc::now(),
        };
        let content = serde_json::to_vec(&state)
            .map_err(|e| TierError::Internal(format!("Serializing transaction: {e}")))?;
        write_atomic(&pending_path, &content)?;

        debug!(tx_id = %id, records = records.len(), "Flush transaction started");
        Ok(Self {
            id,
            pending_path,
            records: records.len(),
            finished: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mark the batch as fully applied.
    pub fn commit(mut self) -> Result<()> {
        self.remove_pending()?;
        self.finished = true;
        debug!(tx_id = %self.id, records = self.records, "Flush transaction committed");
        Ok(())
    }

    /// Discard the pending file; the caller keeps the batch in memory.
    pub fn abort(mut self) -> Result<()> {
        self.remove_pending()?;
        self.finished = true;
        debug!(tx_id = %self.id, "Flush transaction aborted");
        Ok(())
    }

    fn remove_pending(&self) -> Result<()> {
        if self.pending_path.exists() {
            fs::remove_file(&self.pending_path)
                .map_err(|e| TierError::io("removing pending transaction", e))?;
        }
        Ok(())
    }

    /// Find transactions left behind by a crash, oldest first.
    pub fn recover(tx_dir: &Path) -> Result<Vec<RecoveredBatch>> {
        let pattern = tx_dir.join("tx_*.pending.json");
        let pattern_str = pattern.to_string_lossy();

        let mut pending_files: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| TierError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        pending_files.sort();

        let mut batches = Vec::with_capacity(pending_files.len());
        for path in pending_files {
            warn!(path = %path.display(), "Found pending flush transaction, recovering");

            let content = fs::read_to_string(&path)
                .map_err(|e| TierError::io("reading pending transaction", e))?;

            match serde_json::from_str::<TransactionState>(&content) {
                Ok(state) => batches.push(RecoveredBatch {
                    path,
                    tx_id: state.id,
                    records: state.records,
                }),
                Err(e) => {
                    // Written atomically, so an unreadable file never reached a partition
                    warn!(path = %path.display(), error = %e, "Discarding unreadable pending transaction");
                    fs::remove_file(&path)
                        .map_err(|e| TierError::io("removing pending transaction", e))?;
                }
            }
        }

        Ok(batches)
    }
}

impl Drop for FlushTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                tx_id = %self.id,
                records = self.records,
                "Flush transaction dropped without commit/abort - will be replayed on restart"
            );
        }
    }
}

/// A batch recovered from a pending transaction file.
#[derive(Debug)]
pub struct RecoveredBatch {
    pub path: PathBuf,
    pub tx_id: String,
    pub records: Vec<FinalizedItem>,
}

impl RecoveredBatch {
    /// Remove the pending file once the batch has been re-applied.
    pub fn discard(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|e| TierError::io("removing pending transaction", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QAItem, RoundValue};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn errored(id: &str) -> FinalizedItem {
        FinalizedItem::failed(
            QAItem::new(
                id,
                RoundValue::Single("q".to_string()),
                RoundValue::Single("a".to_string()),
            ),
            BTreeMap::new(),
            vec!["model2".to_string()],
        )
    }

    fn pending_files(dir: &Path) -> Vec<PathBuf> {
        glob::glob(&dir.join("*.pending.json").to_string_lossy())
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_transaction_commit() {
        let temp_dir = TempDir::new().unwrap();
        let tx = FlushTransaction::begin(temp_dir.path(), &[errored("a"), errored("b")]).unwrap();
        assert_eq!(pending_files(temp_dir.path()).len(), 1);

        tx.commit().unwrap();
        assert!(pending_files(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_transaction_abort() {
        let temp_dir = TempDir::new().unwrap();
        let tx = FlushTransaction::begin(temp_dir.path(), &[errored("a")]).unwrap();
        tx.abort().unwrap();
        assert!(pending_files(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_transaction_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let tx = FlushTransaction::begin(temp_dir.path(), &[errored("a"), errored("b")]).unwrap();
        // Simulate a crash between begin and commit
        std::mem::forget(tx);

        let batches = FlushTransaction::recover(temp_dir.path()).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 2);
        assert_eq!(batches[0].records[1].id(), "b");

        for batch in batches {
            batch.discard().unwrap();
        }
        assert!(pending_files(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_unreadable_pending_file_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tx_broken.pending.json");
        fs::write(&path, "{not json").unwrap();

        let batches = FlushTransaction::recover(temp_dir.path()).unwrap();
        assert!(batches.is_empty());
        assert!(!path.exists());
    }
}
