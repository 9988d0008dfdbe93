//! Durable archive of finished job results, backed by redb.
//!
//! Each record is stored as JSON text under the key `<job>\x1f<seq>`, with
//! the sequence number zero-padded so keys sort in run order. Records that
//! fail to parse on reload are skipped with a warning; the rest still load.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::atom::JobId;
use crate::error::StoreError;
use crate::store::StoreResult;

/// File name of the archive inside a data directory.
pub const ARCHIVE_FILE: &str = "results.redb";

const RESULTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("job_results");

const KEY_SEPARATOR: char = '\u{1f}';

fn redb_error(what: &'static str) -> impl FnOnce(redb::Error) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{what} failed: {e}"),
    }
}

fn key(job: &JobId, seq: u64) -> String {
    format!("{job}{KEY_SEPARATOR}{seq:020}")
}

fn prefix(job: &JobId) -> String {
    format!("{job}{KEY_SEPARATOR}")
}

/// ACID archive of serialized job results.
pub struct ResultArchive {
    db: Arc<Database>,
}

impl ResultArchive {
    /// Open or create the archive in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let path = data_dir.join(ARCHIVE_FILE);
        let db = Database::create(&path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Store one result under `job` with sequence number `seq`.
    pub fn append<T: Serialize>(&self, job: &JobId, seq: u64, record: &T) -> StoreResult<()> {
        let text = serde_json::to_string(record).map_err(|e| StoreError::Serialization {
            message: format!("failed to encode result for {job}: {e}"),
        })?;
        self.put_raw(&key(job, seq), &text)
    }

    fn put_raw(&self, key: &str, text: &str) -> StoreResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_error("begin_write")(e.into()))?;
        {
            let mut table = txn
                .open_table(RESULTS_TABLE)
                .map_err(|e| redb_error("open_table")(e.into()))?;
            table
                .insert(key, text)
                .map_err(|e| redb_error("insert")(e.into()))?;
        }
        txn.commit().map_err(|e| redb_error("commit")(e.into()))?;
        Ok(())
    }

    /// Raw `(key, text)` entries for a job, in sequence order.
    fn entries(&self, job: &JobId) -> StoreResult<Vec<(String, String)>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| redb_error("begin_read")(e.into()))?;
        let table = match txn.open_table(RESULTS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(redb_error("open_table")(e.into())),
        };
        let prefix = prefix(job);
        let mut entries = Vec::new();
        for entry in table.iter().map_err(|e| redb_error("iter")(e.into()))? {
            let (k, v) = entry.map_err(|e| redb_error("read entry")(e.into()))?;
            if k.value().starts_with(&prefix) {
                entries.push((k.value().to_string(), v.value().to_string()));
            }
        }
        Ok(entries)
    }

    /// Load every parseable result of a job, oldest first.
    ///
    /// Malformed records are logged and skipped.
    pub fn load<T: DeserializeOwned>(&self, job: &JobId) -> StoreResult<Vec<(u64, T)>> {
        let prefix = prefix(job);
        let mut records = Vec::new();
        for (key, text) in self.entries(job)? {
            let seq = match key[prefix.len()..].parse::<u64>() {
                Ok(seq) => seq,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping archive entry with malformed key");
                    continue;
                }
            };
            match serde_json::from_str::<T>(&text) {
                Ok(record) => records.push((seq, record)),
                Err(e) => tracing::warn!(job = %job, seq, error = %e, "skipping malformed archived result"),
            }
        }
        Ok(records)
    }

    /// Highest sequence number stored for a job.
    pub fn latest_seq(&self, job: &JobId) -> StoreResult<Option<u64>> {
        let prefix = prefix(job);
        Ok(self
            .entries(job)?
            .iter()
            .filter_map(|(k, _)| k[prefix.len()..].parse::<u64>().ok())
            .max())
    }

    /// Keep only the newest `keep` records of a job. Returns how many were removed.
    pub fn prune(&self, job: &JobId, keep: usize) -> StoreResult<usize> {
        let entries = self.entries(job)?;
        if entries.len() <= keep {
            return Ok(0);
        }
        let doomed: Vec<String> = entries
            .into_iter()
            .map(|(k, _)| k)
            .rev()
            .skip(keep)
            .collect();

        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_error("begin_write")(e.into()))?;
        {
            let mut table = txn
                .open_table(RESULTS_TABLE)
                .map_err(|e| redb_error("open_table")(e.into()))?;
            for k in &doomed {
                table
                    .remove(k.as_str())
                    .map_err(|e| redb_error("remove")(e.into()))?;
            }
        }
        txn.commit().map_err(|e| redb_error("commit")(e.into()))?;
        tracing::debug!(job = %job, removed = doomed.len(), keep, "pruned archived results");
        Ok(doomed.len())
    }
}

impl std::fmt::Debug for ResultArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultArchive").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        score: f64,
    }

    #[test]
    fn append_and_load_in_order() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();
        let job = JobId::from("smokers");
        for seq in [2, 10, 1] {
            archive.append(&job, seq, &Record { score: seq as f64 }).unwrap();
        }
        let loaded: Vec<(u64, Record)> = archive.load(&job).unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 10]);
        assert_eq!(archive.latest_seq(&job).unwrap(), Some(10));
    }

    #[test]
    fn jobs_do_not_leak_into_each_other() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();
        archive.append(&JobId::from("a"), 1, &Record { score: 1.0 }).unwrap();
        archive.append(&JobId::from("ab"), 1, &Record { score: 2.0 }).unwrap();
        let a: Vec<(u64, Record)> = archive.load(&JobId::from("a")).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].1, Record { score: 1.0 });
    }

    #[test]
    fn malformed_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();
        let job = JobId::from("j");
        archive.append(&job, 1, &Record { score: 0.5 }).unwrap();
        archive.put_raw(&key(&job, 2), "{not json").unwrap();
        archive.append(&job, 3, &Record { score: 0.7 }).unwrap();

        let loaded: Vec<(u64, Record)> = archive.load(&job).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], (3, Record { score: 0.7 }));
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();
        let job = JobId::from("j");
        for seq in 1..=5 {
            archive.append(&job, seq, &Record { score: 0.0 }).unwrap();
        }
        assert_eq!(archive.prune(&job, 2).unwrap(), 3);
        let loaded: Vec<(u64, Record)> = archive.load(&job).unwrap();
        assert_eq!(loaded.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn empty_archive_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();
        let loaded: Vec<(u64, Record)> = archive.load(&JobId::from("none")).unwrap();
        assert!(loaded.is_empty());
    }
}
