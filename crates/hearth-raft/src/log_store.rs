//! Raft log storage backed by redb.
//!
//! Vote, committed log id and entries live in the same `cluster.redb`
//! file as the state machine, in their own tables. Entries are stored
//! as JSON keyed by log index.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, StorageError, Vote};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::typ::TypeConfig;
use crate::{read_err, write_err};

/// Log entries: key = log index, value = JSON entry.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");

/// Log metadata: key = name, value = JSON.
const LOG_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_log_meta");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";

/// Raft log storage backed by redb.
pub struct LogStore {
    db: Arc<Database>,
}

/// Read-only log reader handed to replication tasks.
pub struct LogReader {
    db: Arc<Database>,
}

impl LogStore {
    /// Open the log tables in `db`, creating them if absent.
    pub fn open(db: Arc<Database>) -> Result<Self, StorageError<u64>> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(LOG_TABLE).map_err(write_err)?;
        txn.open_table(LOG_META_TABLE).map_err(write_err)?;
        txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(value).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOG_META_TABLE).map_err(write_err)?;
            table.insert(key, data.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)
    }

    fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_META_TABLE).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }
}

/// Delete every entry whose index falls in `range`.
fn remove_range(
    txn: &WriteTransaction,
    range: impl RangeBounds<u64>,
) -> Result<usize, StorageError<u64>> {
    let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
    let keys: Vec<u64> = table
        .range(range)
        .map_err(write_err)?
        .map(|item| item.map(|(k, _)| k.value()))
        .collect::<Result<_, _>>()
        .map_err(write_err)?;
    for key in &keys {
        table.remove(*key).map_err(write_err)?;
    }
    Ok(keys.len())
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_err)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_err)? {
            let (_, val) = item.map_err(read_err)?;
            entries.push(serde_json::from_slice(val.value()).map_err(read_err)?);
        }
        Ok(entries)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let mut reader = LogReader {
            db: Arc::clone(&self.db),
        };
        reader.try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let last_log_id = {
            let txn = self.db.begin_read().map_err(read_err)?;
            let table = txn.open_table(LOG_TABLE).map_err(read_err)?;
            match table.last().map_err(read_err)? {
                Some((_, val)) => {
                    let entry: Entry<TypeConfig> =
                        serde_json::from_slice(val.value()).map_err(read_err)?;
                    Some(entry.log_id)
                }
                None => None,
            }
        };
        let last_purged_log_id: Option<LogId<u64>> = self.read_meta(LAST_PURGED_KEY)?;

        Ok(LogState {
            last_purged_log_id,
            // An empty log after a purge still ends at the purged id.
            last_log_id: last_log_id.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        LogReader {
            db: Arc::clone(&self.db),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        self.write_meta(VOTE_KEY, vote)?;
        debug!(?vote, "saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        self.read_meta(VOTE_KEY)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            for entry in entries {
                let data = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, data.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed = remove_range(&txn, log_id.index..)?;
        txn.commit().map_err(write_err)?;
        debug!(index = log_id.index, removed, "truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(&log_id).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut meta = txn.open_table(LOG_META_TABLE).map_err(write_err)?;
            meta.insert(LAST_PURGED_KEY, data.as_slice())
                .map_err(write_err)?;
        }
        let removed = remove_range(&txn, ..=log_id.index)?;
        txn.commit().map_err(write_err)?;
        debug!(index = log_id.index, removed, "purged log");
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        match committed {
            Some(log_id) => self.write_meta(COMMITTED_KEY, &log_id),
            None => Ok(()),
        }
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        self.read_meta(COMMITTED_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload};
    use redb::backends::InMemoryBackend;

    fn test_db() -> Arc<Database> {
        Arc::new(
            Database::builder()
                .create_with_backend(InMemoryBackend::new())
                .unwrap(),
        )
    }

    fn put_entries(db: &Database, indexes: impl IntoIterator<Item = u64>) {
        // LogFlushed cannot be built outside openraft, so write rows directly.
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(LOG_TABLE).unwrap();
            for index in indexes {
                let entry = Entry::<TypeConfig> {
                    log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
                    payload: EntryPayload::Blank,
                };
                let data = serde_json::to_vec(&entry).unwrap();
                table.insert(index, data.as_slice()).unwrap();
            }
        }
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn empty_log_state() {
        let mut store = LogStore::open(test_db()).unwrap();
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn vote_and_committed_persist() {
        let mut store = LogStore::open(test_db()).unwrap();
        assert!(store.read_vote().await.unwrap().is_none());

        let vote = Vote::new(3, 7);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));

        let committed = LogId::new(CommittedLeaderId::new(3, 7), 12);
        store.save_committed(Some(committed)).await.unwrap();
        assert_eq!(store.read_committed().await.unwrap(), Some(committed));
    }

    #[tokio::test]
    async fn truncate_and_purge_trim_the_log() {
        let db = test_db();
        let mut store = LogStore::open(Arc::clone(&db)).unwrap();
        put_entries(&db, 1..=6);

        store
            .truncate(LogId::new(CommittedLeaderId::new(1, 1), 5))
            .await
            .unwrap();
        let entries = store.try_get_log_entries(0..).await.unwrap();
        assert_eq!(entries.len(), 4);

        let purged = LogId::new(CommittedLeaderId::new(1, 1), 4);
        store.purge(purged).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(purged));
        assert_eq!(state.last_log_id, Some(purged));
        assert!(store.try_get_log_entries(0..).await.unwrap().is_empty());
    }
}
