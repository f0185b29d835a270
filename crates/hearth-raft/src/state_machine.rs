//! Raft state machine backed by redb.
//!
//! Applies committed entries to the replicated record tables defined in
//! `hearth-state`. Each entry is applied in exactly one redb transaction
//! together with the `last_applied` marker, so a crash never leaves an
//! entry half-applied. A batch whose preconditions fail is aborted and
//! only `last_applied` advances.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use hearth_state::{StoredValue, Table, apply_mutations};
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::typ::{Response, TypeConfig};
use crate::{read_err, write_err};

/// State machine metadata: key = name, value = JSON.
const SM_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_sm_meta");

const APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";

/// Serialized snapshot body: table name → key → row.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotData {
    tables: BTreeMap<String, BTreeMap<String, StoredValue>>,
}

/// Raft state machine backed by redb.
pub struct StateMachine {
    db: Arc<Database>,
}

/// Snapshot builder that reads current state machine contents.
pub struct SmSnapshotBuilder {
    db: Arc<Database>,
}

impl StateMachine {
    /// Open the state machine over a database already at the cluster schema.
    pub fn open(db: Arc<Database>) -> Result<Self, StorageError<u64>> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(SM_META_TABLE).map_err(write_err)?;
        for table in Table::REPLICATED {
            txn.open_table(table.definition()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    fn read_meta<T: for<'de> Deserialize<'de>>(
        db: &Database,
        key: &str,
    ) -> Result<Option<T>, StorageError<u64>> {
        let txn = db.begin_read().map_err(read_err)?;
        let table = txn.open_table(SM_META_TABLE).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    fn get_applied(&self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        Self::read_meta(&self.db, APPLIED_KEY)
    }

    fn get_membership(&self) -> Result<StoredMembership<u64, BasicNode>, StorageError<u64>> {
        Ok(Self::read_meta(&self.db, MEMBERSHIP_KEY)?.unwrap_or_default())
    }

    /// Apply one entry: its effect and the applied marker commit together.
    fn apply_entry(&self, entry: Entry<TypeConfig>) -> Result<Response, StorageError<u64>> {
        let log_id = entry.log_id;
        let txn = self.db.begin_write().map_err(write_err)?;

        let response = match entry.payload {
            EntryPayload::Blank => Response::committed(),
            EntryPayload::Normal(req) => {
                match apply_mutations(&txn, req.mutations(), log_id.index) {
                    Ok(()) => Response::committed(),
                    Err(e) => {
                        txn.abort().map_err(write_err)?;
                        debug!(index = log_id.index, error = %e, "entry rejected");
                        let txn = self.db.begin_write().map_err(write_err)?;
                        put_meta(&txn, APPLIED_KEY, &log_id)?;
                        txn.commit().map_err(write_err)?;
                        return Ok(Response::rejected(e));
                    }
                }
            }
            EntryPayload::Membership(membership) => {
                let stored = StoredMembership::new(Some(log_id), membership);
                put_meta(&txn, MEMBERSHIP_KEY, &stored)?;
                Response::committed()
            }
        };

        put_meta(&txn, APPLIED_KEY, &log_id)?;
        txn.commit().map_err(write_err)?;
        Ok(response)
    }
}

fn put_meta<T: Serialize>(
    txn: &WriteTransaction,
    key: &str,
    value: &T,
) -> Result<(), StorageError<u64>> {
    let data = serde_json::to_vec(value).map_err(write_err)?;
    let mut table = txn.open_table(SM_META_TABLE).map_err(write_err)?;
    table.insert(key, data.as_slice()).map_err(write_err)?;
    Ok(())
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        Ok((self.get_applied()?, self.get_membership()?))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            responses.push(self.apply_entry(entry)?);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SmSnapshotBuilder {
            db: Arc::clone(&self.db),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data: SnapshotData =
            serde_json::from_slice(&snapshot.into_inner()).map_err(read_err)?;

        let txn = self.db.begin_write().map_err(write_err)?;
        for table in Table::REPLICATED {
            let mut t = txn.open_table(table.definition()).map_err(write_err)?;
            let keys: Vec<String> = t
                .iter()
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(write_err)?;
            for key in &keys {
                t.remove(key.as_str()).map_err(write_err)?;
            }

            let Some(rows) = data.tables.get(table.as_str()) else {
                continue;
            };
            for (key, row) in rows {
                let bytes = row.encode().map_err(write_err)?;
                t.insert(key.as_str(), bytes.as_slice()).map_err(write_err)?;
            }
        }
        for name in data.tables.keys() {
            if name.parse::<Table>().is_err() {
                warn!(table = %name, "snapshot carries unknown table, ignored");
            }
        }
        put_meta(&txn, APPLIED_KEY, &meta.last_log_id)?;
        put_meta(&txn, MEMBERSHIP_KEY, &meta.last_membership)?;
        txn.commit().map_err(write_err)?;

        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if self.get_applied()?.is_none() {
            return Ok(None);
        }
        let mut builder = self.get_snapshot_builder().await;
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let mut data = SnapshotData::default();
        let (last_applied, membership) = {
            // One read transaction gives a consistent cut.
            let txn = self.db.begin_read().map_err(read_err)?;
            for table in Table::REPLICATED {
                let t = txn.open_table(table.definition()).map_err(read_err)?;
                let rows = data.tables.entry(table.as_str().to_string()).or_default();
                for item in t.iter().map_err(read_err)? {
                    let (k, v) = item.map_err(read_err)?;
                    let row = StoredValue::decode(v.value()).map_err(read_err)?;
                    rows.insert(k.value().to_string(), row);
                }
            }

            let meta = txn.open_table(SM_META_TABLE).map_err(read_err)?;
            let last_applied: Option<LogId<u64>> = match meta.get(APPLIED_KEY).map_err(read_err)? {
                Some(val) => serde_json::from_slice(val.value()).map_err(read_err)?,
                None => None,
            };
            let membership: StoredMembership<u64, BasicNode> =
                match meta.get(MEMBERSHIP_KEY).map_err(read_err)? {
                    Some(val) => serde_json::from_slice(val.value()).map_err(read_err)?,
                    None => StoredMembership::default(),
                };
            (last_applied, membership)
        };

        let bytes = serde_json::to_vec(&data).map_err(read_err)?;
        let snapshot_id = format!("snap-{}", last_applied.map_or(0, |l| l.index));
        debug!(%snapshot_id, size = bytes.len(), "snapshot built");

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership: membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}
