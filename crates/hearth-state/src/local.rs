//! LocalStore — node-local configuration that is never replicated.
//!
//! Holds this node's identity, its advertised address, join tokens and
//! cache paths. Only the owning daemon ever opens the file.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::mutation::{Expect, Mutation, MutationError, apply_mutations};
use crate::patch::{Patch, PatchError, PatchOutcome};
use crate::schema::{self, Schema};
use crate::tables::{META, Scope, Table};
use crate::types::{NodeIdentity, StoredValue};

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Address the node serves its API on.
pub const KEY_HTTPS_ADDRESS: &str = "core.https_address";
/// Token presented when joining an existing cluster.
pub const KEY_JOIN_TOKEN: &str = "cluster.join_token";
/// Local image cache directory.
pub const KEY_IMAGES_CACHE_PATH: &str = "images.cache_path";
pub const KEY_NODE_NAME: &str = "node.name";
pub const KEY_NODE_RAFT_ID: &str = "node.raft_id";

const REVISION_KEY: &str = "revision";

/// Thread-safe handle to the node-local database.
#[derive(Clone, Debug)]
pub struct LocalStore {
    db: Arc<Database>,
    backup: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the local store, upgrading its schema if needed.
    pub fn open(path: &Path) -> StateResult<Self> {
        let (db, backup) = schema::open_database(path, &Schema::local())?;
        debug!(?path, "local store opened");
        Ok(Self {
            db: Arc::new(db),
            backup,
        })
    }

    /// Open the local store with a repair patch committed ahead of any
    /// pending schema update, in the same transaction.
    ///
    /// A patch that fails leaves the database untouched.
    pub fn open_with_patch(path: &Path, patch: &Patch) -> Result<(Self, PatchOutcome), PatchError> {
        Self::check_patch_target(patch)?;
        let mutations = patch.mutations();
        for m in &mutations {
            Self::check_scope(m.table, &m.key).map_err(StateError::from)?;
        }

        let replayed = Cell::new(false);
        let repair = |txn: &WriteTransaction| -> StateResult<()> {
            match commit_in(txn, &mutations) {
                Ok(_) => Ok(()),
                Err(StateError::Mutation(e)) => match patch.classify_failure(e.clone()) {
                    Ok(_) => {
                        replayed.set(true);
                        Ok(())
                    }
                    Err(_) => Err(StateError::Mutation(e)),
                },
                Err(e) => Err(e),
            }
        };

        let (db, backup) = match schema::open_database_with(path, &Schema::local(), Some(&repair)) {
            Ok(opened) => opened,
            Err(StateError::Mutation(source)) => {
                return Err(PatchError::Failed {
                    path: patch.path.clone(),
                    source,
                });
            }
            Err(e) => return Err(e.into()),
        };
        debug!(?path, "local store opened");

        let outcome = if replayed.get() {
            PatchOutcome::AlreadyApplied
        } else {
            PatchOutcome::Applied {
                statements: patch.statements.len(),
            }
        };
        let store = Self {
            db: Arc::new(db),
            backup,
        };
        Ok((store, outcome))
    }

    /// Create an ephemeral in-memory local store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let db = schema::open_in_memory(&Schema::local())?;
        Ok(Self {
            db: Arc::new(db),
            backup: None,
        })
    }

    /// Backup taken when this open upgraded the schema.
    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    // ── Config ─────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> StateResult<Option<String>> {
        Ok(self.get_row(Table::NodeConfig, key)?.map(|row| row.data))
    }

    /// Set a config key. Returns the revision of the write.
    pub fn set_config(&self, key: &str, value: &str) -> StateResult<u64> {
        self.commit(&[Mutation::put(Table::NodeConfig, key, value)])
    }

    /// Remove a config key. Returns true if it existed.
    pub fn unset_config(&self, key: &str) -> StateResult<bool> {
        let existed = self.get_row(Table::NodeConfig, key)?.is_some();
        if existed {
            self.commit(&[Mutation::delete(Table::NodeConfig, key).with_expect(Expect::Any)])?;
        }
        Ok(existed)
    }

    /// All config keys and values.
    pub fn config(&self) -> StateResult<BTreeMap<String, String>> {
        Ok(self
            .rows(Table::NodeConfig)?
            .into_iter()
            .map(|(k, row)| (k, row.data))
            .collect())
    }

    pub fn identity(&self) -> StateResult<Option<NodeIdentity>> {
        let Some(name) = self.get_config(KEY_NODE_NAME)? else {
            return Ok(None);
        };
        let Some(raft_id) = self.get_config(KEY_NODE_RAFT_ID)? else {
            return Ok(None);
        };
        let raft_id = raft_id
            .parse()
            .map_err(|e| StateError::Deserialize(format!("{KEY_NODE_RAFT_ID}: {e}")))?;
        Ok(Some(NodeIdentity { name, raft_id }))
    }

    pub fn set_identity(&self, identity: &NodeIdentity) -> StateResult<u64> {
        self.commit(&[
            Mutation::put(Table::NodeConfig, KEY_NODE_NAME, identity.name.as_str()),
            Mutation::put(Table::NodeConfig, KEY_NODE_RAFT_ID, identity.raft_id.to_string()),
        ])
    }

    // ── Raw rows ───────────────────────────────────────────────────

    /// Read one row with its revision.
    pub fn get_row(&self, table: Table, key: &str) -> StateResult<Option<StoredValue>> {
        Self::check_scope(table, key).map_err(StateError::Mutation)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                StoredValue::decode(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Every row of a local table, in key order.
    pub fn rows(&self, table: Table) -> StateResult<BTreeMap<String, StoredValue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        let mut out = BTreeMap::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (k, v) = entry.map_err(map_err!(Read))?;
            let row = StoredValue::decode(v.value()).map_err(map_err!(Deserialize))?;
            out.insert(k.value().to_string(), row);
        }
        Ok(out)
    }

    /// Last committed local revision.
    pub fn revision(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    /// Apply a batch of conditional mutations atomically.
    ///
    /// Every mutation must target a local table. Returns the new revision.
    pub fn commit(&self, mutations: &[Mutation]) -> StateResult<u64> {
        for m in mutations {
            Self::check_scope(m.table, &m.key)?;
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revision = match commit_in(&txn, mutations) {
            Ok(revision) => revision,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(revision, count = mutations.len(), "local mutations committed");
        Ok(revision)
    }

    /// Apply a local repair patch in one transaction.
    pub fn apply_patch(&self, patch: &Patch) -> Result<PatchOutcome, PatchError> {
        Self::check_patch_target(patch)?;
        match self.commit(&patch.mutations()) {
            Ok(_) => Ok(PatchOutcome::Applied {
                statements: patch.statements.len(),
            }),
            Err(StateError::Mutation(e)) => patch.classify_failure(e),
            Err(e) => Err(e.into()),
        }
    }

    fn check_patch_target(patch: &Patch) -> Result<(), PatchError> {
        if patch.target.scope() == Scope::Local {
            return Ok(());
        }
        Err(PatchError::WrongTarget {
            path: patch.path.clone(),
            target: patch.target,
        })
    }

    fn check_scope(table: Table, key: &str) -> Result<(), MutationError> {
        if table.scope() == Scope::Local {
            return Ok(());
        }
        Err(MutationError::Invalid {
            table,
            key: key.to_string(),
            reason: "table is replicated, not local".to_string(),
        })
    }
}

/// Apply `mutations` inside `txn` under the next local revision.
fn commit_in(txn: &WriteTransaction, mutations: &[Mutation]) -> StateResult<u64> {
    let revision = {
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        meta.get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0)
            + 1
    };
    apply_mutations(txn, mutations, revision)?;
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
    Ok(revision)
}
