//! Conditional mutations applied inside a single redb write transaction.
//!
//! A batch of [`Mutation`]s is all-or-nothing: the first violated
//! expectation or invalid row stops the batch and the caller aborts the
//! surrounding transaction, so no partial effect ever becomes visible.

use std::fmt;

use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tables::Table;
use crate::types::StoredValue;

/// Precondition a row must satisfy for a mutation to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Unconditional.
    #[default]
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist.
    Present,
    /// The key must exist and have been last written at this revision.
    Revision(u64),
}

impl Expect {
    fn holds(self, actual: Option<u64>) -> bool {
        match self {
            Expect::Any => true,
            Expect::Absent => actual.is_none(),
            Expect::Present => actual.is_some(),
            Expect::Revision(rev) => actual == Some(rev),
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Any => f.write_str("any"),
            Expect::Absent => f.write_str("absent"),
            Expect::Present => f.write_str("present"),
            Expect::Revision(rev) => write!(f, "revision {rev}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Write the JSON payload.
    Put(String),
    Delete,
}

/// One conditional write against a record table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: Table,
    pub key: String,
    pub op: MutationOp,
    #[serde(default)]
    pub expect: Expect,
}

impl Mutation {
    /// Unconditional upsert.
    pub fn put(table: Table, key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
            op: MutationOp::Put(data.into()),
            expect: Expect::Any,
        }
    }

    /// Serialize `value` as the row payload.
    pub fn put_json<T: Serialize>(
        table: Table,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, MutationError> {
        let data = serde_json::to_string(value).map_err(|e| MutationError::Storage(e.to_string()))?;
        Ok(Self::put(table, key, data))
    }

    /// Delete of an existing row.
    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
            op: MutationOp::Delete,
            expect: Expect::Present,
        }
    }

    pub fn with_expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }
}

/// Why a mutation batch was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MutationError {
    /// A precondition did not hold; re-read and retry with a fresh revision.
    #[error("conflict on {table}/{key}: expected {expected}, found {}", describe(*actual))]
    Conflict {
        table: Table,
        key: String,
        expected: Expect,
        actual: Option<u64>,
    },

    #[error("invalid row {table}/{key}: {reason}")]
    Invalid {
        table: Table,
        key: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl MutationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MutationError::Conflict { .. })
    }
}

fn describe(actual: Option<u64>) -> String {
    match actual {
        Some(rev) => format!("revision {rev}"),
        None => "no row".to_string(),
    }
}

macro_rules! storage_err {
    () => {
        |e| MutationError::Storage(e.to_string())
    };
}

/// Apply `mutations` in order inside `txn`, stamping written rows with
/// `revision`.
///
/// On error the transaction holds partial writes and must be aborted by
/// the caller.
pub fn apply_mutations(
    txn: &WriteTransaction,
    mutations: &[Mutation],
    revision: u64,
) -> Result<(), MutationError> {
    for m in mutations {
        let mut table = txn.open_table(m.table.definition()).map_err(storage_err!())?;

        let actual = match table.get(m.key.as_str()).map_err(storage_err!())? {
            Some(guard) => Some(StoredValue::decode(guard.value()).map_err(storage_err!())?.revision),
            None => None,
        };

        if !m.expect.holds(actual) {
            return Err(MutationError::Conflict {
                table: m.table,
                key: m.key.clone(),
                expected: m.expect,
                actual,
            });
        }

        match &m.op {
            MutationOp::Put(data) => {
                m.table
                    .validate(&m.key, data)
                    .map_err(|reason| MutationError::Invalid {
                        table: m.table,
                        key: m.key.clone(),
                        reason,
                    })?;
                let row = StoredValue {
                    revision,
                    data: data.clone(),
                }
                .encode()
                .map_err(storage_err!())?;
                table
                    .insert(m.key.as_str(), row.as_slice())
                    .map_err(storage_err!())?;
            }
            MutationOp::Delete => {
                table.remove(m.key.as_str()).map_err(storage_err!())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::{Database, ReadableDatabase};

    fn db() -> Database {
        Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .unwrap()
    }

    fn commit(db: &Database, mutations: &[Mutation], revision: u64) -> Result<(), MutationError> {
        let txn = db.begin_write().unwrap();
        match apply_mutations(&txn, mutations, revision) {
            Ok(()) => {
                txn.commit().unwrap();
                Ok(())
            }
            Err(e) => {
                txn.abort().unwrap();
                Err(e)
            }
        }
    }

    fn revision_of(db: &Database, key: &str) -> Option<u64> {
        let txn = db.begin_read().unwrap();
        let table = match txn.open_table(Table::ClusterConfig.definition()) {
            Ok(t) => t,
            Err(_) => return None,
        };
        table
            .get(key)
            .unwrap()
            .map(|g| StoredValue::decode(g.value()).unwrap().revision)
    }

    #[test]
    fn expectations_gate_writes() {
        let db = db();
        let put = Mutation::put(Table::ClusterConfig, "k", "v1");

        commit(&db, &[put.clone().with_expect(Expect::Absent)], 1).unwrap();
        assert_eq!(revision_of(&db, "k"), Some(1));

        let err = commit(&db, &[put.clone().with_expect(Expect::Absent)], 2).unwrap_err();
        assert!(err.is_conflict());

        let err = commit(&db, &[put.clone().with_expect(Expect::Revision(7))], 2).unwrap_err();
        assert_eq!(
            err,
            MutationError::Conflict {
                table: Table::ClusterConfig,
                key: "k".into(),
                expected: Expect::Revision(7),
                actual: Some(1),
            }
        );

        commit(&db, &[put.with_expect(Expect::Revision(1))], 2).unwrap();
        assert_eq!(revision_of(&db, "k"), Some(2));
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let db = db();
        let batch = [
            Mutation::put(Table::ClusterConfig, "a", "1"),
            Mutation::delete(Table::ClusterConfig, "missing"),
        ];
        assert!(commit(&db, &batch, 1).is_err());
        assert_eq!(revision_of(&db, "a"), None);
    }

    #[test]
    fn invalid_instance_row_is_rejected() {
        let db = db();
        let err = commit(&db, &[Mutation::put(Table::Instances, "default/web", "{}")], 1).unwrap_err();
        assert!(matches!(err, MutationError::Invalid { .. }));
    }
}
