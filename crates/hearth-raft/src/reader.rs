//! Replica-local reads of the replicated tables.
//!
//! Reads never go through consensus. Freshness is the caller's concern:
//! `ReplicatedStore` waits for the session's last write to be applied
//! before it reads here.

use std::sync::{Arc, Weak};

use hearth_state::{StateError, StateResult, StoredValue, Table, Versioned};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Cheap cloneable read handle over the local replica.
#[derive(Clone)]
pub struct StateReader {
    db: Arc<Database>,
}

impl StateReader {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Handle that lets a caller observe when the database file closes.
    pub fn downgrade(&self) -> Weak<Database> {
        Arc::downgrade(&self.db)
    }

    pub fn get_row(&self, table: Table, key: &str) -> StateResult<Option<StoredValue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                StoredValue::decode(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    pub fn rows(&self, table: Table) -> StateResult<Vec<(String, StoredValue)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (k, v) = entry.map_err(map_err!(Read))?;
            let row = StoredValue::decode(v.value()).map_err(map_err!(Deserialize))?;
            out.push((k.value().to_string(), row));
        }
        Ok(out)
    }

    /// Typed read of one record.
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<Versioned<T>>> {
        self.get_row(table, key)?.map(decode).transpose()
    }

    /// Typed read of a whole table, in key order.
    pub fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<Versioned<T>>> {
        self.rows(table)?
            .into_iter()
            .map(|(_, row)| decode(row))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(row: StoredValue) -> StateResult<Versioned<T>> {
    let value = serde_json::from_str(&row.data).map_err(map_err!(Deserialize))?;
    Ok(Versioned {
        revision: row.revision,
        value,
    })
}
