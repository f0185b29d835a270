//! Versioned schema updates and pre-upgrade backup snapshots.
//!
//! A [`Schema`] is an ordered list of update functions; the schema version
//! of a database is the number of updates applied to it. Opening an
//! existing database that is behind first copies the file aside, then
//! runs every pending update plus the version bump in one transaction.
//! A [`PreUpdate`] hook (the local repair patch) runs first in that same
//! transaction, so it can fix data an update would otherwise trip over.

use std::fs;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, TableError, WriteTransaction};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::{CLUSTER_CONFIG, INSTANCES, MEMBERS, META, NODE_CONFIG};
use crate::types::epoch_secs;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Key in the meta table holding the applied schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One schema update step.
pub type Update = fn(&WriteTransaction) -> StateResult<()>;

/// Ordered schema updates for one database.
#[derive(Clone)]
pub struct Schema {
    updates: Vec<Update>,
}

impl Schema {
    pub fn new() -> Self {
        Self {
            updates: Vec::new(),
        }
    }

    /// Schema of the node-local database.
    pub fn local() -> Self {
        Self::new().with_update(create_local_tables)
    }

    /// Schema of the replicated database.
    pub fn cluster() -> Self {
        Self::new().with_update(create_cluster_tables)
    }

    pub fn with_update(mut self, update: Update) -> Self {
        self.updates.push(update);
        self
    }

    /// Target version (number of updates).
    pub fn version(&self) -> u64 {
        self.updates.len() as u64
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

fn create_local_tables(txn: &WriteTransaction) -> StateResult<()> {
    txn.open_table(NODE_CONFIG).map_err(map_err!(Table))?;
    Ok(())
}

fn create_cluster_tables(txn: &WriteTransaction) -> StateResult<()> {
    txn.open_table(INSTANCES).map_err(map_err!(Table))?;
    txn.open_table(MEMBERS).map_err(map_err!(Table))?;
    txn.open_table(CLUSTER_CONFIG).map_err(map_err!(Table))?;
    Ok(())
}

/// Runs inside the update transaction ahead of every pending update.
pub type PreUpdate<'a> = &'a dyn Fn(&WriteTransaction) -> StateResult<()>;

/// Open (or create) the database at `path` and bring it to `schema`.
///
/// Returns the database and, when an upgrade happened, the path of the
/// backup taken before it.
pub fn open_database(path: &Path, schema: &Schema) -> StateResult<(Database, Option<PathBuf>)> {
    open_database_with(path, schema, None)
}

/// Like [`open_database`], committing `pre` atomically with the updates.
///
/// If `pre` or any update fails, nothing is committed.
pub fn open_database_with(
    path: &Path,
    schema: &Schema,
    pre: Option<PreUpdate<'_>>,
) -> StateResult<(Database, Option<PathBuf>)> {
    let db = Database::create(path).map_err(map_err!(Open))?;
    let current = schema_version(&db)?;
    let target = schema.version();

    if current > target {
        return Err(StateError::Schema(format!(
            "{} is at schema version {current}, newer than supported version {target}",
            path.display()
        )));
    }

    let mut backup = None;
    let db = if current > 0 && current < target {
        // The file must be closed while it is copied.
        drop(db);
        backup = Some(backup_file(path, current, target)?);
        Database::create(path).map_err(map_err!(Open))?
    } else {
        db
    };

    apply_updates(&db, schema, current, pre)?;
    debug!(path = %path.display(), version = target, "database opened");
    Ok((db, backup))
}

/// Create an ephemeral database at `schema` (never backed up).
pub fn open_in_memory(schema: &Schema) -> StateResult<Database> {
    let db = Database::builder()
        .create_with_backend(redb::backends::InMemoryBackend::new())
        .map_err(map_err!(Open))?;
    apply_updates(&db, schema, 0, None)?;
    Ok(db)
}

/// Applied schema version, 0 for a fresh database.
pub fn schema_version(db: &Database) -> StateResult<u64> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let table = match txn.open_table(META) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(0),
        Err(e) => return Err(StateError::Table(e.to_string())),
    };
    Ok(table
        .get(SCHEMA_VERSION_KEY)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0))
}

fn apply_updates(
    db: &Database,
    schema: &Schema,
    current: u64,
    pre: Option<PreUpdate<'_>>,
) -> StateResult<()> {
    let target = schema.version();
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    if let Some(pre) = pre {
        if let Err(e) = pre(&txn) {
            let _ = txn.abort();
            return Err(e);
        }
    }
    for (idx, update) in schema.updates.iter().enumerate().skip(current as usize) {
        if let Err(e) = update(&txn) {
            let _ = txn.abort();
            return Err(StateError::Schema(format!("update {} failed: {e}", idx + 1)));
        }
    }
    {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        meta.insert(SCHEMA_VERSION_KEY, target)
            .map_err(map_err!(Write))?;
    }
    txn.commit().map_err(map_err!(Transaction))?;
    if current < target {
        info!(from = current, to = target, "schema updated");
    }
    Ok(())
}

// ── Backups ───────────────────────────────────────────────────────

/// Copy `path` to `<file>.v<from>-v<to>.<unix-secs>.bak` next to it.
///
/// Never overwrites an existing backup; a numeric suffix is appended when
/// two upgrades land in the same second.
pub fn backup_file(path: &Path, from: u64, to: u64) -> StateResult<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StateError::Backup(format!("invalid database path {}", path.display())))?;
    let stem = format!("{file_name}.v{from}-v{to}.{}", epoch_secs());

    let mut dest = path.with_file_name(format!("{stem}.bak"));
    let mut n = 1;
    while dest.exists() {
        dest = path.with_file_name(format!("{stem}-{n}.bak"));
        n += 1;
    }

    fs::copy(path, &dest).map_err(|e| StateError::Backup(format!("{}: {e}", dest.display())))?;
    info!(
        database = %path.display(),
        backup = %dest.display(),
        from,
        to,
        "pre-upgrade backup written"
    );
    Ok(dest)
}

/// Backups taken for the database at `path`, oldest name first.
pub fn list_backups(path: &Path) -> StateResult<Vec<PathBuf>> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{file_name}.v");

    let mut backups = Vec::new();
    for entry in fs::read_dir(&dir).map_err(map_err!(Backup))? {
        let entry = entry.map_err(map_err!(Backup))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(".bak") {
            backups.push(entry.path());
        }
    }
    backups.sort();
    Ok(backups)
}
