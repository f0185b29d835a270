//! Operator-supplied repair patches.
//!
//! A patch is a text file dropped under `<data_dir>/database/` before the
//! daemon starts: `patch.local` targets the local store and `patch.global`
//! the replicated store. Each non-blank, non-`#` line is one statement:
//!
//! ```text
//! put    <table> <key> <value...>
//! insert <table> <key> <value...>
//! update <table> <key> <value...>
//! delete <table> <key>
//! ```
//!
//! All statements of a patch commit in one transaction together with a
//! marker row keyed by the patch digest, so a patch that committed but
//! whose file survived a crash is recognised and not replayed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::StateError;
use crate::local::LocalStore;
use crate::mutation::{Expect, Mutation, MutationError};
use crate::tables::{Scope, Table};

/// Which store a patch file targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTarget {
    Local,
    Global,
}

impl PatchTarget {
    pub fn file_name(self) -> &'static str {
        match self {
            PatchTarget::Local => "patch.local",
            PatchTarget::Global => "patch.global",
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            PatchTarget::Local => Scope::Local,
            PatchTarget::Global => Scope::Replicated,
        }
    }
}

impl std::fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchTarget::Local => f.write_str("local"),
            PatchTarget::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{} is a {target} patch and cannot be applied here", path.display())]
    WrongTarget { path: PathBuf, target: PatchTarget },

    #[error("patch {} failed and was rolled back: {source}", path.display())]
    Failed {
        path: PathBuf,
        #[source]
        source: MutationError,
    },

    #[error("patch {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("patch could not be committed: {0}")]
    Commit(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Result of running the loader for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PatchOutcome {
    /// No patch file was present.
    Absent,
    Applied { statements: usize },
    /// The marker row shows this exact patch already committed.
    AlreadyApplied,
}

/// One parsed statement and the line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub line: usize,
    pub mutation: Mutation,
}

/// A parsed repair patch.
#[derive(Debug, Clone)]
pub struct Patch {
    pub target: PatchTarget,
    pub path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub digest: String,
    pub statements: Vec<Statement>,
}

impl Patch {
    pub fn parse(target: PatchTarget, path: &Path, text: &str) -> Result<Self, PatchError> {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let mut statements = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parse_err = |reason: String| PatchError::Parse {
                path: path.to_path_buf(),
                line,
                reason,
            };

            let mut rest = trimmed;
            let verb = next_token(&mut rest);
            let table: Table = next_token(&mut rest)
                .ok_or_else(|| parse_err("missing table".into()))?
                .parse()
                .map_err(parse_err)?;
            let key = next_token(&mut rest)
                .ok_or_else(|| parse_err("missing key".into()))?
                .to_string();
            let value = rest.trim();

            if table.scope() != target.scope() {
                return Err(parse_err(format!(
                    "table {table} cannot be patched from a {target} patch"
                )));
            }

            let needs_value = |expect: Expect| {
                if value.is_empty() {
                    Err(parse_err("missing value".into()))
                } else {
                    Ok(Mutation::put(table, key.clone(), value).with_expect(expect))
                }
            };

            let mutation = match verb {
                Some("put") => needs_value(Expect::Any)?,
                Some("insert") => needs_value(Expect::Absent)?,
                Some("update") => needs_value(Expect::Present)?,
                Some("delete") if value.is_empty() => Mutation::delete(table, key.clone()),
                Some("delete") => return Err(parse_err("delete takes no value".into())),
                Some(other) => return Err(parse_err(format!("unknown statement {other:?}"))),
                None => return Err(parse_err("empty statement".into())),
            };
            statements.push(Statement { line, mutation });
        }

        Ok(Self {
            target,
            path: path.to_path_buf(),
            digest,
            statements,
        })
    }

    /// Config key of the marker row recording this patch.
    pub fn marker_key(&self) -> String {
        format!("patch.applied.{}", self.digest)
    }

    /// Marker row followed by every statement, in file order.
    pub fn mutations(&self) -> Vec<Mutation> {
        let marker = Mutation::put(
            Table::config_for(self.target.scope()),
            self.marker_key(),
            self.path.display().to_string(),
        )
        .with_expect(Expect::Absent);

        std::iter::once(marker)
            .chain(self.statements.iter().map(|s| s.mutation.clone()))
            .collect()
    }

    /// Map a rejected commit to an outcome: a conflict on the marker row
    /// means the patch already committed earlier.
    pub fn classify_failure(&self, err: MutationError) -> Result<PatchOutcome, PatchError> {
        let replay = matches!(&err, MutationError::Conflict { key, .. } if *key == self.marker_key());
        if replay {
            return Ok(PatchOutcome::AlreadyApplied);
        }
        Err(PatchError::Failed {
            path: self.path.clone(),
            source: err,
        })
    }
}

fn next_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();
    if s.is_empty() {
        *rest = s;
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    let (token, tail) = s.split_at(end);
    *rest = tail;
    Some(token)
}

// ── Loader ────────────────────────────────────────────────────────

/// Finds, applies and retires patch files under `<data_dir>/database/`.
#[derive(Debug, Clone)]
pub struct PatchLoader {
    dir: PathBuf,
}

impl PatchLoader {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("database"),
        }
    }

    pub fn path(&self, target: PatchTarget) -> PathBuf {
        self.dir.join(target.file_name())
    }

    /// Read and parse the patch for `target`, if one is present.
    pub fn load(&self, target: PatchTarget) -> Result<Option<Patch>, PatchError> {
        let path = self.path(target);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PatchError::Io { path, source }),
        };
        let patch = Patch::parse(target, &path, &text)?;
        info!(
            path = %path.display(),
            statements = patch.statements.len(),
            digest = %patch.digest,
            "repair patch found"
        );
        Ok(Some(patch))
    }

    /// Delete the patch file once its outcome is final.
    pub fn complete(&self, patch: &Patch, outcome: &PatchOutcome) -> Result<(), PatchError> {
        match outcome {
            PatchOutcome::Applied { statements } => {
                info!(path = %patch.path.display(), statements, "repair patch applied");
            }
            PatchOutcome::AlreadyApplied => {
                warn!(path = %patch.path.display(), "repair patch was already applied, removing file");
            }
            PatchOutcome::Absent => return Ok(()),
        }
        fs::remove_file(&patch.path).map_err(|source| PatchError::Io {
            path: patch.path.clone(),
            source,
        })
    }

    /// Open the local store at `db_path`, running the local patch before
    /// any schema update touches it.
    pub fn open_local(&self, db_path: &Path) -> Result<(LocalStore, PatchOutcome), PatchError> {
        let Some(patch) = self.load(PatchTarget::Local)? else {
            return Ok((LocalStore::open(db_path)?, PatchOutcome::Absent));
        };
        let (store, outcome) = LocalStore::open_with_patch(db_path, &patch)?;
        self.complete(&patch, &outcome)?;
        Ok((store, outcome))
    }

    /// Run the local patch against an already open `store`.
    pub fn apply_local(&self, store: &LocalStore) -> Result<PatchOutcome, PatchError> {
        let Some(patch) = self.load(PatchTarget::Local)? else {
            return Ok(PatchOutcome::Absent);
        };
        let outcome = store.apply_patch(&patch)?;
        self.complete(&patch, &outcome)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationOp;

    fn parse(target: PatchTarget, text: &str) -> Result<Patch, PatchError> {
        Patch::parse(target, Path::new("/tmp/patch"), text)
    }

    #[test]
    fn parses_statements_and_skips_comments() {
        let patch = parse(
            PatchTarget::Global,
            "# fix a broken migration\n\
             \n\
             put cluster_config images.auto_update_interval 6\n\
             update instances default/web {\"project\":\"default\",\"name\":\"web\",\"node\":\"n1\",\"power_state\":\"stopped\"}\n\
             delete members ghost\n",
        )
        .unwrap();

        assert_eq!(patch.statements.len(), 3);
        assert_eq!(patch.statements[0].line, 3);
        assert_eq!(patch.statements[1].mutation.expect, Expect::Present);
        assert_eq!(patch.statements[2].mutation.op, MutationOp::Delete);
        assert_eq!(patch.digest.len(), 64);
    }

    #[test]
    fn value_keeps_inner_spaces() {
        let patch = parse(PatchTarget::Local, "put node_config motd  hello  world ").unwrap();
        assert_eq!(
            patch.statements[0].mutation.op,
            MutationOp::Put("hello  world".into())
        );
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse(PatchTarget::Local, "put node_config a 1\nfrobnicate node_config b").unwrap_err();
        assert!(matches!(err, PatchError::Parse { line: 2, .. }));

        let err = parse(PatchTarget::Local, "insert node_config a").unwrap_err();
        assert!(matches!(err, PatchError::Parse { line: 1, .. }));

        let err = parse(PatchTarget::Local, "delete node_config a extra").unwrap_err();
        assert!(matches!(err, PatchError::Parse { line: 1, .. }));
    }

    #[test]
    fn scope_must_match_target() {
        assert!(parse(PatchTarget::Local, "put instances default/web {}").is_err());
        assert!(parse(PatchTarget::Global, "put node_config a 1").is_err());
    }

    #[test]
    fn marker_row_leads_the_batch() {
        let patch = parse(PatchTarget::Local, "put node_config a 1").unwrap();
        let muts = patch.mutations();
        assert_eq!(muts.len(), 2);
        assert_eq!(muts[0].table, Table::NodeConfig);
        assert_eq!(muts[0].key, patch.marker_key());
        assert_eq!(muts[0].expect, Expect::Absent);
    }

    #[test]
    fn loader_applies_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PatchLoader::new(dir.path());
        let store = LocalStore::open_in_memory().unwrap();

        assert_eq!(loader.apply_local(&store).unwrap(), PatchOutcome::Absent);

        fs::create_dir_all(dir.path().join("database")).unwrap();
        fs::write(loader.path(PatchTarget::Local), "put node_config core.https_address 10.0.0.9:8443\n").unwrap();

        let outcome = loader.apply_local(&store).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied { statements: 1 });
        assert!(!loader.path(PatchTarget::Local).exists());
        assert_eq!(
            store.get_config("core.https_address").unwrap().as_deref(),
            Some("10.0.0.9:8443")
        );
    }

    #[test]
    fn replayed_patch_is_not_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PatchLoader::new(dir.path());
        let store = LocalStore::open_in_memory().unwrap();
        fs::create_dir_all(dir.path().join("database")).unwrap();

        let text = "insert node_config once 1\n";
        fs::write(loader.path(PatchTarget::Local), text).unwrap();
        loader.apply_local(&store).unwrap();

        // Same file reappears, as if deletion had been lost in a crash.
        fs::write(loader.path(PatchTarget::Local), text).unwrap();
        assert_eq!(loader.apply_local(&store).unwrap(), PatchOutcome::AlreadyApplied);
        assert!(!loader.path(PatchTarget::Local).exists());
    }
}
