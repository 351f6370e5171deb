use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to access history ledger {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse history ledger {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to serialize history ledger: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("history ledger path not configured")]
    MissingStore,
    #[error("history ledger opened read-only")]
    ReadOnly,
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Default, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    handled: Vec<String>,
}

#[derive(Serialize)]
struct LedgerFileRef<'a> {
    handled: &'a [String],
}

#[derive(Debug, Clone)]
pub struct HistoryStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for HistoryStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl HistoryStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn open(self) -> HistoryResult<HistoryStore> {
        let path = self.path.ok_or(HistoryError::MissingStore)?;
        let existed = path.exists();
        let ids = match fs::read_to_string(&path) {
            Ok(content) => {
                let ledger: LedgerFile =
                    serde_json::from_str(&content).map_err(|source| HistoryError::Parse {
                        source,
                        path: path.clone(),
                    })?;
                ledger.handled
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(HistoryError::Io { source, path }),
        };

        let mut index = HashSet::with_capacity(ids.len());
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            if index.insert(id.clone()) {
                ordered.push(id);
            }
        }

        let store = HistoryStore {
            path,
            read_only: self.read_only,
            ids: ordered,
            index,
        };
        // Writing the empty ledger up front makes an unwritable location a
        // startup failure instead of a surprise after the first publish.
        if !existed && !store.read_only && self.create_if_missing {
            store.flush()?;
        }
        Ok(store)
    }
}

/// Append-only ledger of item ids that must never be processed again.
///
/// Every mutation is flushed synchronously via write-to-temp-then-rename, so
/// concurrent readers always see a complete document and a crash after N
/// items leaves exactly the first N recorded. The file is plain JSON and may
/// be hand-edited while the process is stopped; removing an id forces the
/// item to be reprocessed on the next poll.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    read_only: bool,
    ids: Vec<String>,
    index: HashSet<String>,
}

impl HistoryStore {
    pub fn builder() -> HistoryStoreBuilder {
        HistoryStoreBuilder::new()
    }

    pub fn open(path: impl AsRef<Path>) -> HistoryResult<Self> {
        HistoryStoreBuilder::new().path(path).open()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_handled(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Records `id` as terminally handled, durable before returning.
    pub fn mark_handled(&mut self, id: &str) -> HistoryResult<()> {
        if self.read_only {
            return Err(HistoryError::ReadOnly);
        }
        if self.index.contains(id) {
            return Ok(());
        }
        self.ids.push(id.to_string());
        if let Err(err) = self.flush() {
            self.ids.pop();
            return Err(err);
        }
        self.index.insert(id.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Handled ids in the order they were recorded, newest last.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    fn flush(&self) -> HistoryResult<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
            source,
            path: parent.to_path_buf(),
        })?;

        let body = serde_json::to_vec_pretty(&LedgerFileRef { handled: &self.ids })?;
        let mut temp = NamedTempFile::new_in(parent).map_err(|source| HistoryError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
        temp.write_all(&body).map_err(|source| HistoryError::Io {
            source,
            path: self.path.clone(),
        })?;
        temp.write_all(b"\n").map_err(|source| HistoryError::Io {
            source,
            path: self.path.clone(),
        })?;
        temp.as_file()
            .sync_all()
            .map_err(|source| HistoryError::Io {
                source,
                path: self.path.clone(),
            })?;
        temp.persist(&self.path)
            .map_err(|err| HistoryError::Io {
                source: err.error,
                path: self.path.clone(),
            })?;
        Ok(())
    }
}
