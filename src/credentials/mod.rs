//! Credential Store
//!
//! Durable per-session authentication material. Each session owns a
//! directory of files written by the protocol layer; the gateway treats
//! the contents as opaque bytes.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Full set of stored files for a session (file name -> contents)
pub type CredentialBlob = BTreeMap<String, Vec<u8>>;

/// Incremental change: `Some` writes a file, `None` removes it
pub type CredentialUpdate = BTreeMap<String, Option<Vec<u8>>>;

/// Credential store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid credential file name: {0}")]
    InvalidFileName(String),

    #[error("Credential IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Keyed blob store for session credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Make sure storage for `id` exists
    async fn prepare(&self, id: &str) -> StoreResult<()>;

    /// Load everything stored for `id` (empty if nothing is stored)
    async fn load(&self, id: &str) -> StoreResult<CredentialBlob>;

    /// Apply an incremental update
    async fn save(&self, id: &str, update: &CredentialUpdate) -> StoreResult<()>;

    /// Delete all material for `id`; absent is not an error
    async fn purge(&self, id: &str) -> StoreResult<()>;

    /// Ids that currently have stored material
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Directory-per-session store: `<root>/<id>/<file>`
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a session's files
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn file_path(&self, id: &str, name: &str) -> StoreResult<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name.contains("..")
        {
            return Err(StoreError::InvalidFileName(name.to_string()));
        }
        Ok(self.session_dir(id).join(name))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn prepare(&self, id: &str) -> StoreResult<()> {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))
    }

    async fn load(&self, id: &str) -> StoreResult<CredentialBlob> {
        let dir = self.session_dir(id);
        let mut blob = CredentialBlob::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(blob),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Leftovers from an interrupted write
            if name.ends_with(".tmp") {
                continue;
            }
            if !entry.file_type().await.map_err(io_err(&path))?.is_file() {
                continue;
            }
            let contents = fs::read(&path).await.map_err(io_err(&path))?;
            blob.insert(name.to_string(), contents);
        }

        debug!("Loaded {} credential files for {}", blob.len(), id);
        Ok(blob)
    }

    async fn save(&self, id: &str, update: &CredentialUpdate) -> StoreResult<()> {
        self.prepare(id).await?;

        for (name, contents) in update {
            let path = self.file_path(id, name)?;
            match contents {
                Some(bytes) => {
                    let tmp = path.with_file_name(format!("{}.tmp", name));
                    fs::write(&tmp, bytes).await.map_err(io_err(&tmp))?;
                    fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
                }
                None => match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path)(e)),
                },
            }
        }

        debug!("Saved {} credential changes for {}", update.len(), id);
        Ok(())
    }

    async fn purge(&self, id: &str) -> StoreResult<()> {
        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Purged credentials for {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            let path = entry.path();
            if !entry.file_type().await.map_err(io_err(&path))?.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}
