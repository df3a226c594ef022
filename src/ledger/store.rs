//! File primitives for the ledger: optional reads, atomic replace, journal
//! appends.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{LedgerEntry, LedgerError};

/// Reads `path`, returning `None` if it does not exist.
pub(super) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, LedgerError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LedgerError::io(path, e)),
    }
}

/// Replaces `path` atomically: write `<path>.tmp`, sync, rename.
pub(super) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    let temp_path = temp_path_for(path);

    let mut file = File::create(&temp_path)
        .await
        .map_err(|e| LedgerError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| LedgerError::io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| LedgerError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| LedgerError::io(path, e))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Append-only JSON-lines journal.
#[derive(Debug)]
pub(super) struct Journal {
    path: PathBuf,
    file: Option<File>,
}

impl Journal {
    pub(super) fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    async fn file(&mut self) -> Result<&mut File, LedgerError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| LedgerError::io(&self.path, e))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| LedgerError::io(&self.path, std::io::Error::other("journal not open")))
    }

    /// Appends one entry. With `sync`, the line is on disk when this returns.
    pub(super) async fn append(&mut self, entry: &LedgerEntry, sync: bool) -> Result<(), LedgerError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| LedgerError::encode(&self.path, e))?;
        line.push(b'\n');

        let path = self.path.clone();
        let file = self.file().await?;
        file.write_all(&line)
            .await
            .map_err(|e| LedgerError::io(&path, e))?;
        file.flush().await.map_err(|e| LedgerError::io(&path, e))?;
        if sync {
            file.sync_data()
                .await
                .map_err(|e| LedgerError::io(&path, e))?;
        }
        Ok(())
    }

    /// Empties the journal after a snapshot made its contents redundant.
    pub(super) async fn truncate(&mut self) -> Result<(), LedgerError> {
        if let Some(mut open) = self.file.take() {
            open.flush()
                .await
                .map_err(|e| LedgerError::io(&self.path, e))?;
        }
        let file = File::create(&self.path)
            .await
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| LedgerError::io(&self.path, e))?;
        Ok(())
    }
}
