//! Append-only JSON-lines journal of committed ledger effects.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ids::hex;
use super::types::{Account, Transfer};
use super::LedgerError;

/// One committed effect. Replaying entries in order rebuilds the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Account {
        account: Account,
    },
    Transfer {
        transfer: Transfer,
    },
    /// A pending transfer timed out and released its amount.
    Expired {
        #[serde(with = "hex")]
        id: u128,
    },
    /// The id failed with a transient result and may not be reused.
    Failed {
        #[serde(with = "hex")]
        id: u128,
    },
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (or create) the journal at `path` and return its entries.
    ///
    /// A torn final line from an interrupted write is dropped and truncated.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalEntry>), LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        for line in contents.split_inclusive('\n') {
            let start = offset;
            offset += line.len();
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                good_len = offset;
                continue;
            }
            match serde_json::from_str::<JournalEntry>(trimmed) {
                Ok(entry) => {
                    entries.push(entry);
                    good_len = offset;
                }
                Err(e) if !line.ends_with('\n') => {
                    warn!(path = %path.display(), offset = start, error = %e, "Dropping torn journal tail");
                    break;
                }
                Err(e) => {
                    return Err(LedgerError::Journal(format!(
                        "corrupt entry at byte {} of {}: {}",
                        start,
                        path.display(),
                        e
                    )));
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if good_len < contents.len() {
            file.set_len(good_len as u64)?;
        }
        debug!(path = %path.display(), entries = entries.len(), "Journal opened");
        Ok((Self { path, file }, entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle on an existing journal that rejects every append.
    #[cfg(test)]
    pub(crate) fn read_only(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Write `entries` and sync them to disk.
    pub fn append(&mut self, entries: &[JournalEntry]) -> Result<(), LedgerError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).map_err(|e| LedgerError::Journal(e.to_string()))?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }
}
