//! Persistence of the host index
//!
//! A [`Persister`] saves and loads [`PersistData`], the durable part of the
//! index. [`JsonPersist`] writes a versioned, checksummed JSON file and
//! replaces it atomically; [`MemoryPersist`] keeps snapshots in memory.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::announcement::HostPublicKey;
use crate::chain::ChangeId;

pub const PERSIST_FILENAME: &str = "persist.json";
const HEADER: &str = "shard";
const VERSION: &str = "0.1.0";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no persisted data found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wrong header: expected {expected:?}, found {found:?}")]
    Header { expected: String, found: String },

    #[error("unsupported version {found:?}, expected {expected:?}")]
    Version { expected: String, found: String },

    #[error("checksum mismatch: file says {expected}, data hashes to {actual}")]
    Checksum { expected: String, actual: String },

    #[error("persist file is truncated")]
    Truncated,
}

/// The durable fields of the host index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistData {
    pub height: u64,
    #[serde(with = "crate::b64::blob_map")]
    pub hosts: HashMap<HostPublicKey, Bytes>,
    /// Earlier announcements of each host, oldest first, restored on revert
    #[serde(default, with = "crate::b64::blob_history")]
    pub superseded: HashMap<HostPublicKey, Vec<Bytes>>,
    pub last_change: ChangeId,
}

/// Saves and loads index snapshots
///
/// `load` returns [`PersistError::NotFound`] when nothing was ever saved. A
/// successful `save` must never be observable half-written by `load`.
pub trait Persister: Send + Sync {
    fn save(&self, data: &PersistData) -> Result<(), PersistError>;
    fn load(&self) -> Result<PersistData, PersistError>;
}

/// Stores the index as `persist.json` in a directory
///
/// The file holds four newline-separated sections: the JSON-encoded header,
/// version and BLAKE3 checksum strings, followed by the JSON data itself.
#[derive(Debug, Clone)]
pub struct JsonPersist {
    path: PathBuf,
}

impl JsonPersist {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join(PERSIST_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json_temp")
    }
}

/// The next section, or `Truncated` if the file ends before it has content
fn next_section<'a>(
    sections: &mut impl Iterator<Item = &'a [u8]>,
) -> Result<&'a [u8], PersistError> {
    sections
        .next()
        .filter(|section| !section.is_empty())
        .ok_or(PersistError::Truncated)
}

impl Persister for JsonPersist {
    fn save(&self, data: &PersistData) -> Result<(), PersistError> {
        let body = serde_json::to_vec_pretty(data)?;
        let checksum = blake3::hash(&body).to_hex();

        let mut contents = Vec::with_capacity(body.len() + 128);
        for field in [HEADER, VERSION, checksum.as_str()] {
            serde_json::to_writer(&mut contents, field)?;
            contents.push(b'\n');
        }
        contents.extend_from_slice(&body);

        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(path = ?self.path, bytes = contents.len(), "Wrote host index snapshot");
        Ok(())
    }

    fn load(&self) -> Result<PersistData, PersistError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PersistError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let mut sections = contents.splitn(4, |b| *b == b'\n');
        let header: String = serde_json::from_slice(next_section(&mut sections)?)?;
        if header != HEADER {
            return Err(PersistError::Header {
                expected: HEADER.to_string(),
                found: header,
            });
        }
        let version: String = serde_json::from_slice(next_section(&mut sections)?)?;
        if version != VERSION {
            return Err(PersistError::Version {
                expected: VERSION.to_string(),
                found: version,
            });
        }
        let expected: String = serde_json::from_slice(next_section(&mut sections)?)?;
        let body = next_section(&mut sections)?;
        let actual = blake3::hash(body).to_hex();
        if actual.as_str() != expected {
            return Err(PersistError::Checksum {
                expected,
                actual: actual.to_string(),
            });
        }

        Ok(serde_json::from_slice(body)?)
    }
}

/// Keeps every saved snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryPersist {
    saved: Mutex<Vec<PersistData>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `data`, as if saved by an earlier run
    pub fn with_snapshot(data: PersistData) -> Self {
        Self {
            saved: Mutex::new(vec![data]),
        }
    }

    pub fn saves(&self) -> Vec<PersistData> {
        self.saved.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().len()
    }

    pub fn latest(&self) -> Option<PersistData> {
        self.saved.lock().last().cloned()
    }
}

impl Persister for MemoryPersist {
    fn save(&self, data: &PersistData) -> Result<(), PersistError> {
        self.saved.lock().push(data.clone());
        Ok(())
    }

    fn load(&self) -> Result<PersistData, PersistError> {
        self.latest().ok_or(PersistError::NotFound)
    }
}
