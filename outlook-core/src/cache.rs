//! Durable token cache.
//!
//! This module provides disk-backed storage for [`CredentialState`] records
//! keyed by [`IdentityId`], using JSON serialization and the platform-specific
//! data directory.
//!
//! # Storage Location
//!
//! The cache lives at `~/.local/share/outlook-mcp/token_cache.json` on Linux,
//! `~/Library/Application Support/com.outlook-mcp.outlook-mcp/token_cache.json`
//! on macOS and `%APPDATA%\outlook-mcp\outlook-mcp\data\token_cache.json` on Windows.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "identities": {
//!     "delegated": {
//!       "access_token": "...",
//!       "refresh_token": "...",
//!       "expires_at": "2030-01-01T00:00:00Z",
//!       "scopes": ["https://graph.microsoft.com/Mail.Read"],
//!       "flow_kind": "delegated"
//!     }
//!   }
//! }
//! ```
//!
//! Unknown fields, at the top level or inside an entry, are preserved when the
//! file is rewritten. Every write replaces the whole file through a temporary
//! file in the same directory followed by an atomic rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::IdentityId;
use crate::token::CredentialState;

/// Current cache file format version.
const CACHE_VERSION: u32 = 1;

/// File name of the cache inside the data directory.
const CACHE_FILE_NAME: &str = "token_cache.json";

/// Error type for token cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error reading or writing the cache file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data directory not available.
    #[error("data directory not available")]
    DataDirUnavailable,

    /// The file was written by an incompatible version.
    #[error("unsupported token cache version {found}")]
    UnsupportedVersion { found: u32 },
}

/// On-disk representation of the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    /// Format version (for future migrations).
    version: u32,

    /// One record per identity.
    #[serde(default)]
    identities: BTreeMap<IdentityId, CredentialState>,

    /// Top-level fields this version does not know about.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            identities: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// Disk-backed token cache.
///
/// Reads happen once in [`TokenCache::load_from_path`]; every mutation is
/// written through to disk before it returns.
///
/// # Thread Safety
///
/// The document is guarded by a `parking_lot::Mutex` that is held for the
/// duration of a write, so concurrent writers for different identities are
/// serialized and never interleave partial files.
#[derive(Debug)]
pub struct TokenCache {
    /// Path to the cache JSON file.
    path: PathBuf,

    /// In-memory copy of the last successfully written document.
    document: Mutex<CacheDocument>,
}

impl TokenCache {
    /// Get the default storage path for the token cache.
    pub fn default_path() -> Result<PathBuf, CacheError> {
        let dirs = directories::ProjectDirs::from("com", "outlook-mcp", "outlook-mcp")
            .ok_or(CacheError::DataDirUnavailable)?;

        Ok(dirs.data_dir().join(CACHE_FILE_NAME))
    }

    /// Load the token cache from the default location.
    pub fn load() -> Result<Self, CacheError> {
        let path = Self::default_path()?;
        Self::load_from_path(path)
    }

    /// Load the token cache from a specific path.
    ///
    /// A missing file yields an empty cache; the file is created on first write.
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();

        let document = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            let document: CacheDocument = serde_json::from_str(&contents)?;
            if document.version > CACHE_VERSION {
                return Err(CacheError::UnsupportedVersion {
                    found: document.version,
                });
            }
            document
        } else {
            CacheDocument::default()
        };

        tracing::debug!(
            "Loaded token cache from {:?} ({} identities)",
            path,
            document.identities.len()
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    /// All cached identities and their states.
    pub fn entries(&self) -> Vec<(IdentityId, CredentialState)> {
        self.document
            .lock()
            .identities
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    /// Get the cached state for an identity.
    pub fn get(&self, identity: &IdentityId) -> Option<CredentialState> {
        self.document.lock().identities.get(identity).cloned()
    }

    /// Store the state for an identity and write the file.
    ///
    /// Unknown fields of a previous record for the same identity are carried
    /// over unless the new state sets them itself. On error the in-memory copy
    /// is left as it was before the call.
    pub fn put(&self, identity: &IdentityId, state: &CredentialState) -> Result<(), CacheError> {
        let mut document = self.document.lock();

        let mut record = state.clone();
        if let Some(previous) = document.identities.get(identity) {
            for (key, value) in &previous.extra {
                record
                    .extra
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let mut updated = document.clone();
        updated.identities.insert(identity.clone(), record);
        write_atomic(&self.path, &updated)?;
        *document = updated;

        tracing::debug!("Persisted credential for {} to token cache", identity);
        Ok(())
    }

    /// Remove an identity and write the file.
    ///
    /// Returns `false` if the identity was not cached.
    pub fn remove(&self, identity: &IdentityId) -> Result<bool, CacheError> {
        let mut document = self.document.lock();
        if !document.identities.contains_key(identity) {
            return Ok(false);
        }

        let mut updated = document.clone();
        updated.identities.remove(identity);
        write_atomic(&self.path, &updated)?;
        *document = updated;

        tracing::debug!("Removed {} from token cache", identity);
        Ok(true)
    }

    /// Get the storage path for this cache.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replace `path` with the serialized document via temp file + rename.
fn write_atomic(path: &Path, document: &CacheDocument) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(io_err)?;

    let contents = serde_json::to_vec_pretty(document)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| CACHE_FILE_NAME.to_string());
    let suffix: u64 = rand::thread_rng().r#gen();
    let tmp_path = dir.join(format!(".{file_name}.{suffix:016x}.tmp"));

    let result = (|| {
        let mut file = open_private(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(source));
    }

    Ok(())
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}
