//! Virtual file system abstraction used by the module loader.
//!
//! The loader never touches `std::fs` directly: it resolves URIs through a
//! [`Vfs`] so embedders can sandbox module resolution or serve sources
//! from memory. [`LocalFs`] is the on-disk backend; [`MemFs`] backs tests
//! and embedded scenarios.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use percent_encoding::percent_decode_str;

use crate::errors::{Error, RunResult};

/// Metadata the loader needs to pick between a source and its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: SystemTime,
    pub size: u64,
}

/// Splits `scheme:rest` off a URI. Single letters are not schemes, so
/// plain paths (including drive-letter paths) pass through whole.
#[must_use]
pub fn split_scheme(uri: &str) -> (Option<&str>, &str) {
    if let Some(pos) = uri.find(':') {
        let scheme = &uri[..pos];
        if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphabetic()) {
            return (Some(scheme), &uri[pos + 1..]);
        }
    }
    (None, uri)
}

/// Extracts a decoded filesystem path from a URI, dropping the scheme and
/// resolving percent escapes.
#[must_use]
pub fn uri_path(uri: &str) -> Cow<'_, str> {
    let (_, rest) = split_scheme(uri);
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    percent_decode_str(rest).decode_utf8_lossy()
}

pub trait Vfs: Send + Sync {
    /// True when the backing store is local; the loader only writes
    /// precompiled caches next to remote sources when told to.
    fn is_local(&self) -> bool;

    fn open(&self, uri: &str) -> RunResult<Box<dyn Read + Send>>;

    fn stat(&self, uri: &str) -> Option<FileStat>;

    /// Writes the full contents of `uri`, atomically with respect to
    /// readers: a failed write never leaves a partial file behind.
    fn write_atomic(&self, uri: &str, bytes: &[u8]) -> RunResult<()>;
}

/// The on-disk backend. Atomic writes go through a temporary file in the
/// target directory followed by a rename.
#[derive(Debug, Default)]
pub struct LocalFs;

impl Vfs for LocalFs {
    fn is_local(&self) -> bool {
        true
    }

    fn open(&self, uri: &str) -> RunResult<Box<dyn Read + Send>> {
        let path = uri_path(uri);
        let file = fs::File::open(path.as_ref())
            .map_err(|e| Error::io(format!("cannot open '{uri}': {e}")))?;
        Ok(Box::new(file))
    }

    fn stat(&self, uri: &str) -> Option<FileStat> {
        let path = uri_path(uri);
        let meta = fs::metadata(path.as_ref()).ok()?;
        let mtime = meta.modified().ok()?;
        Some(FileStat {
            mtime,
            size: meta.len(),
        })
    }

    fn write_atomic(&self, uri: &str, bytes: &[u8]) -> RunResult<()> {
        let path = uri_path(uri);
        let path = Path::new(path.as_ref());
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io(format!("cannot stage '{uri}': {e}")))?;
        tmp.write_all(bytes)
            .map_err(|e| Error::io(format!("cannot write '{uri}': {e}")))?;
        tmp.persist(path)
            .map_err(|e| Error::io(format!("cannot commit '{uri}': {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemEntry {
    bytes: Vec<u8>,
    mtime: SystemTime,
}

/// In-memory backend keyed by URI.
#[derive(Debug, Default)]
pub struct MemFs {
    entries: Mutex<HashMap<String, MemEntry>>,
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        MemFs::default()
    }

    pub fn put(&self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.put_with_mtime(uri, bytes, SystemTime::now());
    }

    /// Inserts an entry with an explicit timestamp so callers can stage
    /// newer-source / older-cache layouts.
    pub fn put_with_mtime(
        &self,
        uri: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        mtime: SystemTime,
    ) {
        self.entries.lock().unwrap().insert(
            uri.into(),
            MemEntry {
                bytes: bytes.into(),
                mtime,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.lock().unwrap().contains_key(uri)
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(uri).map(|e| e.bytes.clone())
    }
}

impl Vfs for MemFs {
    fn is_local(&self) -> bool {
        true
    }

    fn open(&self, uri: &str) -> RunResult<Box<dyn Read + Send>> {
        let bytes = self
            .get(uri)
            .ok_or_else(|| Error::io(format!("cannot open '{uri}': not found")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn stat(&self, uri: &str) -> Option<FileStat> {
        let entries = self.entries.lock().unwrap();
        let e = entries.get(uri)?;
        Some(FileStat {
            mtime: e.mtime,
            size: e.bytes.len() as u64,
        })
    }

    fn write_atomic(&self, uri: &str, bytes: &[u8]) -> RunResult<()> {
        self.put(uri, bytes.to_vec());
        Ok(())
    }
}
