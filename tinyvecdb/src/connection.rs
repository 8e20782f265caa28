//! Process-wide connection registry
//!
//! One `Connection` per absolute path, shared by every caller in the
//! process. The registry mutex is held only around map lookups; file work
//! happens outside it. Connections cache the parsed header and a read-only
//! mmap of the file image; both are dropped on `refresh` after a mutation
//! swaps the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::errors::{Result, TinyVecError};
use crate::io::{self, FileHeader, HEADER_SIZE, MAX_DIMENSIONS};
use crate::IndexStats;

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<Connection>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// In-memory handle to one open database file.
pub struct Connection {
    path: PathBuf,
    state: RwLock<ConnectionState>,
}

struct ConnectionState {
    header: FileHeader,
    map: Option<Arc<Mmap>>,
}

impl Connection {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> FileHeader {
        self.state.read().header
    }

    pub fn dimensions(&self) -> u32 {
        self.header().dimensions
    }

    pub fn stats(&self) -> IndexStats {
        let header = self.header();
        IndexStats {
            vector_count: header.vector_count,
            dimensions: header.dimensions,
        }
    }

    /// Map the current file image, reusing the cached mapping.
    pub(crate) fn mapped(&self) -> Result<Arc<Mmap>> {
        if let Some(map) = self.state.read().map.clone() {
            return Ok(map);
        }
        let mut state = self.state.write();
        if let Some(map) = state.map.clone() {
            return Ok(map);
        }
        let file = File::open(&self.path)?;
        // Safety: the engine owns writes to this file and every mutation
        // goes through temp-and-swap, so the mapped image is never written
        // in place.
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        state.map = Some(Arc::clone(&map));
        Ok(map)
    }

    /// Re-read the header and drop cached mappings after a swap.
    pub fn refresh(&self) -> Result<()> {
        let header = read_validated_header(&self.path)?;
        let mut state = self.state.write();
        state.header = header;
        state.map = None;
        Ok(())
    }
}

/// Open (creating if absent) the database at `path`.
///
/// The dimension request only applies to file creation; an existing file
/// keeps its committed dimensions no matter what is asked for.
pub fn open(path: &Path, dimensions: u32) -> Result<Arc<Connection>> {
    let abs = absolute(path)?;
    if let Some(existing) = REGISTRY.lock().get(&abs).cloned() {
        return Ok(existing);
    }

    io::remove_stale_temp(&abs);

    if !abs.exists() {
        if dimensions > MAX_DIMENSIONS {
            return Err(TinyVecError::HeaderCorrupt(format!(
                "requested dimensions {dimensions} exceed the cap of {MAX_DIMENSIONS}"
            )));
        }
        match io::create_db_file(&abs, dimensions) {
            Ok(()) => {
                tracing::info!(path = %abs.display(), dimensions, "created database file");
            }
            // Lost a creation race; the existing header wins below.
            Err(TinyVecError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    insert_connection(abs)
}

/// Resolve the connection for an already-existing file, registering it on
/// first use.
pub fn resolve(path: &Path) -> Result<Arc<Connection>> {
    let abs = absolute(path)?;
    if let Some(existing) = REGISTRY.lock().get(&abs).cloned() {
        return Ok(existing);
    }
    insert_connection(abs)
}

fn insert_connection(abs: PathBuf) -> Result<Arc<Connection>> {
    let header = read_validated_header(&abs)?;
    let conn = Arc::new(Connection {
        path: abs.clone(),
        state: RwLock::new(ConnectionState { header, map: None }),
    });
    let mut registry = REGISTRY.lock();
    Ok(Arc::clone(registry.entry(abs).or_insert(conn)))
}

/// Drop the registry entry for `path`; a no-op when absent.
pub fn close(path: &Path) -> Result<()> {
    let abs = absolute(path)?;
    REGISTRY.lock().remove(&abs);
    Ok(())
}

/// Re-read header and caches for `path`, registering the file if needed.
pub fn refresh(path: &Path) -> Result<()> {
    resolve(path)?.refresh()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn read_validated_header(path: &Path) -> Result<FileHeader> {
    let mut file = File::open(path)?;
    let header = io::read_header(&mut file)?;

    if header.dimensions > MAX_DIMENSIONS {
        return Err(TinyVecError::HeaderCorrupt(format!(
            "implausible dimensions {}",
            header.dimensions
        )));
    }
    if header.dimensions == 0 && header.vector_count > 0 {
        return Err(TinyVecError::HeaderCorrupt(
            "dimensions are 0 but the file claims records".to_string(),
        ));
    }

    // Every record occupies at least its fixed fields plus the vector, so
    // an oversized count cannot fit in the file's byte length.
    let file_len = file.metadata()?.len();
    let min_record = 8 + 4 * header.dimensions as u64;
    let min_region = header.vector_count as u64 * min_record;
    if file_len < HEADER_SIZE as u64 + min_region {
        return Err(TinyVecError::HeaderCorrupt(format!(
            "file length {file_len} cannot hold {} records",
            header.vector_count
        )));
    }

    Ok(header)
}
