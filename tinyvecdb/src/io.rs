//! Low-level file primitives: header codec, temp-and-swap, fsync discipline
//!
//! The on-disk byte order is little-endian regardless of host; the header
//! codec swaps explicitly so big-endian targets read the same files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Result, TinyVecError};

/// Bytes occupied by the file header: `vector_count: u32, dimensions: u32`.
pub const HEADER_SIZE: usize = 8;

/// Sanity cap used when validating headers and open requests.
pub const MAX_DIMENSIONS: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub vector_count: u32,
    pub dimensions: u32,
}

impl FileHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.vector_count.to_le_bytes());
        buf[4..].copy_from_slice(&self.dimensions.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; HEADER_SIZE]) -> Self {
        Self {
            vector_count: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            dimensions: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Read the header from the start of a reader positioned at offset 0.
pub fn read_header(source: &mut impl Read) -> Result<FileHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    source.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            TinyVecError::HeaderCorrupt("file shorter than header".to_string())
        }
        _ => TinyVecError::Io(e),
    })?;
    Ok(FileHeader::from_bytes(buf))
}

/// Create a fresh database file with an empty record region.
///
/// Fails with `AlreadyExists` rather than overwriting; callers racing on
/// the same path fall back to reading the existing header.
pub fn create_db_file(path: &Path, dimensions: u32) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let header = FileHeader {
        vector_count: 0,
        dimensions,
    };
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;
    sync_parent_dir(path)?;
    Ok(())
}

/// Sibling temp path used by the swap protocol: `<path>.temp`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".temp");
    PathBuf::from(os)
}

/// Unlink a stray `<path>.temp` left behind by a crashed writer.
pub fn remove_stale_temp(path: &Path) {
    let temp = temp_path(path);
    if temp.exists() {
        tracing::warn!(temp = %temp.display(), "removing stale temp file from aborted write");
        let _ = fs::remove_file(&temp);
    }
}

/// Unlinks a temp file on drop unless the swap was committed.
pub struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The swap committed; the temp path no longer holds the new image.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Atomically move `temp` over `target`.
///
/// `rename` may fail on Windows while the target is held open; fall back to
/// copy + delete, matching the rename's best-effort contract there.
pub fn replace_file(temp: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(temp, target) {
        Ok(()) => Ok(()),
        Err(rename_err) => match fs::copy(temp, target) {
            Ok(_) => {
                let _ = fs::remove_file(temp);
                Ok(())
            }
            Err(copy_err) => Err(io::Error::new(
                rename_err.kind(),
                format!("rename failed: {rename_err}, copy fallback failed: {copy_err}"),
            )),
        },
    }
}

/// Durably commit a rename by fsyncing the containing directory.
#[cfg(unix)]
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
