//! Mutation engine: insert, delete, update
//!
//! Every mutation follows the temp-and-swap protocol: stream the new image
//! into `<path>.temp`, fsync, rename over the original, fsync the
//! directory, then refresh the connection. An error at any step unlinks
//! the temp file and leaves the original byte-for-byte intact. An
//! advisory exclusive lock on the source file guards against a second
//! writing process.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use fs2::FileExt;

use crate::connection::Connection;
use crate::cosine;
use crate::errors::{Result, TinyVecError};
use crate::filter::Filter;
use crate::io::{self, FileHeader, HEADER_SIZE};
use crate::storage::{self, encode_metadata, RecordWriter};
use crate::{DeletionResult, Insertion, UpdateItem, UpdateResult};

use rayon::prelude::*;

/// Append a batch of records, normalizing vectors and assigning ids.
///
/// Vectors whose length differs from the file's dimensions are dropped
/// silently; a dimension-0 file adopts the first record's length, which is
/// committed only by the successful swap. Returns the number of records
/// actually appended.
pub fn insert(conn: &Connection, mut batch: Vec<Insertion>) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    let header = conn.header();
    let dims = if header.dimensions == 0 {
        batch[0].vector.len()
    } else {
        header.dimensions as usize
    };
    if dims == 0 {
        return Ok(0);
    }

    batch.retain(|item| item.vector.len() == dims);
    if batch.is_empty() {
        return Ok(0);
    }

    batch
        .par_iter_mut()
        .for_each(|item| cosine::normalize(&mut item.vector));
    let encoded: Vec<Vec<u8>> = batch
        .iter()
        .map(|item| encode_metadata(&item.metadata))
        .collect::<Result<_>>()?;

    let source = lock_source(conn)?;
    let map = conn.mapped()?;

    // One cheap pass for the id watermark before any bytes move.
    let mut max_id: Option<u32> = None;
    for record in storage::records(&map, header) {
        let record = record?;
        max_id = Some(max_id.map_or(record.id, |m| m.max(record.id)));
    }
    let mut next_id = max_id.map_or(0, |m| m + 1);

    let inserted = batch.len();
    let new_header = FileHeader {
        vector_count: header.vector_count + inserted as u32,
        dimensions: dims as u32,
    };

    commit_image(conn, |out| {
        out.write_all(&new_header.to_bytes())?;
        // The existing region is passed through verbatim.
        out.write_all(&map[HEADER_SIZE..])?;
        let mut writer = RecordWriter::new(out);
        for (item, metadata) in batch.iter().zip(&encoded) {
            writer.write_record(next_id, &item.vector, metadata)?;
            next_id += 1;
        }
        Ok(())
    })?;
    drop(source);

    tracing::debug!(inserted, dimensions = dims, "insert committed");
    Ok(inserted)
}

/// Remove the records whose id appears in `ids`. A miss on every id leaves
/// the file untouched and reports `success = false`.
pub fn delete_by_ids(conn: &Connection, ids: &[u32]) -> Result<DeletionResult> {
    if ids.is_empty() {
        return Ok(DeletionResult {
            deleted_count: 0,
            success: false,
        });
    }
    let doomed: std::collections::HashSet<u32> = ids.iter().copied().collect();
    delete_where(conn, |record| Ok(doomed.contains(&record.id)))
}

/// Remove the records whose metadata matches `filter`.
pub fn delete_by_filter(conn: &Connection, filter: &Filter) -> Result<DeletionResult> {
    delete_where(conn, |record| {
        Ok(filter.matches(&storage::decode_metadata(record.metadata)))
    })
}

fn delete_where(
    conn: &Connection,
    mut predicate: impl FnMut(&storage::RecordView<'_>) -> Result<bool>,
) -> Result<DeletionResult> {
    let header = conn.header();
    if header.vector_count == 0 {
        return Ok(DeletionResult {
            deleted_count: 0,
            success: false,
        });
    }

    let source = lock_source(conn)?;
    let map = conn.mapped()?;

    // Decide first; the rewrite only starts when something actually goes.
    let mut doomed = Vec::with_capacity(header.vector_count as usize);
    let mut deleted = 0u32;
    for record in storage::records(&map, header) {
        let is_doomed = predicate(&record?)?;
        doomed.push(is_doomed);
        if is_doomed {
            deleted += 1;
        }
    }
    if deleted == 0 {
        return Ok(DeletionResult {
            deleted_count: 0,
            success: false,
        });
    }

    let new_header = FileHeader {
        vector_count: header.vector_count - deleted,
        dimensions: header.dimensions,
    };
    commit_image(conn, |out| {
        out.write_all(&new_header.to_bytes())?;
        let mut writer = RecordWriter::new(out);
        for (record, is_doomed) in storage::records(&map, header).zip(doomed.iter().copied()) {
            if !is_doomed {
                writer.copy_record(&record?)?;
            }
        }
        Ok(())
    })?;
    drop(source);

    tracing::debug!(deleted, "delete committed");
    Ok(DeletionResult {
        deleted_count: deleted,
        success: true,
    })
}

struct PreparedUpdate {
    vector: Option<Vec<f32>>,
    metadata: Option<Vec<u8>>,
}

/// Rewrite the vector and/or metadata of existing records in place.
///
/// An item carrying neither field rejects the whole batch before any I/O.
/// Items whose id is absent, or whose replacement vector has the wrong
/// dimension, are skipped; `updated_count` reflects records actually
/// rewritten.
pub fn update_by_id(conn: &Connection, items: Vec<UpdateItem>) -> Result<UpdateResult> {
    for (index, item) in items.iter().enumerate() {
        if item.vector.is_none() && item.metadata.is_none() {
            return Err(TinyVecError::InvalidUpdateItem(index));
        }
    }
    let header = conn.header();
    if items.is_empty() || header.vector_count == 0 {
        return Ok(UpdateResult {
            updated_count: 0,
            success: false,
        });
    }
    let dims = header.dimensions as usize;

    // Duplicate ids collapse to the last occurrence.
    let mut by_id: HashMap<u32, PreparedUpdate> = HashMap::with_capacity(items.len());
    for item in items {
        let vector = match item.vector {
            Some(v) if v.len() == dims => {
                let mut v = v;
                cosine::normalize(&mut v);
                Some(v)
            }
            // Wrong-dimension replacement invalidates the whole item.
            Some(_) => continue,
            None => None,
        };
        let metadata = match &item.metadata {
            Some(value) => Some(encode_metadata(value)?),
            None => None,
        };
        if vector.is_none() && metadata.is_none() {
            continue;
        }
        by_id.insert(item.id, PreparedUpdate { vector, metadata });
    }
    if by_id.is_empty() {
        return Ok(UpdateResult {
            updated_count: 0,
            success: false,
        });
    }

    let source = lock_source(conn)?;
    let map = conn.mapped()?;

    let mut updated = 0u32;
    for record in storage::records(&map, header) {
        if by_id.contains_key(&record?.id) {
            updated += 1;
        }
    }
    if updated == 0 {
        return Ok(UpdateResult {
            updated_count: 0,
            success: false,
        });
    }

    commit_image(conn, |out| {
        out.write_all(&header.to_bytes())?;
        let mut writer = RecordWriter::new(out);
        let mut scratch = vec![0.0f32; dims];
        for record in storage::records(&map, header) {
            let record = record?;
            match by_id.get(&record.id) {
                Some(update) => {
                    let vector: &[f32] = match &update.vector {
                        Some(v) => v,
                        None => {
                            record.read_vector_into(&mut scratch);
                            &scratch
                        }
                    };
                    let metadata: &[u8] = match &update.metadata {
                        Some(m) => m,
                        None => record.metadata,
                    };
                    writer.write_record(record.id, vector, metadata)?;
                }
                None => writer.copy_record(&record)?,
            }
        }
        Ok(())
    })?;
    drop(source);

    tracing::debug!(updated, "update committed");
    Ok(UpdateResult {
        updated_count: updated,
        success: true,
    })
}

fn lock_source(conn: &Connection) -> Result<File> {
    let source = File::open(conn.path())?;
    source.try_lock_exclusive().map_err(|e| {
        TinyVecError::Io(std::io::Error::new(
            e.kind(),
            format!("another process is writing {}: {e}", conn.path().display()),
        ))
    })?;
    Ok(source)
}

/// Run the temp-and-swap protocol around `write_image`.
fn commit_image(
    conn: &Connection,
    write_image: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let temp = io::temp_path(conn.path());
    let guard = io::TempGuard::new(temp.clone());

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp)?;
    let mut out = BufWriter::new(file);
    write_image(&mut out)?;
    out.flush()?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    io::replace_file(&temp, conn.path())?;
    io::sync_parent_dir(conn.path())?;
    guard.disarm();

    conn.refresh()
}
