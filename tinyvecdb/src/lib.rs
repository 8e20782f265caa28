//! TinyVecDB - Embedded single-file vector database
//!
//! An embedded k-nearest-neighbor engine for fixed-dimension f32 vectors
//! with JSON metadata:
//! - SIMD-dispatched cosine similarity over pre-normalized vectors
//! - Memory-mapped scans feeding a bounded top-k heap
//! - A Mongo-style filter language evaluated against stored metadata
//! - Crash-safe mutations via temp-and-swap with fsync discipline
//!
//! Every operation is keyed by file path; a process-wide registry shares
//! one connection per path. The engine is synchronous and expects callers
//! to serialize operations on a single file (it is thread-safe across
//! different files).

mod connection;
mod cosine;
mod errors;
mod filter;
mod io;
mod mutation;
mod search;
mod storage;
mod topk;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use connection::Connection;
pub use errors::{Result, TinyVecError};
pub use filter::Filter;

/// Header-derived view of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub vector_count: u32,
    pub dimensions: u32,
}

/// One record to append: the raw (un-normalized) vector plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insertion {
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// One search hit, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: u32,
    pub similarity: f32,
    pub metadata: Value,
}

/// One record of a paginated scan, in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedRecord {
    pub id: u32,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// A partial rewrite of one record. At least one of `vector` and
/// `metadata` must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItem {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionResult {
    pub deleted_count: u32,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub updated_count: u32,
    pub success: bool,
}

/// Open (creating if absent) the database at `path` and register its
/// connection.
///
/// `dimensions` only applies when the file is created; an existing file
/// keeps its committed dimensions. Pass 0 to defer the dimension to the
/// first successful insert.
pub fn open(path: impl AsRef<Path>, dimensions: u32) -> Result<Arc<Connection>> {
    connection::open(path.as_ref(), dimensions)
}

/// Drop the registry entry for `path`. Safe to call on paths that were
/// never opened.
pub fn close(path: impl AsRef<Path>) -> Result<()> {
    connection::close(path.as_ref())
}

/// Re-read the header and invalidate cached file images, picking up a
/// swap committed by this or another connection holder.
pub fn refresh(path: impl AsRef<Path>) -> Result<()> {
    connection::refresh(path.as_ref())
}

/// Vector count and dimensions straight from the header.
pub fn index_stats(path: impl AsRef<Path>) -> Result<IndexStats> {
    Ok(connection::resolve(path.as_ref())?.stats())
}

/// Top-k nearest records to `query` by cosine similarity.
pub fn search(path: impl AsRef<Path>, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
    let conn = connection::resolve(path.as_ref())?;
    search::search(&conn, query, k, None)
}

/// Top-k restricted to records whose metadata matches `filter_json`.
pub fn search_with_filter(
    path: impl AsRef<Path>,
    query: &[f32],
    k: usize,
    filter_json: &str,
) -> Result<Vec<SearchResult>> {
    let filter = Filter::parse(filter_json)?;
    let conn = connection::resolve(path.as_ref())?;
    search::search(&conn, query, k, Some(&filter))
}

/// Append a batch of records; see [`Insertion`]. Returns the number
/// actually inserted after dimension screening.
pub fn insert(path: impl AsRef<Path>, batch: Vec<Insertion>) -> Result<usize> {
    let conn = connection::resolve(path.as_ref())?;
    mutation::insert(&conn, batch)
}

/// Delete records by id. `success` is false when nothing matched.
pub fn delete_by_ids(path: impl AsRef<Path>, ids: &[u32]) -> Result<DeletionResult> {
    let conn = connection::resolve(path.as_ref())?;
    mutation::delete_by_ids(&conn, ids)
}

/// Delete every record whose metadata matches `filter_json`.
pub fn delete_by_filter(path: impl AsRef<Path>, filter_json: &str) -> Result<DeletionResult> {
    let filter = Filter::parse(filter_json)?;
    let conn = connection::resolve(path.as_ref())?;
    mutation::delete_by_filter(&conn, &filter)
}

/// Rewrite vectors and/or metadata of existing records; see [`UpdateItem`].
pub fn update_by_id(path: impl AsRef<Path>, items: Vec<UpdateItem>) -> Result<UpdateResult> {
    let conn = connection::resolve(path.as_ref())?;
    mutation::update_by_id(&conn, items)
}

/// Records in insertion order, skipping `skip` and returning at most
/// `limit`.
pub fn get_paginated(
    path: impl AsRef<Path>,
    skip: usize,
    limit: usize,
) -> Result<Vec<PaginatedRecord>> {
    let conn = connection::resolve(path.as_ref())?;
    search::get_paginated(&conn, skip, limit)
}
