//! Query engine: top-k scans and pagination
//!
//! Searches stream the record region out of the mapped file image in
//! batches, score each batch in parallel, and keep survivors in a bounded
//! heap. Metadata is decoded lazily: during the scan only when a filter
//! needs it, and for the final top-k afterwards via the recorded spans.

use crate::connection::Connection;
use crate::cosine;
use crate::errors::{Result, TinyVecError};
use crate::filter::Filter;
use crate::storage::{self, decode_metadata};
use crate::topk::{Hit, TopK};
use crate::{PaginatedRecord, SearchResult};

/// Records scored per parallel batch.
const SCAN_BATCH: usize = 512;

pub fn search(
    conn: &Connection,
    query: &[f32],
    k: usize,
    filter: Option<&Filter>,
) -> Result<Vec<SearchResult>> {
    let header = conn.header();
    let dims = header.dimensions as usize;
    if query.len() != dims {
        return Err(TinyVecError::DimensionMismatch {
            expected: dims,
            got: query.len(),
        });
    }
    if header.vector_count == 0 || k == 0 {
        return Ok(Vec::new());
    }

    let mut normalized = query.to_vec();
    cosine::normalize(&mut normalized);

    let map = conn.mapped()?;
    let mut heap = TopK::new(k);

    let mut flat: Vec<f32> = Vec::with_capacity(SCAN_BATCH * dims);
    let mut pending: Vec<(u32, (usize, usize))> = Vec::with_capacity(SCAN_BATCH);

    for record in storage::records(&map, header) {
        let record = record?;
        if let Some(filter) = filter {
            if !filter.matches(&decode_metadata(record.metadata)) {
                continue;
            }
        }

        let start = flat.len();
        flat.resize(start + dims, 0.0);
        record.read_vector_into(&mut flat[start..]);
        pending.push((record.id, record.metadata_span));

        if pending.len() == SCAN_BATCH {
            score_batch(&normalized, &flat, dims, &pending, &mut heap);
            flat.clear();
            pending.clear();
        }
    }
    if !pending.is_empty() {
        score_batch(&normalized, &flat, dims, &pending, &mut heap);
    }

    let results = heap
        .into_descending()
        .into_iter()
        .map(|hit| SearchResult {
            id: hit.id,
            similarity: hit.similarity,
            metadata: decode_metadata(&map[hit.metadata_span.0..hit.metadata_span.1]),
        })
        .collect();
    Ok(results)
}

fn score_batch(
    query: &[f32],
    flat: &[f32],
    dims: usize,
    pending: &[(u32, (usize, usize))],
    heap: &mut TopK,
) {
    let similarities = cosine::batch_dot(query, flat, dims);
    for ((id, metadata_span), similarity) in pending.iter().zip(similarities) {
        // NaN or infinite scores rank below everything and are never kept.
        if !similarity.is_finite() {
            continue;
        }
        heap.offer(Hit {
            similarity,
            id: *id,
            metadata_span: *metadata_span,
        });
    }
}

/// Records in insertion order, `skip` records in, at most `limit` out.
pub fn get_paginated(conn: &Connection, skip: usize, limit: usize) -> Result<Vec<PaginatedRecord>> {
    let header = conn.header();
    if header.vector_count == 0 || limit == 0 {
        return Ok(Vec::new());
    }

    let map = conn.mapped()?;
    let mut out = Vec::with_capacity(limit.min(header.vector_count as usize));
    for record in storage::records(&map, header).skip(skip) {
        let record = record?;
        out.push(PaginatedRecord {
            id: record.id,
            vector: record.vector().into_owned(),
            metadata: decode_metadata(record.metadata),
        });
        if out.len() == limit {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileHeader;
    use crate::storage::{encode_metadata, RecordWriter};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    fn write_db(path: &std::path::Path, dims: u32, rows: &[(u32, Vec<f32>, serde_json::Value)]) {
        let mut image = FileHeader {
            vector_count: rows.len() as u32,
            dimensions: dims,
        }
        .to_bytes()
        .to_vec();
        let mut writer = RecordWriter::new(&mut image);
        for (id, vector, metadata) in rows {
            let mut v = vector.clone();
            cosine::normalize(&mut v);
            let encoded = encode_metadata(metadata).expect("encode");
            writer.write_record(*id, &v, &encoded).expect("write");
        }
        let mut file = std::fs::File::create(path).expect("create");
        file.write_all(&image).expect("write");
    }

    fn connect(path: &std::path::Path) -> Arc<Connection> {
        crate::connection::resolve(path).expect("resolve")
    }

    #[test]
    fn exact_match_scores_near_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exact.db");
        write_db(
            &path,
            4,
            &[
                (0, vec![1.0, 0.0, 0.0, 0.0], json!({"n": 0})),
                (1, vec![0.0, 1.0, 0.0, 0.0], json!({"n": 1})),
            ],
        );
        let conn = connect(&path);
        let results = search(&conn, &[1.0, 0.0, 0.0, 0.0], 1, None).expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 0);
        assert!((results[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(results[0].metadata, json!({"n": 0}));
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dims.db");
        write_db(&path, 4, &[(0, vec![1.0, 0.0, 0.0, 0.0], json!(null))]);
        let conn = connect(&path);
        assert!(matches!(
            search(&conn, &[1.0, 0.0], 1, None),
            Err(TinyVecError::DimensionMismatch { expected: 4, got: 2 })
        ));
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn results_are_descending_with_id_tiebreak() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("order.db");
        write_db(
            &path,
            2,
            &[
                (0, vec![0.0, 1.0], json!(null)),
                (1, vec![1.0, 0.0], json!(null)),
                (2, vec![1.0, 0.0], json!(null)),
                (3, vec![1.0, 1.0], json!(null)),
            ],
        );
        let conn = connect(&path);
        let results = search(&conn, &[1.0, 0.0], 10, None).expect("search");
        let ids: Vec<u32> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 0]);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn more_records_than_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.db");
        let rows: Vec<(u32, Vec<f32>, serde_json::Value)> = (0..(SCAN_BATCH as u32 + 37))
            .map(|i| {
                let angle = i as f32 * 0.001;
                (i, vec![angle.cos(), angle.sin()], json!({"i": i}))
            })
            .collect();
        write_db(&path, 2, &rows);
        let conn = connect(&path);
        let results = search(&conn, &[1.0, 0.0], 3, None).expect("search");
        // Smallest angles sit closest to the query.
        assert_eq!(
            results.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn nan_vectors_are_never_selected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nan.db");
        let mut image = FileHeader {
            vector_count: 2,
            dimensions: 2,
        }
        .to_bytes()
        .to_vec();
        let mut writer = RecordWriter::new(&mut image);
        writer
            .write_record(0, &[f32::NAN, f32::NAN], b"null")
            .expect("write");
        writer.write_record(1, &[1.0, 0.0], b"null").expect("write");
        std::fs::write(&path, &image).expect("write file");

        let conn = connect(&path);
        let results = search(&conn, &[1.0, 0.0], 10, None).expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn filtered_search_skips_scoring_non_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("filtered.db");
        write_db(
            &path,
            2,
            &[
                (0, vec![1.0, 0.0], json!({"category": "even"})),
                (1, vec![1.0, 0.1], json!({"category": "odd"})),
                (2, vec![1.0, 0.2], json!({"category": "even"})),
            ],
        );
        let conn = connect(&path);
        let filter = Filter::parse(r#"{"category": {"$eq": "even"}}"#).expect("filter");
        let results = search(&conn, &[1.0, 0.0], 10, Some(&filter)).expect("search");
        assert_eq!(
            results.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![0, 2]
        );
        crate::connection::close(&path).expect("close");
    }

    #[test]
    fn pagination_slices_in_insertion_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pages.db");
        let rows: Vec<(u32, Vec<f32>, serde_json::Value)> = (0..10u32)
            .map(|i| (i, vec![1.0, i as f32], json!({"i": i})))
            .collect();
        write_db(&path, 2, &rows);
        let conn = connect(&path);

        let page = get_paginated(&conn, 3, 3).expect("page");
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(page[0].vector.len(), 2);

        assert!(get_paginated(&conn, 99, 5).expect("past end").is_empty());
        assert!(get_paginated(&conn, 0, 0).expect("zero limit").is_empty());
        assert_eq!(get_paginated(&conn, 8, 10).expect("tail").len(), 2);
        crate::connection::close(&path).expect("close");
    }
}
