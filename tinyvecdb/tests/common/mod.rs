//! Shared helpers for the end-to-end tests.
#![allow(dead_code)]

use std::path::PathBuf;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

pub const DIMENSIONS: usize = 128;

/// A database in its own temp directory, closed and cleaned up on drop.
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = tinyvecdb::close(&self.path);
    }
}

/// Create and open a fresh database file.
pub fn test_db(dimensions: u32) -> TestDb {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    tinyvecdb::open(&path, dimensions).expect("open");
    TestDb { _dir: dir, path }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_vector(rng: &mut StdRng, dimensions: usize) -> Vec<f32> {
    (0..dimensions).map(|_| rng.gen_range(0.0..1.0)).collect()
}

/// Deterministic patterned vector: `base + i * 0.01` per component.
pub fn create_vector(base: f32) -> Vec<f32> {
    (0..DIMENSIONS).map(|i| base + i as f32 * 0.01).collect()
}
