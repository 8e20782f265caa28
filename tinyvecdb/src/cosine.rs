//! SIMD-dispatched dot-product kernel
//!
//! Stored vectors are L2-normalized at write time, so cosine similarity
//! reduces to a plain dot product. The widest available implementation is
//! probed once and cached as a function pointer: AVX2+FMA, then AVX, then
//! NEON, then scalar. Lengths not divisible by the lane width fall through
//! to the scalar tail.

use once_cell::sync::Lazy;
use rayon::prelude::*;

/// Guard added to norms before division during normalization.
pub const NORM_EPSILON: f32 = 1e-12;

type DotFn = fn(&[f32], &[f32]) -> f32;

static KERNEL: Lazy<DotFn> = Lazy::new(select_kernel);

/// Dot product of two equal-length vectors using the selected kernel.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (*KERNEL)(a, b)
}

/// Scale `v` to unit length in place.
///
/// A zero vector stays (near) zero rather than producing NaNs; NaN or Inf
/// components propagate and the query engine drops the non-finite scores.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    let inv = 1.0 / (norm + NORM_EPSILON);
    for x in v.iter_mut() {
        *x *= inv;
    }
}

/// Score a flat batch of `dims`-wide vectors against one query in parallel.
pub fn batch_dot(query: &[f32], flat: &[f32], dims: usize) -> Vec<f32> {
    debug_assert!(dims > 0 && flat.len() % dims == 0);
    flat.par_chunks_exact(dims).map(|v| dot(query, v)).collect()
}

fn select_kernel() -> DotFn {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            tracing::debug!(kernel = "avx2+fma", "selected dot kernel");
            return dot_avx2_fma;
        }
        if is_x86_feature_detected!("avx") {
            tracing::debug!(kernel = "avx", "selected dot kernel");
            return dot_avx;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") {
            tracing::debug!(kernel = "neon", "selected dot kernel");
            return dot_neon;
        }
    }

    tracing::debug!(kernel = "scalar", "selected dot kernel");
    dot_scalar
}

/// Scalar reference implementation; also handles SIMD tails.
pub(crate) fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
fn dot_avx2_fma(a: &[f32], b: &[f32]) -> f32 {
    // Safety: only selected after a runtime probe of avx2 and fma.
    unsafe { dot_avx2_fma_impl(a, b) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_avx2_fma_impl(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let off = i * 8;
        let av = _mm256_loadu_ps(a.as_ptr().add(off));
        let bv = _mm256_loadu_ps(b.as_ptr().add(off));
        acc = _mm256_fmadd_ps(av, bv, acc);
    }

    let tail = chunks * 8;
    horizontal_sum_256(acc) + dot_scalar(&a[tail..], &b[tail..])
}

#[cfg(target_arch = "x86_64")]
fn dot_avx(a: &[f32], b: &[f32]) -> f32 {
    // Safety: only selected after a runtime probe of avx.
    unsafe { dot_avx_impl(a, b) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn dot_avx_impl(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();

    // No FMA here: separate multiply and add.
    for i in 0..chunks {
        let off = i * 8;
        let av = _mm256_loadu_ps(a.as_ptr().add(off));
        let bv = _mm256_loadu_ps(b.as_ptr().add(off));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(av, bv));
    }

    let tail = chunks * 8;
    horizontal_sum_256(acc) + dot_scalar(&a[tail..], &b[tail..])
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
#[inline]
unsafe fn horizontal_sum_256(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let sum_128 = _mm_add_ps(hi, lo);
    let sum_64 = _mm_hadd_ps(sum_128, sum_128);
    let sum_32 = _mm_hadd_ps(sum_64, sum_64);
    _mm_cvtss_f32(sum_32)
}

#[cfg(target_arch = "aarch64")]
fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    // Safety: only selected after a runtime probe of neon.
    unsafe { dot_neon_impl(a, b) }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon_impl(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let off = i * 4;
        let av = vld1q_f32(a.as_ptr().add(off));
        let bv = vld1q_f32(b.as_ptr().add(off));
        acc = vfmaq_f32(acc, av, bv);
    }

    let tail = chunks * 4;
    vaddvq_f32(acc) + dot_scalar(&a[tail..], &b[tail..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn identical_unit_vectors() {
        let mut v = vec![1.0f32, 2.0, 3.0, 4.0];
        normalize(&mut v);
        let sim = dot(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![0.0f32, 1.0, 0.0];
        assert!(dot(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors() {
        let mut a = vec![1.0f32, 2.0, 3.0];
        let mut b = vec![-1.0f32, -2.0, -3.0];
        normalize(&mut a);
        normalize(&mut b);
        assert!((dot(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_normalizes_without_nan() {
        let mut v = vec![0.0f32; 16];
        normalize(&mut v);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn dispatched_kernel_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(0x7159_ce2b);
        // Lengths around the lane widths exercise every tail path.
        for len in [1, 3, 4, 7, 8, 9, 15, 16, 17, 31, 32, 33, 128, 384, 1000] {
            let a: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let b: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let fast = dot(&a, &b);
            let reference = dot_scalar(&a, &b);
            assert!(
                (fast - reference).abs() <= 1e-4 * (1.0 + reference.abs()),
                "len {len}: {fast} vs {reference}"
            );
        }
    }

    #[test]
    fn nan_propagates() {
        let a = vec![f32::NAN, 0.0, 0.0, 0.0];
        let b = vec![1.0f32, 0.0, 0.0, 0.0];
        assert!(dot(&a, &b).is_nan());
    }

    #[test]
    fn batch_matches_single() {
        let mut rng = StdRng::seed_from_u64(42);
        let dims = 64;
        let query: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let flat: Vec<f32> = (0..dims * 10).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let sims = batch_dot(&query, &flat, dims);
        assert_eq!(sims.len(), 10);
        for (i, sim) in sims.iter().enumerate() {
            let single = dot(&query, &flat[i * dims..(i + 1) * dims]);
            assert!((sim - single).abs() < 1e-6);
        }
    }
}
