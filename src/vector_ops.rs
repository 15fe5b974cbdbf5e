use crate::config::{Number, EPSILON};
use wide::f32x8;

const LANES: usize = 8;

/// Largest squared norm for which any pairwise squared distance stays finite:
/// `|a - b|^2 <= 2|a|^2 + 2|b|^2`.
const MAX_SQUARED_NORM: f64 = Number::MAX as f64 / 4.0;

#[inline]
fn load_lanes(slice: &[Number]) -> f32x8 {
    let mut lanes = [0.0; LANES];
    lanes.copy_from_slice(slice);
    f32x8::new(lanes)
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
pub fn squared_l2_simd(a: &[Number], b: &[Number]) -> Number {
    debug_assert_eq!(a.len(), b.len());

    let simd_len = a.len() - (a.len() % LANES);
    let mut acc = f32x8::splat(0.0);

    for (ca, cb) in a[..simd_len]
        .chunks_exact(LANES)
        .zip(b[..simd_len].chunks_exact(LANES))
    {
        let diff = load_lanes(ca) - load_lanes(cb);
        acc += diff * diff;
    }

    let mut sum = acc.reduce_add();
    for i in simd_len..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Cosine similarity in `[-1, 1]`: both vectors are scaled to unit length
/// and dotted. Returns `None` when the lengths differ and `0.0` when either
/// vector has no magnitude.
pub fn cosine_similarity(a: &[Number], b: &[Number]) -> Option<Number> {
    if a.len() != b.len() {
        return None;
    }

    let mut dot_product = f32x8::splat(0.0);
    let mut mag_a = f32x8::splat(0.0);
    let mut mag_b = f32x8::splat(0.0);

    let len = a.len();
    let simd_len = len - (len % LANES);

    for (ca, cb) in a[..simd_len]
        .chunks_exact(LANES)
        .zip(b[..simd_len].chunks_exact(LANES))
    {
        let va = load_lanes(ca);
        let vb = load_lanes(cb);
        dot_product += va * vb;
        mag_a += va * va;
        mag_b += vb * vb;
    }

    let mut scalar_dot_product = dot_product.reduce_add();
    let mut scalar_mag_a = mag_a.reduce_add();
    let mut scalar_mag_b = mag_b.reduce_add();

    for i in simd_len..len {
        scalar_dot_product += a[i] * b[i];
        scalar_mag_a += a[i] * a[i];
        scalar_mag_b += b[i] * b[i];
    }

    let denominator = (scalar_mag_a * scalar_mag_b).sqrt();
    if denominator < EPSILON {
        Some(0.0)
    } else {
        Some((scalar_dot_product / denominator).clamp(-1.0, 1.0))
    }
}

pub fn normalize_vector(vector: &mut [Number]) {
    let magnitude: Number = vector.iter().map(|&x| x * x).sum::<Number>().sqrt();
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Whether squared distances involving `vector` are guaranteed finite.
/// False for NaN or infinite components.
pub fn within_distance_range(vector: &[Number]) -> bool {
    let squared_norm: f64 = vector.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    squared_norm <= MAX_SQUARED_NORM
}

/// Map a squared distance onto `(0, 1]`, decreasing in distance.
#[inline]
pub fn distance_to_similarity(distance: Number) -> Number {
    1.0 / (1.0 + distance)
}
