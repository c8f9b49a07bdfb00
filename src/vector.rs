/// Cosine similarity in `[-1, 1]`.
///
/// Accumulates in f64 so that `cosine_similarity(q, q)` is exactly `1.0` for
/// any non-zero `q`. Returns 0.0 on a length mismatch or a zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    let chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    let remainder_start = a.len() - a.len() % 8;

    for (ac, bc) in chunks.zip(b_chunks) {
        for i in 0..8 {
            let x = ac[i] as f64;
            let y = bc[i] as f64;
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
    }

    for (x, y) in a[remainder_start..].iter().zip(&b[remainder_start..]) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 || !dot.is_finite() {
        return 0.0;
    }

    ((dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0)) as f32
}

/// `1 - cosine_similarity`. Lower is closer; used to walk the HNSW graph.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
