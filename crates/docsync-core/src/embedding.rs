//! Vector helpers shared by the stores and the retrieval engine.
//!
//! Vectors are persisted as little-endian `f32` byte strings. The
//! [`Embedder`](crate::capability::Embedder) trait that produces them lives
//! in [`capability`](crate::capability).

use anyhow::{bail, Result};

/// Serialize a vector as little-endian `f32` bytes (`len × 4` bytes).
///
/// ```rust
/// use docsync_core::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![0.25f32, -1.0, 8.5];
/// assert_eq!(blob_to_vec(&vec_to_blob(&v)).unwrap(), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Fails on a byte length that is not a
/// multiple of four, which means the row was written by something else.
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        bail!("vector blob length {} is not a multiple of 4", blob.len());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, mismatched or
/// zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b.iter())
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Reject vectors whose dimensionality differs from the model's.
pub fn check_dims(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        bail!(
            "embedding has {} dimensions, expected {}",
            vector.len(),
            expected
        );
    }
    Ok(())
}
