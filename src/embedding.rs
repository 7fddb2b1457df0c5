//! Embedding provider seam and vector utilities.
//!
//! Embedding inference is an external collaborator: the core consumes
//! fixed-dimension vectors and never computes them. [`EmbeddingProvider`]
//! is the interface boundary; the shipped [`DisabledProvider`] makes the
//! dependency explicit when no backend is wired up.
//!
//! Vector utilities cover the storage codec (little-endian f32 BLOBs) and
//! cosine similarity, including the unit-interval mapping exposed to
//! search callers — raw cosine distance has inverted lower-is-better
//! semantics that must never leak out of this module.

use async_trait::async_trait;

use crate::error::{KbError, Result};

/// Interface to an external embedding backend.
///
/// Implementations must return vectors whose dimensionality matches the
/// stored schema (`embedding.dims` in config).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"bge-large-en-v1.5"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A no-op provider used when embeddings are not configured.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(KbError::Validation(
            "embedding provider is disabled; supply precomputed vectors".to_string(),
        ))
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Map a cosine similarity onto `[0, 1]`.
///
/// Equivalent to `1 - distance / 2` for cosine distance in `[0, 2]`:
/// 1.0 only for identical direction, 0.0 only at maximal distance.
pub fn similarity_to_unit(cosine: f32) -> f64 {
    let unit = (1.0 + cosine as f64) / 2.0;
    unit.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_unit_similarity_bounds() {
        // Identical vectors map to exactly 1.0
        assert!((similarity_to_unit(1.0) - 1.0).abs() < 1e-9);
        // Opposite vectors (cosine distance 2) map to exactly 0.0
        assert!(similarity_to_unit(-1.0).abs() < 1e-9);
        // Orthogonal falls in the middle
        assert!((similarity_to_unit(0.0) - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = DisabledProvider;
        assert_eq!(provider.model_name(), "disabled");
        let result = provider.embed(&["text".to_string()]).await;
        assert!(result.is_err());
    }
}
