//! Narrow interfaces to the external model provider.
//!
//! The pipeline only ever sees these two traits; `LlmClient` is the HTTP
//! implementation and tests substitute scripted fakes.

pub mod llm_client;

pub use llm_client::LlmClient;

use crate::error::{AnalysisError, AnalysisResult};
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> AnalysisResult<Vec<Vec<f32>>>;

    /// Model identifier stored next to each embedding.
    fn model_name(&self) -> &str;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> AnalysisResult<String>;
}

/// Reject provider output that cannot be aligned with its inputs.
pub fn validate_embeddings(expected: usize, vectors: &[Vec<f32>]) -> AnalysisResult<usize> {
    if vectors.len() != expected {
        return Err(AnalysisError::provider(format!(
            "Embedding provider returned {} vectors for {} texts",
            vectors.len(),
            expected
        )));
    }
    let dimension = vectors.first().map(|v| v.len()).unwrap_or(0);
    if expected > 0 && dimension == 0 {
        return Err(AnalysisError::provider("Embedding provider returned empty vectors"));
    }
    for (i, vector) in vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(AnalysisError::provider(format!(
                "Embedding #{} has dimension {}, expected {}",
                i,
                vector.len(),
                dimension
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::provider(format!("Embedding #{} contains non-finite values", i)));
        }
    }
    Ok(dimension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_batch_reports_its_dimension() {
        assert_eq!(validate_embeddings(2, &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap(), 2);
        assert_eq!(validate_embeddings(0, &[]).unwrap(), 0);
    }

    #[test]
    fn malformed_batches_are_provider_errors() {
        assert_eq!(validate_embeddings(2, &[vec![1.0]]).unwrap_err().kind(), "provider");
        assert!(validate_embeddings(2, &[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(validate_embeddings(1, &[vec![f32::NAN]]).is_err());
        assert!(validate_embeddings(1, &[vec![]]).is_err());
    }
}
