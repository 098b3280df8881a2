//! Embedding stage: turn response texts into vectors in fixed-size batches.
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::analysis_db::{AnalysisDatabase, ClaimedJob, PendingText, Strategy};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::providers::{validate_embeddings, EmbeddingProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingSummary {
    pub embedded: usize,
    pub batches: usize,
}

/// Embed every text the strategy selects.
///
/// Batches are requested with at most `embed_concurrency` calls in flight and
/// consumed in input order; each batch is written in its own transaction only
/// after its call succeeded. The first failure stops the stage.
pub async fn run(
    db: &AnalysisDatabase,
    provider: &dyn EmbeddingProvider,
    claim: &ClaimedJob,
    strategy: Strategy,
    config: &AnalysisConfig,
) -> AnalysisResult<EmbeddingSummary> {
    let pending = db.conversations.texts_for_embedding(claim.conversation_id(), strategy)?;
    if pending.is_empty() {
        debug!("Nothing to embed for conversation {}", claim.conversation_id());
        return Ok(EmbeddingSummary { embedded: 0, batches: 0 });
    }

    let batches: Vec<&[PendingText]> = pending.chunks(config.embed_batch_size.max(1)).collect();
    let batch_count = batches.len();
    info!(
        "Embedding {} responses in {} batches for conversation {}",
        pending.len(),
        batch_count,
        claim.conversation_id()
    );

    let mut results = stream::iter(batches)
        .map(|batch| async move {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let vectors = provider.embed(&texts).await?;
            validate_embeddings(texts.len(), &vectors)?;
            Ok::<_, AnalysisError>((batch, vectors))
        })
        .buffered(config.embed_concurrency.max(1));

    let mut dimension: Option<usize> = None;
    let mut embedded = 0usize;
    while let Some(next) = results.next().await {
        let (batch, vectors) = next?;
        let batch_dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        match dimension {
            Some(expected) if expected != batch_dim => {
                return Err(AnalysisError::provider(format!(
                    "Embedding dimension changed between batches ({} vs {})",
                    expected, batch_dim
                )));
            }
            _ => dimension = Some(batch_dim),
        }

        let rows: Vec<(String, Vec<f32>)> = batch.iter().map(|p| p.id.clone()).zip(vectors).collect();
        db.conversations.store_embeddings(claim, provider.model_name(), &rows)?;
        embedded += rows.len();
        debug!("Stored embedding batch ({} / {})", embedded, pending.len());
    }

    Ok(EmbeddingSummary { embedded, batches: batch_count })
}
