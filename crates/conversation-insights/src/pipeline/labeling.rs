//! Labeling: a short name and description for every cluster.
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::analysis_db::Theme;
use crate::error::{AnalysisError, AnalysisResult};
use crate::metrics;
use crate::pipeline::clustering::Clustering;
use crate::providers::TextGenerator;
use crate::utils::TextUtils;

const MAX_NAME_WORDS: usize = 5;
const PROMPT_TEXT_LIMIT: usize = 300;

/// What the labeler needs to know about one cluster.
#[derive(Debug, Clone)]
pub struct ClusterSample {
    pub cluster_index: u32,
    pub size: usize,
    pub avg_cohesion: f32,
    /// Member texts closest to the centroid first.
    pub texts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LabelReply {
    name: String,
    description: String,
}

/// Pick up to `sample_size` member texts per cluster, most central first.
pub fn sample_clusters(clustering: &Clustering, texts: &[&str], sample_size: usize) -> Vec<ClusterSample> {
    (0..clustering.cluster_count() as u32)
        .map(|cluster| {
            let mut members = clustering.members(cluster);
            members.sort_by(|a, b| {
                clustering.similarities[*b]
                    .total_cmp(&clustering.similarities[*a])
                    .then(a.cmp(b))
            });
            ClusterSample {
                cluster_index: cluster,
                size: clustering.sizes[cluster as usize],
                avg_cohesion: clustering.cohesion[cluster as usize],
                texts: members.iter().take(sample_size).map(|&i| texts[i].to_string()).collect(),
            }
        })
        .collect()
}

pub fn fallback_label(cluster_index: u32, size: usize) -> (String, String) {
    (
        format!("Theme {}", cluster_index + 1),
        format!("A group of {} related responses.", size),
    )
}

fn build_prompt(sample: &ClusterSample) -> String {
    let mut prompt = String::from(
        "Here are responses people gave in a discussion. They were grouped together because they share a theme.\n\
         Reply with JSON only, in the form {\"name\": \"...\", \"description\": \"...\"}, where name is 2 to 5 words \
         and description is 1 to 2 neutral sentences summarizing the theme.\n\nResponses:\n",
    );
    for text in &sample.texts {
        let text = TextUtils::normalize_whitespace(text);
        prompt.push_str(&format!("- {}\n", TextUtils::truncate_with_ellipsis(&text, PROMPT_TEXT_LIMIT)));
    }
    prompt
}

/// Parse a `{name, description}` reply, tolerating prose around the JSON.
pub fn parse_label(raw: &str) -> AnalysisResult<(String, String)> {
    let json = TextUtils::extract_json_object(raw)
        .ok_or_else(|| AnalysisError::provider("Label reply contained no JSON object"))?;
    let reply: LabelReply = serde_json::from_str(json)
        .map_err(|e| AnalysisError::provider(format!("Malformed label reply: {}", e)))?;

    let name = TextUtils::first_words(&TextUtils::clean_generated(&reply.name), MAX_NAME_WORDS);
    let description = TextUtils::clean_generated(&reply.description);
    if name.is_empty() || description.is_empty() {
        return Err(AnalysisError::provider("Label reply had an empty name or description"));
    }
    Ok((name, description))
}

async fn label_one(generator: &dyn TextGenerator, sample: &ClusterSample) -> AnalysisResult<Theme> {
    let label = match generator.generate(&build_prompt(sample)).await {
        Ok(raw) => parse_label(&raw),
        Err(e) => Err(e),
    };
    let (name, description) = match label {
        Ok(label) => label,
        Err(e) if !e.is_fatal_to_stage() => {
            warn!("Labeling failed for cluster {}, using placeholder: {}", sample.cluster_index, e);
            metrics::inc_fallback("labeling");
            fallback_label(sample.cluster_index, sample.size)
        }
        Err(e) => return Err(e),
    };
    Ok(Theme {
        cluster_index: sample.cluster_index,
        name,
        description,
        size: sample.size,
        avg_cohesion: sample.avg_cohesion,
    })
}

/// Label all clusters concurrently. Per-cluster provider failures become
/// placeholders; themes come back ordered by descending size.
pub async fn label_clusters(
    generator: &dyn TextGenerator,
    samples: &[ClusterSample],
    concurrency: usize,
) -> AnalysisResult<Vec<Theme>> {
    let mut themes = stream::iter(samples)
        .map(|sample| label_one(generator, sample))
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<AnalysisResult<Vec<_>>>()?;

    themes.sort_by(|a, b| b.size.cmp(&a.size).then(a.cluster_index.cmp(&b.cluster_index)));
    debug!("Labeled {} clusters", themes.len());
    Ok(themes)
}
