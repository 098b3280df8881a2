//! Consolidation: one synthesized statement per similarity group.
use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analysis_db::SimilarityGroup;
use crate::error::AnalysisResult;
use crate::metrics;
use crate::pipeline::similarity::GroupCandidate;
use crate::providers::TextGenerator;
use crate::utils::TextUtils;

pub const COMBINED_TEXT_SEPARATOR: &str = "\n---\n";

/// Upper bound on characters of each member text placed in the prompt.
const PROMPT_TEXT_LIMIT: usize = 600;

/// Audit string recording exactly which responses were merged.
pub fn combined_text(members: &[(&str, &str)]) -> String {
    members
        .iter()
        .map(|(id, text)| format!("{}: {}", id, text))
        .collect::<Vec<_>>()
        .join(COMBINED_TEXT_SEPARATOR)
}

pub fn build_prompt(member_texts: &[&str]) -> String {
    let mut prompt = String::from(
        "The following responses from participants express closely related opinions.\n\
         Write ONE consolidated statement that:\n\
         - preserves every distinct point raised,\n\
         - stays neutral and introduces no new claims,\n\
         - is 1 to 3 sentences long.\n\
         Reply with the statement only.\n\nResponses:\n",
    );
    for (i, text) in member_texts.iter().enumerate() {
        let text = TextUtils::normalize_whitespace(text);
        prompt.push_str(&format!("{}. {}\n", i + 1, TextUtils::truncate_with_ellipsis(&text, PROMPT_TEXT_LIMIT)));
    }
    prompt
}

/// Statement for one group's member texts.
///
/// No members yields an empty statement and a single member is returned
/// verbatim; only groups of two or more reach the generator. A provider
/// failure falls back to the first member's text.
pub async fn synthesize_statement(generator: &dyn TextGenerator, member_texts: &[&str]) -> AnalysisResult<String> {
    match member_texts {
        [] => Ok(String::new()),
        [only] => Ok((*only).to_string()),
        [first, ..] => match generator.generate(&build_prompt(member_texts)).await {
            Ok(raw) => {
                let statement = TextUtils::clean_generated(&raw);
                if statement.is_empty() {
                    warn!("Consolidation returned an empty statement, using the first member");
                    metrics::inc_fallback("consolidation");
                    Ok((*first).to_string())
                } else {
                    Ok(statement)
                }
            }
            Err(e) if !e.is_fatal_to_stage() => {
                warn!("Consolidation failed, using the first member: {}", e);
                metrics::inc_fallback("consolidation");
                Ok((*first).to_string())
            }
            Err(e) => Err(e),
        },
    }
}

/// Consolidate every candidate concurrently; output keeps the input order.
pub async fn consolidate(
    generator: &dyn TextGenerator,
    candidates: &[GroupCandidate],
    texts: &HashMap<&str, &str>,
    concurrency: usize,
) -> AnalysisResult<Vec<SimilarityGroup>> {
    let mut results: Vec<(usize, SimilarityGroup)> = stream::iter(candidates.iter().enumerate())
        .map(|(position, candidate)| async move {
            let members: Vec<(&str, &str)> = candidate
                .member_ids
                .iter()
                .map(|id| (id.as_str(), texts.get(id.as_str()).copied().unwrap_or("")))
                .collect();
            let member_texts: Vec<&str> = members.iter().map(|(_, text)| *text).collect();
            let statement = synthesize_statement(generator, &member_texts).await?;
            Ok::<_, crate::error::AnalysisError>((
                position,
                SimilarityGroup {
                    id: Uuid::new_v4().to_string(),
                    cluster_index: candidate.cluster_index,
                    representative_response_id: candidate.representative_id.clone(),
                    member_ids: candidate.member_ids.clone(),
                    consolidated_statement: statement,
                    combined_text: combined_text(&members),
                },
            ))
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<AnalysisResult<Vec<_>>>()?;

    results.sort_by_key(|(position, _)| *position);
    debug!("Consolidated {} similarity groups", results.len());
    Ok(results.into_iter().map(|(_, group)| group).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::test_support::FakeGenerator;

    fn candidate(cluster: u32, ids: &[&str]) -> GroupCandidate {
        GroupCandidate {
            cluster_index: cluster,
            representative_id: ids[0].to_string(),
            member_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn combined_text_lists_every_member() {
        let text = combined_text(&[("r1", "More trees"), ("r2", "Plant more trees")]);
        assert_eq!(text, "r1: More trees\n---\nr2: Plant more trees");
    }

    #[tokio::test]
    async fn group_sizes_decide_whether_the_generator_runs() {
        let generator = FakeGenerator::replying("Plant more trees in parks.");

        assert_eq!(synthesize_statement(&generator, &[]).await.unwrap(), "");
        assert_eq!(synthesize_statement(&generator, &["Only one"]).await.unwrap(), "Only one");
        assert_eq!(generator.calls(), 0);

        let merged = synthesize_statement(&generator, &["More trees", "Plant trees"]).await.unwrap();
        assert_eq!(merged, "Plant more trees in parks.");
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn a_failing_group_falls_back_without_affecting_siblings() {
        let generator = FakeGenerator::new(|prompt| {
            if prompt.contains("bikes") {
                Err(AnalysisError::provider("rate limited"))
            } else {
                Ok("Merged statement.".to_string())
            }
        });
        let texts: HashMap<&str, &str> = [
            ("a", "more trees"),
            ("b", "plant trees"),
            ("c", "bikes lanes please"),
            ("d", "safer bikes"),
        ]
        .into_iter()
        .collect();
        let candidates = vec![candidate(0, &["a", "b"]), candidate(1, &["c", "d"])];

        let groups = consolidate(&generator, &candidates, &texts, 4).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].consolidated_statement, "Merged statement.");
        assert_eq!(groups[1].consolidated_statement, "bikes lanes please");
        assert_eq!(groups[1].combined_text, "c: bikes lanes please\n---\nd: safer bikes");
        assert_eq!(groups[1].member_ids, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn non_provider_errors_abort() {
        let generator = FakeGenerator::new(|_| Err(AnalysisError::persistence("disk full")));
        let err = synthesize_statement(&generator, &["a", "b"]).await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
    }

    #[test]
    fn prompt_numbers_each_response() {
        let prompt = build_prompt(&["first  text", "second"]);
        assert!(prompt.contains("1. first text\n"));
        assert!(prompt.contains("2. second\n"));
        assert!(prompt.contains("1 to 3 sentences"));
    }
}
