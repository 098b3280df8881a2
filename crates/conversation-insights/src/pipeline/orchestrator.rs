//! Runs queued analysis jobs through the stages and serves the read views.
//!
//! Stage order per job: Embedding, then Projection + Clustering (placements
//! committed), then Labeling and Similarity Grouping + Consolidation side by
//! side, then one transaction replacing themes and groups and marking the
//! conversation ready. Every write checks that this worker still owns the job.
//!
//! Themes and similarity groups only ever change in that final transaction,
//! so they always describe the last successful run. Response placements are
//! committed earlier; between the two commits the conversation reads as
//! `analyzing`, and if the job then fails for good it reads as `error` while
//! responses keep the new placements next to the previous run's themes. The
//! next successful run brings both back in step.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::analysis_db::{
    AnalysisDatabase, AnalysisStatus, ClaimedJob, EmbeddedResponse, EnqueueOutcome, FailureOutcome,
    GroupMemberPage, ResponsePlacement, RunResults, Strategy, Theme,
};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::metrics;
use crate::pipeline::clustering;
use crate::pipeline::consolidation;
use crate::pipeline::embedding;
use crate::pipeline::labeling;
use crate::pipeline::lock_keeper::LockKeeper;
use crate::pipeline::projection::{self, ProjectionParams};
use crate::pipeline::similarity::{self, ClusteredVector};
use crate::pipeline::staleness::{self, StalenessReport};
use crate::providers::{EmbeddingProvider, TextGenerator};

pub const MAX_PAGE_LIMIT: u64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequestOutcome {
    pub job_id: String,
    pub strategy: Strategy,
    /// False when an in-flight job was returned instead of a new one.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisStatusView {
    pub conversation_id: String,
    pub status: AnalysisStatus,
    pub error: Option<String>,
    #[serde(flatten)]
    pub staleness: StalenessReport,
    pub last_analyzed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub active_job_id: Option<String>,
    pub recommended_strategy: Strategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseView {
    pub id: String,
    pub text: String,
    pub tag: Option<String>,
    pub cluster_index: Option<u32>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub is_outlier: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub id: String,
    pub cluster_index: u32,
    pub representative_response_id: String,
    pub consolidated_statement: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnderstandView {
    pub conversation_id: String,
    pub title: String,
    pub status: AnalysisStatus,
    pub responses: Vec<ResponseView>,
    pub themes: Vec<Theme>,
    pub similarity_groups: Vec<GroupSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Requeued,
    Failed,
    /// Another worker took the job over; nothing was written after the loss.
    LostClaim,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Requeued => "requeued",
            Self::Failed => "failed",
            Self::LostClaim => "lost_claim",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub conversation_id: String,
    pub outcome: JobOutcome,
}

pub struct AnalysisOrchestrator {
    db: Arc<AnalysisDatabase>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
    config: AnalysisConfig,
    seed: Option<u64>,
}

impl AnalysisOrchestrator {
    pub fn new(
        db: Arc<AnalysisDatabase>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            generator,
            config,
            seed: None,
        }
    }

    /// Fix the RNG used by projection and clustering.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn database(&self) -> &Arc<AnalysisDatabase> {
        &self.db
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Queue a run, or return the job already in flight for the conversation.
    /// Without an explicit strategy the staleness policy picks one.
    pub fn request_analysis(&self, conversation_id: &str, strategy: Option<Strategy>) -> AnalysisResult<AnalysisRequestOutcome> {
        let strategy = match strategy {
            Some(strategy) => strategy,
            None => {
                self.db.conversations.ensure_conversation(conversation_id)?;
                let state = self.db.states.get(conversation_id)?;
                let count = self.db.conversations.count_responses(conversation_id)?;
                staleness::choose_strategy(&state, count, self.config.full_reanalysis_ratio)
            }
        };

        match self.db.jobs.enqueue(conversation_id, strategy)? {
            EnqueueOutcome::Created(job_id) => Ok(AnalysisRequestOutcome {
                job_id,
                strategy,
                created: true,
            }),
            EnqueueOutcome::Existing(job_id) => {
                let existing = self
                    .db
                    .jobs
                    .get_job(&job_id)?
                    .map(|job| job.strategy)
                    .unwrap_or(strategy);
                Ok(AnalysisRequestOutcome {
                    job_id,
                    strategy: existing,
                    created: false,
                })
            }
        }
    }

    pub fn get_analysis_status(&self, conversation_id: &str) -> AnalysisResult<AnalysisStatusView> {
        self.db.conversations.ensure_conversation(conversation_id)?;
        let state = self.db.states.get(conversation_id)?;
        let count = self.db.conversations.count_responses(conversation_id)?;
        let active_job_id = self.db.jobs.active_job(conversation_id)?.map(|job| job.id);

        Ok(AnalysisStatusView {
            conversation_id: conversation_id.to_string(),
            status: state.status,
            error: state.error.clone(),
            staleness: staleness::assess(&state, count),
            last_analyzed_at: state.last_analyzed_at,
            active_job_id,
            recommended_strategy: staleness::choose_strategy(&state, count, self.config.full_reanalysis_ratio),
        })
    }

    pub fn get_understand_view(&self, conversation_id: &str) -> AnalysisResult<UnderstandView> {
        let conversation = self
            .db
            .conversations
            .get_conversation(conversation_id)?
            .ok_or_else(|| AnalysisError::not_found(format!("Unknown conversation {}", conversation_id)))?;
        let state = self.db.states.get(conversation_id)?;

        let responses = self
            .db
            .conversations
            .list_responses(conversation_id)?
            .into_iter()
            .map(|r| ResponseView {
                id: r.id,
                text: r.text,
                tag: r.tag,
                cluster_index: r.cluster_index,
                x: r.x,
                y: r.y,
                is_outlier: r.is_outlier,
            })
            .collect();
        let similarity_groups = self
            .db
            .results
            .list_groups(conversation_id)?
            .into_iter()
            .map(|g| GroupSummary {
                member_count: g.member_ids.len(),
                id: g.id,
                cluster_index: g.cluster_index,
                representative_response_id: g.representative_response_id,
                consolidated_statement: g.consolidated_statement,
            })
            .collect();

        Ok(UnderstandView {
            conversation_id: conversation.id,
            title: conversation.title,
            status: state.status,
            responses,
            themes: self.db.results.list_themes(conversation_id)?,
            similarity_groups,
        })
    }

    /// Page through a group's member texts; `limit` is clamped to 1..=100.
    pub fn get_group_members(&self, group_id: &str, offset: u64, limit: u64) -> AnalysisResult<GroupMemberPage> {
        self.db.results.group_members(group_id, offset, limit.clamp(1, MAX_PAGE_LIMIT))
    }

    /// Claim and run one job. `None` when the queue is idle.
    pub async fn process_next(&self, owner: &str) -> AnalysisResult<Option<JobReport>> {
        let claim = self
            .db
            .jobs
            .claim(owner, self.config.lock_timeout(), self.config.max_job_attempts)?;
        match claim {
            Some(claim) => self.run_claimed(claim).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process jobs until none can be claimed.
    pub async fn run_until_idle(&self, owner: &str) -> AnalysisResult<Vec<JobReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.process_next(owner).await? {
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn run_claimed(&self, claim: ClaimedJob) -> AnalysisResult<JobReport> {
        let started = Instant::now();
        metrics::inc_in_flight();
        let period = (self.config.lock_timeout() / 3).max(Duration::from_millis(50));
        let result = match LockKeeper::start(Arc::clone(&self.db), claim.clone(), period) {
            Ok((keeper, mut lost)) => {
                let result = tokio::select! {
                    result = self.run_stages(&claim) => result,
                    Ok(lost) = &mut lost => Err(lost),
                };
                drop(keeper);
                result
            }
            Err(e) => Err(e),
        };
        metrics::dec_in_flight();

        let outcome = match result {
            Ok(()) => {
                info!(
                    "Job {} for conversation {} succeeded in {:.2}s",
                    claim.job_id(),
                    claim.conversation_id(),
                    started.elapsed().as_secs_f64()
                );
                JobOutcome::Succeeded
            }
            Err(AnalysisError::Concurrency(message)) => {
                warn!("Job {} abandoned: {}", claim.job_id(), message);
                JobOutcome::LostClaim
            }
            Err(e) => {
                error!("Job {} attempt {} failed: {}", claim.job_id(), claim.job.attempts, e);
                match self.db.jobs.fail(&claim, &e.to_string(), self.config.max_job_attempts) {
                    Ok(FailureOutcome::Requeued) => JobOutcome::Requeued,
                    Ok(FailureOutcome::Failed) => JobOutcome::Failed,
                    Err(AnalysisError::Concurrency(_)) => JobOutcome::LostClaim,
                    Err(fail_error) => return Err(fail_error),
                }
            }
        };
        metrics::inc_job(outcome.as_str());

        Ok(JobReport {
            job_id: claim.job.id.clone(),
            conversation_id: claim.job.conversation_id.clone(),
            outcome,
        })
    }

    async fn run_stages(&self, claim: &ClaimedJob) -> AnalysisResult<()> {
        let conversation_id = claim.conversation_id();
        if claim.reclaimed {
            info!("Restarting job {} from the embedding stage", claim.job_id());
        }

        self.db.states.advance(claim, AnalysisStatus::Embedding)?;
        let stage_started = Instant::now();
        let summary = embedding::run(&self.db, self.embedder.as_ref(), claim, claim.job.strategy, &self.config).await?;
        metrics::observe_stage("embedding", stage_started.elapsed().as_secs_f64());
        info!(
            "Embedded {} responses in {} batches for conversation {}",
            summary.embedded, summary.batches, conversation_id
        );

        self.db.states.advance(claim, AnalysisStatus::Analyzing)?;
        let responses = self.db.conversations.embedded_responses(conversation_id)?;
        if responses.is_empty() {
            info!("Conversation {} has no responses; committing an empty analysis", conversation_id);
            self.db.conversations.apply_placements(claim, &[])?;
            return self.db.results.commit_run(claim, &RunResults::default());
        }
        check_dimensions(&responses)?;

        let stage_started = Instant::now();
        let clustering = self.place_responses(claim, &responses)?;
        metrics::observe_stage("clustering", stage_started.elapsed().as_secs_f64());

        let stage_started = Instant::now();
        let texts: Vec<&str> = responses.iter().map(|r| r.text.as_str()).collect();
        let samples = labeling::sample_clusters(&clustering, &texts, self.config.label_sample_size);

        let items: Vec<ClusteredVector<'_>> = responses
            .iter()
            .zip(&clustering.assignments)
            .map(|(r, cluster)| ClusteredVector {
                id: &r.id,
                cluster_index: Some(*cluster),
                embedding: &r.embedding,
            })
            .collect();
        let candidates =
            similarity::find_similarity_groups(&items, self.config.similarity_threshold, self.config.min_group_size);
        let text_by_id: HashMap<&str, &str> = responses.iter().map(|r| (r.id.as_str(), r.text.as_str())).collect();

        let generator = self.generator.as_ref();
        let concurrency = self.config.generation_concurrency;
        let (themes, groups) = tokio::try_join!(
            labeling::label_clusters(generator, &samples, concurrency),
            consolidation::consolidate(generator, &candidates, &text_by_id, concurrency),
        )?;
        metrics::observe_stage("labeling_consolidation", stage_started.elapsed().as_secs_f64());

        self.db.results.commit_run(
            claim,
            &RunResults {
                themes,
                groups,
                analyzed_count: responses.len() as u64,
            },
        )
    }

    /// Projection and clustering over the whole embedding set, committed in
    /// one transaction.
    fn place_responses(&self, claim: &ClaimedJob, responses: &[EmbeddedResponse]) -> AnalysisResult<clustering::Clustering> {
        let vectors: Vec<Vec<f32>> = responses.iter().map(|r| r.embedding.clone()).collect();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let layout = projection::project(
            &vectors,
            ProjectionParams {
                n_neighbors: self.config.projection_neighbors,
                min_dist: self.config.projection_min_dist,
                epochs: self.config.projection_epochs,
            },
            &mut rng,
        );
        let clustering = clustering::kmeans(&vectors, self.config.cluster_count, self.config.kmeans_max_iterations, &mut rng);

        let placements: Vec<ResponsePlacement> = responses
            .iter()
            .enumerate()
            .map(|(i, response)| ResponsePlacement {
                response_id: response.id.clone(),
                x: layout[i][0],
                y: layout[i][1],
                cluster_index: clustering.assignments[i],
                is_outlier: clustering.is_outlier(i, self.config.outlier_similarity),
            })
            .collect();
        self.db.conversations.apply_placements(claim, &placements)?;
        info!(
            "Placed {} responses into {} clusters for conversation {}",
            placements.len(),
            clustering.cluster_count(),
            claim.conversation_id()
        );
        Ok(clustering)
    }
}

fn check_dimensions(responses: &[EmbeddedResponse]) -> AnalysisResult<()> {
    let dim = responses[0].embedding.len();
    if dim == 0 || responses.iter().any(|r| r.embedding.len() != dim) {
        return Err(AnalysisError::validation(
            "Stored embeddings have inconsistent dimensions; request a full analysis",
        ));
    }
    Ok(())
}
