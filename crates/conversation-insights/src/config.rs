//! Service configuration loaded from the environment (and `.env` when present).

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Tunables for the analysis pipeline and the job queue.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,
    pub cluster_count: usize,
    pub kmeans_max_iterations: usize,
    pub projection_neighbors: usize,
    pub projection_min_dist: f32,
    pub projection_epochs: usize,
    pub similarity_threshold: f32,
    pub min_group_size: usize,
    pub label_sample_size: usize,
    pub generation_concurrency: usize,
    pub max_job_attempts: u32,
    pub job_lock_timeout_seconds: u64,
    pub job_poll_interval_ms: u64,
    /// Fraction of unanalyzed responses above which a full re-run is chosen.
    pub full_reanalysis_ratio: f64,
    pub outlier_similarity: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 64,
            embed_concurrency: 2,
            cluster_count: 8,
            kmeans_max_iterations: 50,
            projection_neighbors: 15,
            projection_min_dist: 0.1,
            projection_epochs: 200,
            similarity_threshold: 0.88,
            min_group_size: 2,
            label_sample_size: 20,
            generation_concurrency: 8,
            max_job_attempts: 3,
            job_lock_timeout_seconds: 300,
            job_poll_interval_ms: 1000,
            full_reanalysis_ratio: 0.5,
            outlier_similarity: 0.2,
        }
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            embed_batch_size: env_or("EMBED_BATCH_SIZE", defaults.embed_batch_size)?,
            embed_concurrency: env_or("EMBED_CONCURRENCY", defaults.embed_concurrency)?,
            cluster_count: env_or("CLUSTER_COUNT", defaults.cluster_count)?,
            kmeans_max_iterations: env_or("KMEANS_MAX_ITERATIONS", defaults.kmeans_max_iterations)?,
            projection_neighbors: env_or("PROJECTION_NEIGHBORS", defaults.projection_neighbors)?,
            projection_min_dist: env_or("PROJECTION_MIN_DIST", defaults.projection_min_dist)?,
            projection_epochs: env_or("PROJECTION_EPOCHS", defaults.projection_epochs)?,
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", defaults.similarity_threshold)?,
            min_group_size: env_or("MIN_GROUP_SIZE", defaults.min_group_size)?,
            label_sample_size: env_or("LABEL_SAMPLE_SIZE", defaults.label_sample_size)?,
            generation_concurrency: env_or("GENERATION_CONCURRENCY", defaults.generation_concurrency)?,
            max_job_attempts: env_or("MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?,
            job_lock_timeout_seconds: env_or("JOB_LOCK_TIMEOUT_SECONDS", defaults.job_lock_timeout_seconds)?,
            job_poll_interval_ms: env_or("JOB_POLL_INTERVAL_MS", defaults.job_poll_interval_ms)?,
            full_reanalysis_ratio: env_or("FULL_REANALYSIS_RATIO", defaults.full_reanalysis_ratio)?,
            outlier_similarity: env_or("OUTLIER_SIMILARITY", defaults.outlier_similarity)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_batch_size == 0 {
            anyhow::bail!("EMBED_BATCH_SIZE must be at least 1");
        }
        if self.cluster_count == 0 {
            anyhow::bail!("CLUSTER_COUNT must be at least 1");
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            anyhow::bail!("SIMILARITY_THRESHOLD must lie in [-1, 1], got {}", self.similarity_threshold);
        }
        if self.max_job_attempts == 0 {
            anyhow::bail!("MAX_JOB_ATTEMPTS must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.full_reanalysis_ratio) {
            anyhow::bail!("FULL_REANALYSIS_RATIO must lie in [0, 1]");
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.job_lock_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub provider_base_url: String,
    pub provider_api_key: Option<String>,
    pub embedding_model: String,
    pub generation_model: String,
    pub provider_timeout_seconds: u64,
    pub workers: usize,
    pub analysis: AnalysisConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let workers = if env::var("ANALYSIS_WORKERS").unwrap_or_else(|_| "auto".into()) == "auto" {
            Self::auto_detect_workers()
        } else {
            env_or("ANALYSIS_WORKERS", 2usize)?.max(1)
        };

        Ok(Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/insights.db".into()),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env_or("API_PORT", 8080u16)?,
            provider_base_url: env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8081".into())
                .trim_end_matches('/')
                .to_string(),
            provider_api_key: env::var("PROVIDER_API_KEY").ok().filter(|k| !k.is_empty()),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding".into()),
            generation_model: env::var("GENERATION_MODEL").unwrap_or_else(|_| "local-llm".into()),
            provider_timeout_seconds: env_or("PROVIDER_TIMEOUT_SECONDS", 120u64)?,
            workers,
            analysis: AnalysisConfig::from_env()?,
        })
    }

    fn auto_detect_workers() -> usize {
        let cpu_cores = num_cpus::get();
        let workers = (cpu_cores / 4).clamp(1, 4);
        info!("Auto-detected {} CPU cores, using {} analysis workers", cpu_cores, workers);
        workers
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Provider URL: {}", self.provider_base_url);
        info!("- Embedding Model: {}", self.embedding_model);
        info!("- Generation Model: {}", self.generation_model);
        info!("- Workers: {}", self.workers);
        info!("- Clusters (K): {}", self.analysis.cluster_count);
        info!("- Similarity Threshold: {}", self.analysis.similarity_threshold);
        info!("- Min Group Size: {}", self.analysis.min_group_size);
        info!("- Max Job Attempts: {}", self.analysis.max_job_attempts);
        info!("- Lock Timeout: {}s", self.analysis.job_lock_timeout_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        _ => Ok(default),
    }
}
