//! Background workers that drain the analysis job queue.
//!
//! Each worker is a named OS thread driving its own current-thread tokio
//! runtime. Workers coordinate only through the atomic claim in the job
//! table, so several pools (or processes) may share one database file.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::AnalysisOrchestrator;

const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub poll_interval: Duration,
}

impl WorkerPoolConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_interval: config.analysis.poll_interval(),
        }
    }
}

pub struct AnalysisWorker {
    name: String,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl AnalysisWorker {
    pub fn spawn(
        name: String,
        orchestrator: Arc<AnalysisOrchestrator>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let owner = format!("{}-{}", name, &Uuid::new_v4().simple().to_string()[..8]);

        let thread_handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create runtime for worker {}: {}", owner, e);
                    return;
                }
            };
            rt.block_on(Self::run_worker_loop(owner, orchestrator, running_clone, poll_interval));
        })?;

        info!("Spawned analysis worker: {}", name);
        Ok(Self {
            name,
            thread_handle: Some(thread_handle),
            running,
        })
    }

    async fn run_worker_loop(
        owner: String,
        orchestrator: Arc<AnalysisOrchestrator>,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) {
        while running.load(Ordering::Relaxed) {
            match orchestrator.process_next(&owner).await {
                Ok(Some(report)) => {
                    debug!("Worker {} finished job {}: {:?}", owner, report.job_id, report.outcome);
                }
                Ok(None) => Self::idle(&running, poll_interval).await,
                Err(e) => {
                    error!("Worker {} could not process the queue: {}", owner, e);
                    Self::idle(&running, poll_interval).await;
                }
            }
        }
        info!("Analysis worker {} shutting down", owner);
    }

    /// Sleep for `poll_interval`, waking early when shutdown is requested.
    async fn idle(running: &AtomicBool, poll_interval: Duration) {
        let deadline = Instant::now() + poll_interval;
        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(SHUTDOWN_CHECK)).await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Vec<AnalysisWorker>,
}

impl WorkerPool {
    pub fn start(config: WorkerPoolConfig, orchestrator: Arc<AnalysisOrchestrator>) -> anyhow::Result<Self> {
        info!("Starting worker pool with config: {:?}", config);
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let worker = AnalysisWorker::spawn(
                format!("analysis-worker-{}", i),
                Arc::clone(&orchestrator),
                config.poll_interval,
            )?;
            workers.push(worker);
        }
        info!("Worker pool started with {} workers", workers.len());
        Ok(Self { config, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Signal every worker, then wait for in-flight jobs to finish.
    pub fn shutdown(&mut self) {
        info!("Shutting down worker pool");
        for worker in &self.workers {
            worker.stop();
        }
        self.workers.clear();
        info!("Worker pool shutdown complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_db::{AnalysisDatabase, AnalysisStatus, JobStatus, Strategy};
    use crate::config::AnalysisConfig;
    use crate::test_support::{seed_conversation, FakeEmbedder, FakeGenerator};
    use std::collections::HashSet;

    #[test]
    fn concurrent_claimers_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(AnalysisDatabase::new(&dir.path().join("queue.db")).unwrap());
        let mut expected = HashSet::new();
        for i in 0..12 {
            let (conversation_id, _) = seed_conversation(&db, &[&format!("response {}", i)]);
            let outcome = db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();
            expected.insert(outcome.job_id().to_string());
        }

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    let owner = format!("claimer-{}", w);
                    let mut claimed = Vec::new();
                    while let Some(claim) = db.jobs.claim(&owner, Duration::from_secs(300), 3).unwrap() {
                        claimed.push(claim.job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for job_id in handle.join().unwrap() {
                assert!(seen.insert(job_id), "job claimed twice");
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn pool_drains_the_queue_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(AnalysisDatabase::new(&dir.path().join("pool.db")).unwrap());
        let (first, _) = seed_conversation(&db, &["alpha", "beta", "gamma"]);
        let (second, _) = seed_conversation(&db, &["delta", "epsilon"]);

        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            Arc::clone(&db),
            Arc::new(FakeEmbedder::by_length()),
            Arc::new(FakeGenerator::replying("{\"name\": \"Words\", \"description\": \"Short words.\"}")),
            AnalysisConfig {
                cluster_count: 2,
                projection_epochs: 20,
                ..AnalysisConfig::default()
            },
        ));
        let first_job = orchestrator.request_analysis(&first, None).unwrap().job_id;
        let second_job = orchestrator.request_analysis(&second, None).unwrap().job_id;

        let mut pool = WorkerPool::start(
            WorkerPoolConfig {
                workers: 2,
                poll_interval: Duration::from_millis(20),
            },
            Arc::clone(&orchestrator),
        )
        .unwrap();
        assert_eq!(pool.size(), 2);

        let deadline = Instant::now() + Duration::from_secs(20);
        let ready = |id: &str| db.states.get(id).unwrap().status == AnalysisStatus::Ready;
        while !(ready(&first) && ready(&second)) {
            assert!(Instant::now() < deadline, "workers did not finish in time");
            thread::sleep(Duration::from_millis(20));
        }
        pool.shutdown();
        assert_eq!(pool.size(), 0);

        for job_id in [first_job, second_job] {
            let job = db.jobs.get_job(&job_id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.attempts, 1);
        }
    }
}
