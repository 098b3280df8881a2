//! State shared by every HTTP handler.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::analysis_db::AnalysisDatabase;
use crate::config::Config;
use crate::pipeline::AnalysisOrchestrator;

/// Lock-free request counters reported by the stats endpoint.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub analysis_requests: AtomicUsize,
    pub responses_ingested: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub total_requests: usize,
    pub analysis_requests: usize,
    pub responses_ingested: usize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_analysis_requests(&self) -> usize {
        self.analysis_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_responses_ingested(&self, n: usize) -> usize {
        self.responses_ingested.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            analysis_requests: self.analysis_requests.load(Ordering::Relaxed),
            responses_ingested: self.responses_ingested.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AnalysisOrchestrator>,
    pub config: Arc<Config>,
    pub counters: Arc<AtomicCounters>,
}

impl AppState {
    pub fn new(orchestrator: Arc<AnalysisOrchestrator>, config: Config) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            counters: Arc::new(AtomicCounters::new()),
        }
    }

    pub fn database(&self) -> &AnalysisDatabase {
        self.orchestrator.database()
    }
}
