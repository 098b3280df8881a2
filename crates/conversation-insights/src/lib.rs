pub mod analysis_db;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod shared_state;
pub mod telemetry;
pub mod utils;
pub mod worker_pool;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

// Public API exports
pub use analysis_db::{AnalysisDatabase, AnalysisStatus, Strategy};
pub use config::{AnalysisConfig, Config};
pub use error::{AnalysisError, AnalysisResult};
pub use pipeline::{
    AnalysisOrchestrator, AnalysisRequestOutcome, AnalysisStatusView, JobOutcome, JobReport, StalenessReport,
    UnderstandView,
};
pub use providers::{EmbeddingProvider, LlmClient, TextGenerator};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

#[cfg(feature = "cli")]
pub use server::{build_router, run_server};
