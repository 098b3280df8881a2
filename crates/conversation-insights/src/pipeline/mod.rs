//! The analysis pipeline: stages, the staleness policy and the orchestrator
//! that sequences them per job.

pub mod vector_math;
pub mod embedding;
pub mod projection;
pub mod clustering;
pub mod similarity;
pub mod consolidation;
pub mod labeling;
pub mod lock_keeper;
pub mod staleness;
pub mod orchestrator;

pub use orchestrator::{
    AnalysisOrchestrator, AnalysisRequestOutcome, AnalysisStatusView, GroupSummary, JobOutcome, JobReport,
    ResponseView, UnderstandView,
};
pub use staleness::StalenessReport;
