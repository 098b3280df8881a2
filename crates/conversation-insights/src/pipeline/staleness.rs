//! Staleness tracking: how far the stored analysis lags behind the responses.
use serde::Serialize;

use crate::analysis_db::{AnalysisStatus, ConversationAnalysisState, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StalenessReport {
    pub response_count: u64,
    pub analyzed_response_count: u64,
    pub new_responses_since_analysis: u64,
    pub is_stale: bool,
}

pub fn assess(state: &ConversationAnalysisState, current_count: u64) -> StalenessReport {
    let analyzed = state.analyzed_response_count;
    StalenessReport {
        response_count: current_count,
        analyzed_response_count: analyzed,
        new_responses_since_analysis: current_count.saturating_sub(analyzed),
        is_stale: state.status == AnalysisStatus::Ready && analyzed < current_count,
    }
}

/// `full` without a prior successful run or when the unanalyzed share exceeds
/// `full_ratio`; `incremental` otherwise.
pub fn choose_strategy(state: &ConversationAnalysisState, current_count: u64, full_ratio: f64) -> Strategy {
    if !state.has_successful_run() || current_count == 0 {
        return Strategy::Full;
    }
    let new = current_count.saturating_sub(state.analyzed_response_count);
    if new as f64 / current_count as f64 > full_ratio {
        Strategy::Full
    } else {
        Strategy::Incremental
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(status: AnalysisStatus, analyzed: u64, analyzed_before: bool) -> ConversationAnalysisState {
        ConversationAnalysisState {
            conversation_id: "c".into(),
            status,
            error: None,
            analyzed_response_count: analyzed,
            last_analyzed_at: analyzed_before.then(Utc::now),
        }
    }

    #[test]
    fn five_new_responses_after_fifty_is_stale() {
        let report = assess(&state(AnalysisStatus::Ready, 50, true), 55);
        assert!(report.is_stale);
        assert_eq!(report.new_responses_since_analysis, 5);
        assert_eq!(report.response_count, 55);
    }

    #[test]
    fn only_ready_conversations_are_stale() {
        assert!(!assess(&state(AnalysisStatus::Analyzing, 50, true), 55).is_stale);
        assert!(!assess(&state(AnalysisStatus::Error, 50, true), 55).is_stale);
        assert!(!assess(&state(AnalysisStatus::Ready, 55, true), 55).is_stale);
    }

    #[test]
    fn new_count_never_goes_negative() {
        let report = assess(&state(AnalysisStatus::Ready, 60, true), 55);
        assert_eq!(report.new_responses_since_analysis, 0);
        assert!(!report.is_stale);
    }

    #[test]
    fn strategy_follows_the_unanalyzed_share() {
        assert_eq!(choose_strategy(&state(AnalysisStatus::NotStarted, 0, false), 10, 0.5), Strategy::Full);
        assert_eq!(choose_strategy(&state(AnalysisStatus::Ready, 50, true), 55, 0.5), Strategy::Incremental);
        assert_eq!(choose_strategy(&state(AnalysisStatus::Ready, 10, true), 55, 0.5), Strategy::Full);
        assert_eq!(choose_strategy(&state(AnalysisStatus::Error, 50, true), 55, 0.5), Strategy::Incremental);
    }
}
