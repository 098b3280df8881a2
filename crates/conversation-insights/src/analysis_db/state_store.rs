//! Conversation-level analysis status, the row pollers read.
use crate::analysis_db::schema::*;
use crate::analysis_db::job_store::{assert_claim_with_conn, ClaimedJob};
use crate::analysis_db::{now_rfc3339, DbPool};
use crate::error::AnalysisResult;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

pub struct AnalysisStateStore {
    pool: DbPool,
}

impl AnalysisStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Current state, or `not_started` when no run was ever requested.
    pub fn get(&self, conversation_id: &str) -> AnalysisResult<ConversationAnalysisState> {
        let conn = self.pool.get()?;
        get_with_conn(&conn, conversation_id)
    }

    /// Stage-boundary transition made by the worker holding `claim`.
    pub fn advance(&self, claim: &ClaimedJob, status: AnalysisStatus) -> AnalysisResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assert_claim_with_conn(&tx, claim)?;
        set_status_with_conn(&tx, claim.conversation_id(), status, None)?;
        tx.commit()?;
        debug!("Conversation {} is now {}", claim.conversation_id(), status);
        Ok(())
    }
}

pub(crate) fn get_with_conn(conn: &Connection, conversation_id: &str) -> AnalysisResult<ConversationAnalysisState> {
    let state = conn
        .query_row(
            "SELECT status, error, analyzed_response_count, last_analyzed_at
             FROM conversation_analysis WHERE conversation_id = ?1",
            [conversation_id],
            |row| {
                let analyzed: i64 = row.get(2)?;
                let last_analyzed_at = match row.get::<_, Option<String>>(3)? {
                    Some(raw) => Some(parse_timestamp(3, &raw)?),
                    None => None,
                };
                Ok(ConversationAnalysisState {
                    conversation_id: conversation_id.to_string(),
                    status: row.get(0)?,
                    error: row.get(1)?,
                    analyzed_response_count: analyzed.max(0) as u64,
                    last_analyzed_at,
                })
            },
        )
        .optional()?;
    Ok(state.unwrap_or_else(|| ConversationAnalysisState::not_started(conversation_id)))
}

/// Upsert status and error; the analyzed snapshot is left untouched.
pub(crate) fn set_status_with_conn(
    conn: &Connection,
    conversation_id: &str,
    status: AnalysisStatus,
    error: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO conversation_analysis (conversation_id, status, error, analyzed_response_count, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4)
         ON CONFLICT(conversation_id) DO UPDATE SET
             status = excluded.status,
             error = excluded.error,
             updated_at = excluded.updated_at",
        params![conversation_id, status, error, now_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn mark_ready_with_conn(conn: &Connection, conversation_id: &str, analyzed_count: u64) -> rusqlite::Result<()> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO conversation_analysis
             (conversation_id, status, error, analyzed_response_count, last_analyzed_at, updated_at)
         VALUES (?1, 'ready', NULL, ?2, ?3, ?3)
         ON CONFLICT(conversation_id) DO UPDATE SET
             status = 'ready',
             error = NULL,
             analyzed_response_count = excluded.analyzed_response_count,
             last_analyzed_at = excluded.last_analyzed_at,
             updated_at = excluded.updated_at",
        params![conversation_id, analyzed_count as i64, &now],
    )?;
    Ok(())
}
