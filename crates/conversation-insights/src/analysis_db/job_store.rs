//! Durable analysis job queue.
//!
//! Claiming is a compare-and-swap on the job row inside an IMMEDIATE
//! transaction, so two workers (threads or processes sharing the database
//! file) can never both move the same job to `running`. A running job whose
//! heartbeat is older than the lock timeout may be reclaimed; every claim
//! counts as one attempt.
use crate::analysis_db::schema::*;
use crate::analysis_db::conversation_store::ensure_conversation_with_conn;
use crate::analysis_db::state_store::set_status_with_conn;
use crate::analysis_db::{now_millis, now_rfc3339, DbPool};
use crate::error::{AnalysisError, AnalysisResult};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A job this process currently holds, plus the lock owner it holds it as.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: AnalysisJob,
    pub owner: String,
    /// The job was taken over from a worker whose lock went stale.
    pub reclaimed: bool,
}

impl ClaimedJob {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.job.conversation_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(String),
    /// A queued or running job already exists for the conversation.
    Existing(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued,
    Failed,
}

const JOB_COLUMNS: &str = "id, conversation_id, status, strategy, attempts, lock_owner, \
                           lock_heartbeat_ms, last_error, created_at, updated_at";

pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> AnalysisResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Queue a run for the conversation unless one is already in flight.
    ///
    /// A new job resets the conversation status to `embedding` and clears the
    /// previous error.
    pub fn enqueue(&self, conversation_id: &str, strategy: Strategy) -> AnalysisResult<EnqueueOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_conversation_with_conn(&tx, conversation_id)?;

        if let Some(existing) = active_job_with_conn(&tx, conversation_id)? {
            debug!("Conversation {} already has job {} in flight", conversation_id, existing.id);
            return Ok(EnqueueOutcome::Existing(existing.id));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO analysis_jobs (id, conversation_id, status, strategy, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![&id, conversation_id, JobStatus::Queued, strategy, &now],
        )?;
        set_status_with_conn(&tx, conversation_id, AnalysisStatus::Embedding, None)?;
        tx.commit()?;

        info!("Queued {} analysis job {} for conversation {}", strategy, id, conversation_id);
        Ok(EnqueueOutcome::Created(id))
    }

    /// Atomically take the oldest claimable job, or `None` when the queue is idle.
    pub fn claim(&self, owner: &str, lock_timeout: Duration, max_attempts: u32) -> AnalysisResult<Option<ClaimedJob>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let stale_before = now - lock_timeout.as_millis() as i64;

        expire_exhausted_with_conn(&tx, stale_before, max_attempts)?;

        let candidate = tx
            .query_row(
                "SELECT id, status FROM analysis_jobs
                 WHERE status = 'queued' OR (status = 'running' AND lock_heartbeat_ms < ?1)
                 ORDER BY created_at, rowid LIMIT 1",
                [stale_before],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, JobStatus>(1)?)),
            )
            .optional()?;
        let Some((job_id, previous_status)) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE analysis_jobs
             SET status = 'running', lock_owner = ?1, lock_heartbeat_ms = ?2,
                 attempts = attempts + 1, updated_at = ?3
             WHERE id = ?4 AND (status = 'queued' OR (status = 'running' AND lock_heartbeat_ms < ?5))",
            params![owner, now, now_rfc3339(), &job_id, stale_before],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let job = get_job_with_conn(&tx, &job_id)?
            .ok_or_else(|| AnalysisError::persistence(format!("Claimed job {} disappeared", job_id)))?;
        tx.commit()?;

        let reclaimed = previous_status == JobStatus::Running;
        if reclaimed {
            warn!("Worker {} reclaimed stale job {} (attempt {})", owner, job.id, job.attempts);
        } else {
            info!("Worker {} claimed job {} (attempt {})", owner, job.id, job.attempts);
        }
        Ok(Some(ClaimedJob {
            job,
            owner: owner.to_string(),
            reclaimed,
        }))
    }

    /// Refresh the lock timestamp. A lost claim surfaces as a ConcurrencyError.
    pub fn heartbeat(&self, claim: &ClaimedJob) -> AnalysisResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE analysis_jobs SET lock_heartbeat_ms = ?1
             WHERE id = ?2 AND lock_owner = ?3 AND status = 'running'",
            params![now_millis(), claim.job_id(), &claim.owner],
        )?;
        if changed == 0 {
            return Err(lost_claim(claim));
        }
        Ok(())
    }

    /// Record a failed attempt: requeue below the ceiling, otherwise fail the
    /// job permanently and put the conversation into `error`.
    pub fn fail(&self, claim: &ClaimedJob, message: &str, max_attempts: u32) -> AnalysisResult<FailureOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assert_claim_with_conn(&tx, claim)?;

        let attempts: u32 = tx.query_row(
            "SELECT attempts FROM analysis_jobs WHERE id = ?1",
            [claim.job_id()],
            |row| row.get(0),
        )?;
        let outcome = if attempts >= max_attempts {
            FailureOutcome::Failed
        } else {
            FailureOutcome::Requeued
        };
        let next_status = match outcome {
            FailureOutcome::Failed => JobStatus::Failed,
            FailureOutcome::Requeued => JobStatus::Queued,
        };
        tx.execute(
            "UPDATE analysis_jobs
             SET status = ?1, last_error = ?2, lock_owner = NULL, lock_heartbeat_ms = NULL, updated_at = ?3
             WHERE id = ?4",
            params![next_status, message, now_rfc3339(), claim.job_id()],
        )?;
        if outcome == FailureOutcome::Failed {
            set_status_with_conn(&tx, claim.conversation_id(), AnalysisStatus::Error, Some(message))?;
        }
        tx.commit()?;

        match outcome {
            FailureOutcome::Failed => warn!(
                "Job {} failed permanently after {} attempts: {}",
                claim.job_id(), attempts, message
            ),
            FailureOutcome::Requeued => info!(
                "Job {} requeued after attempt {}/{}: {}",
                claim.job_id(), attempts, max_attempts, message
            ),
        }
        Ok(outcome)
    }

    pub fn get_job(&self, job_id: &str) -> AnalysisResult<Option<AnalysisJob>> {
        let conn = self.get_conn()?;
        get_job_with_conn(&conn, job_id)
    }

    /// The queued or running job for a conversation, if any.
    pub fn active_job(&self, conversation_id: &str) -> AnalysisResult<Option<AnalysisJob>> {
        let conn = self.get_conn()?;
        active_job_with_conn(&conn, conversation_id)
    }

    pub fn count_jobs(&self, conversation_id: &str) -> AnalysisResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_jobs WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// Verify, inside the caller's transaction, that `claim` still owns its job.
pub(crate) fn assert_claim_with_conn(conn: &Connection, claim: &ClaimedJob) -> AnalysisResult<()> {
    let owned = conn
        .query_row(
            "SELECT 1 FROM analysis_jobs WHERE id = ?1 AND lock_owner = ?2 AND status = 'running'",
            params![claim.job_id(), &claim.owner],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if owned {
        Ok(())
    } else {
        Err(lost_claim(claim))
    }
}

pub(crate) fn complete_with_conn(conn: &Connection, claim: &ClaimedJob) -> AnalysisResult<()> {
    let changed = conn.execute(
        "UPDATE analysis_jobs
         SET status = 'succeeded', lock_owner = NULL, lock_heartbeat_ms = NULL, last_error = NULL, updated_at = ?1
         WHERE id = ?2 AND lock_owner = ?3 AND status = 'running'",
        params![now_rfc3339(), claim.job_id(), &claim.owner],
    )?;
    if changed == 0 {
        return Err(lost_claim(claim));
    }
    Ok(())
}

fn expire_exhausted_with_conn(conn: &Connection, stale_before: i64, max_attempts: u32) -> AnalysisResult<()> {
    let exhausted: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id FROM analysis_jobs
             WHERE status = 'running' AND lock_heartbeat_ms < ?1 AND attempts >= ?2",
        )?;
        let rows = stmt.query_map(params![stale_before, max_attempts], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (job_id, conversation_id) in exhausted {
        let message = format!("Worker lock expired and the job used all {} attempts", max_attempts);
        conn.execute(
            "UPDATE analysis_jobs
             SET status = 'failed', last_error = ?1, lock_owner = NULL, lock_heartbeat_ms = NULL, updated_at = ?2
             WHERE id = ?3",
            params![&message, now_rfc3339(), &job_id],
        )?;
        set_status_with_conn(conn, &conversation_id, AnalysisStatus::Error, Some(&message))?;
        warn!("Expired stale job {} for conversation {}", job_id, conversation_id);
    }
    Ok(())
}

fn active_job_with_conn(conn: &Connection, conversation_id: &str) -> AnalysisResult<Option<AnalysisJob>> {
    let sql = format!(
        "SELECT {} FROM analysis_jobs WHERE conversation_id = ?1 AND status IN ('queued', 'running')",
        JOB_COLUMNS
    );
    Ok(conn.query_row(&sql, [conversation_id], row_to_job).optional()?)
}

fn get_job_with_conn(conn: &Connection, job_id: &str) -> AnalysisResult<Option<AnalysisJob>> {
    let sql = format!("SELECT {} FROM analysis_jobs WHERE id = ?1", JOB_COLUMNS);
    Ok(conn.query_row(&sql, [job_id], row_to_job).optional()?)
}

fn row_to_job(row: &Row) -> rusqlite::Result<AnalysisJob> {
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(AnalysisJob {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        status: row.get(2)?,
        strategy: row.get(3)?,
        attempts: row.get(4)?,
        lock_owner: row.get(5)?,
        lock_heartbeat_ms: row.get(6)?,
        last_error: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
        updated_at: parse_timestamp(9, &updated_at)?,
    })
}

fn lost_claim(claim: &ClaimedJob) -> AnalysisError {
    AnalysisError::concurrency(format!(
        "Worker {} no longer holds job {}",
        claim.owner,
        claim.job_id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_db::AnalysisDatabase;
    use crate::test_support::seed_conversation;

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[test]
    fn duplicate_enqueue_returns_existing_job() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, _) = seed_conversation(&db, &["one", "two"]);

        let first = db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();
        let second = db.jobs.enqueue(&conversation_id, Strategy::Incremental).unwrap();

        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert_eq!(second, EnqueueOutcome::Existing(first.job_id().to_string()));
        assert_eq!(db.jobs.count_jobs(&conversation_id).unwrap(), 1);
        assert_eq!(db.states.get(&conversation_id).unwrap().status, AnalysisStatus::Embedding);
    }

    #[test]
    fn enqueue_rejects_unknown_conversation() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let err = db.jobs.enqueue("nope", Strategy::Full).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn a_claimed_job_is_not_claimed_twice() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, _) = seed_conversation(&db, &["one"]);
        db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();

        let claim = db.jobs.claim("worker-a", TIMEOUT, 3).unwrap().unwrap();
        assert_eq!(claim.job.status, JobStatus::Running);
        assert_eq!(claim.job.attempts, 1);
        assert!(!claim.reclaimed);
        assert!(db.jobs.claim("worker-b", TIMEOUT, 3).unwrap().is_none());
    }

    #[test]
    fn stale_lock_is_reclaimed_and_old_owner_loses_the_claim() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, _) = seed_conversation(&db, &["one"]);
        db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();

        let original = db.jobs.claim("worker-a", TIMEOUT, 3).unwrap().unwrap();
        // A zero timeout makes any heartbeat older than "now" stale.
        std::thread::sleep(Duration::from_millis(5));
        let taken = db.jobs.claim("worker-b", Duration::ZERO, 3).unwrap().unwrap();

        assert!(taken.reclaimed);
        assert_eq!(taken.job.id, original.job.id);
        assert_eq!(taken.job.attempts, 2);
        assert_eq!(db.jobs.heartbeat(&original).unwrap_err().kind(), "concurrency");
        db.jobs.heartbeat(&taken).unwrap();
    }

    #[test]
    fn stale_job_at_the_attempt_ceiling_is_failed_not_reclaimed() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, _) = seed_conversation(&db, &["one"]);
        let job_id = db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap().job_id().to_string();

        db.jobs.claim("worker-a", TIMEOUT, 1).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(db.jobs.claim("worker-b", Duration::ZERO, 1).unwrap().is_none());

        let job = db.jobs.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let state = db.states.get(&conversation_id).unwrap();
        assert_eq!(state.status, AnalysisStatus::Error);
        assert!(state.error.is_some());
    }

    #[test]
    fn failures_requeue_until_the_ceiling() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, _) = seed_conversation(&db, &["one"]);
        db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();

        let claim = db.jobs.claim("w", TIMEOUT, 2).unwrap().unwrap();
        assert_eq!(db.jobs.fail(&claim, "timeout", 2).unwrap(), FailureOutcome::Requeued);
        assert_eq!(db.states.get(&conversation_id).unwrap().status, AnalysisStatus::Embedding);

        let claim = db.jobs.claim("w", TIMEOUT, 2).unwrap().unwrap();
        assert_eq!(db.jobs.fail(&claim, "timeout again", 2).unwrap(), FailureOutcome::Failed);

        let job = db.jobs.get_job(claim.job_id()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("timeout again"));
        assert!(job.lock_owner.is_none());
        assert_eq!(db.states.get(&conversation_id).unwrap().error.as_deref(), Some("timeout again"));

        // A terminal job no longer blocks a fresh request.
        let next = db.jobs.enqueue(&conversation_id, Strategy::Full).unwrap();
        assert!(matches!(next, EnqueueOutcome::Created(_)));
        assert!(db.states.get(&conversation_id).unwrap().error.is_none());
    }
}
