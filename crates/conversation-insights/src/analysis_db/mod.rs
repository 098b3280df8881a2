//! Analysis database module - SQLite-based storage for responses, the job queue,
//! conversation analysis status, and per-run themes and similarity groups.
pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod job_store;
pub mod state_store;
pub mod result_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use conversation_store::{ConversationStore, EmbeddedResponse, PendingText};
pub use job_store::{ClaimedJob, EnqueueOutcome, FailureOutcome, JobStore};
pub use state_store::AnalysisStateStore;
pub use result_store::{GroupMember, GroupMemberPage, ResultStore, RunResults};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::AnalysisResult;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

pub struct AnalysisDatabase {
    pub conversations: ConversationStore,
    pub jobs: JobStore,
    pub states: AnalysisStateStore,
    pub results: ResultStore,
    pool: DbPool,
}

impl AnalysisDatabase {
    /// Open (or create) a file-backed database and apply pending migrations.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening analysis database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        info!("Analysis database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// In-memory database for tests and ephemeral runs.
    ///
    /// The pool holds a single connection so every checkout sees the same
    /// database; callers must never hold a connection while requesting another.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            jobs: JobStore::new(Arc::clone(&pool)),
            states: AnalysisStateStore::new(Arc::clone(&pool)),
            results: ResultStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> AnalysisResult<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for AnalysisDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{add_texts, claim_job_for, seed_conversation};

    #[test]
    fn claim_checked_writes_do_not_fail_under_heartbeat_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let db = AnalysisDatabase::new(&dir.path().join("insights.db")).unwrap();
        let (conversation_id, ids) = seed_conversation(&db, &["one", "two", "three"]);
        let (other_conversation, _) = seed_conversation(&db, &[]);
        let claim = claim_job_for(&db, &conversation_id, Strategy::Full);

        let embeddings: Vec<(String, Vec<f32>)> = ids.iter().map(|id| (id.clone(), vec![1.0, 0.5])).collect();
        let placements: Vec<ResponsePlacement> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| ResponsePlacement {
                response_id: id.clone(),
                x: i as f32,
                y: 0.0,
                cluster_index: 0,
                is_outlier: false,
            })
            .collect();

        std::thread::scope(|scope| {
            let heartbeats = scope.spawn(|| {
                for _ in 0..300 {
                    db.jobs.heartbeat(&claim).unwrap();
                }
            });
            for round in 0..60 {
                let status = if round % 2 == 0 {
                    AnalysisStatus::Embedding
                } else {
                    AnalysisStatus::Analyzing
                };
                db.states.advance(&claim, status).unwrap();
                db.conversations.store_embeddings(&claim, "fake", &embeddings).unwrap();
                db.conversations.apply_placements(&claim, &placements).unwrap();
                add_texts(&db, &other_conversation, &["more"]);
            }
            heartbeats.join().unwrap();
        });

        assert_eq!(db.conversations.count_responses(&other_conversation).unwrap(), 60);
        assert_eq!(db.conversations.embedded_responses(&conversation_id).unwrap().len(), 3);
    }
}
