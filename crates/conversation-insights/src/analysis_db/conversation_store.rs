//! Conversations and their responses, including the per-stage columns
//! (embedding, coordinates, cluster index, outlier flag).
use crate::analysis_db::schema::*;
use crate::analysis_db::job_store::{assert_claim_with_conn, ClaimedJob};
use crate::analysis_db::{now_rfc3339, DbPool};
use crate::error::{AnalysisError, AnalysisResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

/// Text awaiting an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingText {
    pub id: String,
    pub text: String,
}

/// Stage record handed to projection, clustering and grouping.
#[derive(Debug, Clone)]
pub struct EmbeddedResponse {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> AnalysisResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn create_conversation(&self, title: &str) -> AnalysisResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AnalysisError::validation("Conversation title cannot be empty"));
        }
        let conn = self.get_conn()?;
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![&conversation.id, &conversation.title, conversation.created_at.to_rfc3339()],
        )?;
        info!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> AnalysisResult<Option<Conversation>> {
        let conn = self.get_conn()?;
        let conversation = conn
            .query_row(
                "SELECT id, title, created_at FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| {
                    let created_at: String = row.get(2)?;
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: parse_timestamp(2, &created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(conversation)
    }

    /// Fails with a validation error when the conversation does not exist.
    pub fn ensure_conversation(&self, conversation_id: &str) -> AnalysisResult<()> {
        let conn = self.get_conn()?;
        ensure_conversation_with_conn(&conn, conversation_id)
    }

    /// Import responses; returns the new ids in input order.
    pub fn add_responses(&self, conversation_id: &str, responses: &[NewResponse]) -> AnalysisResult<Vec<String>> {
        if let Some(pos) = responses.iter().position(|r| r.text.trim().is_empty()) {
            return Err(AnalysisError::validation(format!("Response #{} has empty text", pos)));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_conversation_with_conn(&tx, conversation_id)?;

        let next_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM responses WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let now = now_rfc3339();
        let mut ids = Vec::with_capacity(responses.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO responses (id, conversation_id, position, text, tag, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (offset, response) in responses.iter().enumerate() {
                let id = Uuid::new_v4().to_string();
                stmt.execute(params![
                    &id,
                    conversation_id,
                    next_position + offset as i64,
                    response.text.trim(),
                    response.tag.as_deref(),
                    &now,
                ])?;
                ids.push(id);
            }
        }
        tx.commit()?;

        debug!("Stored {} responses for conversation {}", ids.len(), conversation_id);
        Ok(ids)
    }

    pub fn count_responses(&self, conversation_id: &str) -> AnalysisResult<u64> {
        let conn = self.get_conn()?;
        Ok(count_responses_with_conn(&conn, conversation_id)?)
    }

    pub fn list_responses(&self, conversation_id: &str) -> AnalysisResult<Vec<StoredResponse>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, text, tag, embedding, x, y, cluster_index, is_outlier, created_at
             FROM responses WHERE conversation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([conversation_id], row_to_response)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Texts the Embedding stage must cover: everything for a full run, only
    /// unembedded responses for an incremental one.
    pub fn texts_for_embedding(&self, conversation_id: &str, strategy: Strategy) -> AnalysisResult<Vec<PendingText>> {
        let conn = self.get_conn()?;
        let sql = match strategy {
            Strategy::Full => {
                "SELECT id, text FROM responses WHERE conversation_id = ?1 ORDER BY position"
            }
            Strategy::Incremental => {
                "SELECT id, text FROM responses
                 WHERE conversation_id = ?1 AND embedding IS NULL ORDER BY position"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(PendingText {
                id: row.get(0)?,
                text: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Idempotent per-id upsert of one successful embedding batch.
    pub fn store_embeddings(
        &self,
        claim: &ClaimedJob,
        model: &str,
        embeddings: &[(String, Vec<f32>)],
    ) -> AnalysisResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assert_claim_with_conn(&tx, claim)?;
        {
            let mut stmt = tx.prepare(
                "UPDATE responses SET embedding = ?1, embedding_model = ?2
                 WHERE id = ?3 AND conversation_id = ?4",
            )?;
            for (response_id, embedding) in embeddings {
                let bytes = encode_embedding(embedding)?;
                let updated = stmt.execute(params![bytes, model, response_id, &claim.job.conversation_id])?;
                if updated != 1 {
                    return Err(AnalysisError::persistence(format!(
                        "Response {} vanished while storing its embedding",
                        response_id
                    )));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All responses of the conversation that carry an embedding, in import order.
    pub fn embedded_responses(&self, conversation_id: &str) -> AnalysisResult<Vec<EmbeddedResponse>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, embedding FROM responses
             WHERE conversation_id = ?1 AND embedding IS NOT NULL ORDER BY position",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let bytes: Vec<u8> = row.get(2)?;
            Ok(EmbeddedResponse {
                id: row.get(0)?,
                text: row.get(1)?,
                embedding: decode_embedding(2, &bytes)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Replace coordinates, cluster indices and outlier flags for the whole
    /// conversation in one transaction. Responses absent from `placements`
    /// are reset to null.
    pub fn apply_placements(&self, claim: &ClaimedJob, placements: &[ResponsePlacement]) -> AnalysisResult<()> {
        let conversation_id = &claim.job.conversation_id;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assert_claim_with_conn(&tx, claim)?;
        tx.execute(
            "UPDATE responses SET x = NULL, y = NULL, cluster_index = NULL, is_outlier = FALSE
             WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "UPDATE responses SET x = ?1, y = ?2, cluster_index = ?3, is_outlier = ?4
                 WHERE id = ?5 AND conversation_id = ?6",
            )?;
            for placement in placements {
                stmt.execute(params![
                    placement.x as f64,
                    placement.y as f64,
                    placement.cluster_index,
                    placement.is_outlier,
                    &placement.response_id,
                    conversation_id,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Applied {} placements for conversation {}", placements.len(), conversation_id);
        Ok(())
    }
}

pub(crate) fn ensure_conversation_with_conn(conn: &Connection, conversation_id: &str) -> AnalysisResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM conversations WHERE id = ?1", [conversation_id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(AnalysisError::not_found(format!("Unknown conversation {}", conversation_id)))
    }
}

pub(crate) fn count_responses_with_conn(conn: &Connection, conversation_id: &str) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM responses WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn row_to_response(row: &Row) -> rusqlite::Result<StoredResponse> {
    let embedding = match row.get::<_, Option<Vec<u8>>>(4)? {
        Some(bytes) => Some(decode_embedding(4, &bytes)?),
        None => None,
    };
    let created_at: String = row.get(9)?;
    Ok(StoredResponse {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        text: row.get(2)?,
        tag: row.get(3)?,
        embedding,
        x: row.get::<_, Option<f64>>(5)?.map(|v| v as f32),
        y: row.get::<_, Option<f64>>(6)?.map(|v| v as f32),
        cluster_index: row.get(7)?,
        is_outlier: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::analysis_db::AnalysisDatabase;
    use crate::analysis_db::schema::*;
    use crate::test_support::{claim_job_for, seed_conversation};

    #[test]
    fn add_responses_rejects_empty_text_and_unknown_conversation() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let conversation = db.conversations.create_conversation("Parks").unwrap();

        let err = db
            .conversations
            .add_responses(&conversation.id, &[NewResponse { text: "  ".into(), tag: None }])
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = db
            .conversations
            .add_responses("missing", &[NewResponse { text: "hello".into(), tag: None }])
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn incremental_selection_skips_embedded_responses() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, ids) = seed_conversation(&db, &["more trees", "more benches", "fewer cars"]);
        let claim = claim_job_for(&db, &conversation_id, Strategy::Full);

        db.conversations
            .store_embeddings(&claim, "test-model", &[(ids[0].clone(), vec![1.0, 0.0])])
            .unwrap();

        let incremental = db.conversations.texts_for_embedding(&conversation_id, Strategy::Incremental).unwrap();
        assert_eq!(incremental.len(), 2);
        assert!(incremental.iter().all(|p| p.id != ids[0]));

        let full = db.conversations.texts_for_embedding(&conversation_id, Strategy::Full).unwrap();
        assert_eq!(full.len(), 3);

        let embedded = db.conversations.embedded_responses(&conversation_id).unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn placements_reset_responses_not_in_the_run() {
        let db = AnalysisDatabase::new_in_memory().unwrap();
        let (conversation_id, ids) = seed_conversation(&db, &["a", "b"]);
        let claim = claim_job_for(&db, &conversation_id, Strategy::Full);

        let first = vec![
            ResponsePlacement { response_id: ids[0].clone(), x: 0.5, y: -0.5, cluster_index: 0, is_outlier: false },
            ResponsePlacement { response_id: ids[1].clone(), x: 0.1, y: 0.2, cluster_index: 1, is_outlier: true },
        ];
        db.conversations.apply_placements(&claim, &first).unwrap();
        db.conversations.apply_placements(&claim, &first[..1]).unwrap();

        let responses = db.conversations.list_responses(&conversation_id).unwrap();
        assert_eq!(responses[0].cluster_index, Some(0));
        assert_eq!(responses[0].x, Some(0.5));
        assert_eq!(responses[1].cluster_index, None);
        assert_eq!(responses[1].x, None);
        assert!(!responses[1].is_outlier);
    }
}
