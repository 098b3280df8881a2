//! Themes and similarity groups of the latest successful run.
use crate::analysis_db::schema::*;
use crate::analysis_db::job_store::{assert_claim_with_conn, complete_with_conn, ClaimedJob};
use crate::analysis_db::state_store::mark_ready_with_conn;
use crate::analysis_db::{now_rfc3339, DbPool};
use crate::error::{AnalysisError, AnalysisResult};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

/// Everything a run produces after placements are written.
#[derive(Debug, Clone, Default)]
pub struct RunResults {
    pub themes: Vec<Theme>,
    pub groups: Vec<SimilarityGroup>,
    pub analyzed_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMemberPage {
    pub items: Vec<GroupMember>,
    pub total: u64,
    pub next_offset: Option<u64>,
}

pub struct ResultStore {
    pool: DbPool,
}

impl ResultStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Replace themes and groups, mark the conversation ready and the job
    /// succeeded, all in one transaction owned by `claim`.
    pub fn commit_run(&self, claim: &ClaimedJob, results: &RunResults) -> AnalysisResult<()> {
        let conversation_id = claim.conversation_id();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assert_claim_with_conn(&tx, claim)?;

        tx.execute("DELETE FROM themes WHERE conversation_id = ?1", [conversation_id])?;
        tx.execute("DELETE FROM similarity_groups WHERE conversation_id = ?1", [conversation_id])?;

        let now = now_rfc3339();
        {
            let mut insert_theme = tx.prepare(
                "INSERT INTO themes (conversation_id, cluster_index, name, description, size, avg_cohesion, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for theme in &results.themes {
                insert_theme.execute(params![
                    conversation_id,
                    theme.cluster_index,
                    &theme.name,
                    &theme.description,
                    theme.size as i64,
                    theme.avg_cohesion as f64,
                    &now,
                ])?;
            }

            let mut insert_group = tx.prepare(
                "INSERT INTO similarity_groups
                     (id, conversation_id, cluster_index, representative_response_id,
                      consolidated_statement, combined_text, member_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut insert_member = tx.prepare(
                "INSERT INTO similarity_group_members (group_id, response_id, position) VALUES (?1, ?2, ?3)",
            )?;
            for group in &results.groups {
                insert_group.execute(params![
                    &group.id,
                    conversation_id,
                    group.cluster_index,
                    &group.representative_response_id,
                    &group.consolidated_statement,
                    &group.combined_text,
                    group.member_ids.len() as i64,
                    &now,
                ])?;
                for (position, member_id) in group.member_ids.iter().enumerate() {
                    insert_member.execute(params![&group.id, member_id, position as i64])?;
                }
            }
        }

        mark_ready_with_conn(&tx, conversation_id, results.analyzed_count)?;
        complete_with_conn(&tx, claim)?;
        tx.commit()?;

        info!(
            "Committed run for conversation {}: {} themes, {} similarity groups",
            conversation_id,
            results.themes.len(),
            results.groups.len()
        );
        Ok(())
    }

    /// Themes ordered by descending size.
    pub fn list_themes(&self, conversation_id: &str) -> AnalysisResult<Vec<Theme>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT cluster_index, name, description, size, avg_cohesion FROM themes
             WHERE conversation_id = ?1 ORDER BY size DESC, cluster_index",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let size: i64 = row.get(3)?;
            let cohesion: f64 = row.get(4)?;
            Ok(Theme {
                cluster_index: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                size: size.max(0) as usize,
                avg_cohesion: cohesion as f32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_groups(&self, conversation_id: &str) -> AnalysisResult<Vec<SimilarityGroup>> {
        let conn = self.pool.get()?;

        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT m.group_id, m.response_id FROM similarity_group_members m
                 JOIN similarity_groups g ON g.id = m.group_id
                 WHERE g.conversation_id = ?1 ORDER BY m.group_id, m.position",
            )?;
            let rows = stmt.query_map([conversation_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (group_id, response_id) = row?;
                members.entry(group_id).or_default().push(response_id);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, cluster_index, representative_response_id, consolidated_statement, combined_text
             FROM similarity_groups WHERE conversation_id = ?1
             ORDER BY cluster_index, member_count DESC, id",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(SimilarityGroup {
                id: row.get(0)?,
                cluster_index: row.get(1)?,
                representative_response_id: row.get(2)?,
                member_ids: Vec::new(),
                consolidated_statement: row.get(3)?,
                combined_text: row.get(4)?,
            })
        })?;

        let mut groups = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        for group in &mut groups {
            group.member_ids = members.remove(&group.id).unwrap_or_default();
        }
        Ok(groups)
    }

    /// One page of member texts; `limit` must already be clamped by the caller.
    pub fn group_members(&self, group_id: &str, offset: u64, limit: u64) -> AnalysisResult<GroupMemberPage> {
        let conn = self.pool.get()?;
        let total: Option<i64> = conn
            .query_row(
                "SELECT member_count FROM similarity_groups WHERE id = ?1",
                [group_id],
                |row| row.get(0),
            )
            .optional()?;
        let total = match total {
            Some(total) => total.max(0) as u64,
            None => return Err(AnalysisError::not_found(format!("Unknown similarity group {}", group_id))),
        };

        let mut stmt = conn.prepare(
            "SELECT r.id, r.text FROM similarity_group_members m
             JOIN responses r ON r.id = m.response_id
             WHERE m.group_id = ?1 ORDER BY m.position LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![group_id, limit as i64, offset as i64], |row| {
            Ok(GroupMember {
                id: row.get(0)?,
                text: row.get(1)?,
            })
        })?;
        let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let end = offset + items.len() as u64;
        let next_offset = if end < total { Some(end) } else { None };
        Ok(GroupMemberPage { items, total, next_offset })
    }
}
