//! Memory record operations on the SQLite store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use uuid::Uuid;

use super::Database;
use crate::error::{Error, Result, StorageContext};
use crate::hashing::{content_hash, search_text};
use crate::memory::{AccessSink, MemoryStore, MergePlan, Relationship};
use crate::types::{
    dedup_entities, now_ms, AccessUpdate, MemoryQuery, MemoryRecord, MemoryStats, MemoryType,
    NewMemory, QueryOrder,
};

const RECORD_COLUMNS: &str = "id, content, content_hash, memory_type, importance, confidence,
    created_at, updated_at, valid_from, valid_to, accessed_at, access_count, source_type,
    agent_id, user_id, session_id, entities_json, metadata_json, archived_at";

/// Escape LIKE wildcards for a pattern matched with `ESCAPE '\'`.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Database {
    // ─────────────────────────────────────────────────────────────────────────
    // Row Mapping
    // ─────────────────────────────────────────────────────────────────────────

    fn map_record(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
        let memory_type = row
            .get::<_, String>(3)?
            .parse::<MemoryType>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let entities_json: String = row.get(16)?;
        let metadata_json: String = row.get(17)?;

        Ok(MemoryRecord {
            id: row.get(0)?,
            content: row.get(1)?,
            content_hash: row.get(2)?,
            memory_type,
            importance: row.get(4)?,
            confidence: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            valid_from: row.get(8)?,
            valid_to: row.get(9)?,
            accessed_at: row.get(10)?,
            access_count: row.get(11)?,
            source_type: row.get(12)?,
            agent_id: row.get(13)?,
            user_id: row.get(14)?,
            session_id: row.get(15)?,
            entities: serde_json::from_str(&entities_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(16, Type::Text, Box::new(e))
            })?,
            metadata: serde_json::from_str(&metadata_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(17, Type::Text, Box::new(e))
            })?,
            archived_at: row.get(18)?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upsert
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or merge one record on an open transaction.
    fn upsert_in(conn: &Connection, input: NewMemory, now: i64) -> Result<String> {
        let input = input.normalized(now)?;
        let hash = content_hash(&input.content);
        let importance = input.importance.unwrap_or(0.5);
        let confidence = input.confidence.unwrap_or(0.5);

        let existing = conn
            .query_row(
                "SELECT id, archived_at IS NOT NULL FROM memories
                 WHERE content_hash = ?1
                   AND COALESCE(user_id, '') = COALESCE(?2, '')
                   AND COALESCE(agent_id, '') = COALESCE(?3, '')",
                params![hash, input.user_id, input.agent_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()
            .storage("upsert", None)?;

        if let Some((id, archived)) = existing {
            // A record merged away by consolidation feeds its canonical instead
            // of coming back as a duplicate.
            let target = if archived {
                Self::live_canonical(conn, &id)?.unwrap_or(id)
            } else {
                id
            };
            Self::merge_into(conn, &target, &input, importance, confidence, now)?;

            tracing::debug!(memory_id = %target, "Merged duplicate memory into existing record");
            return Ok(target);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO memories
             (id, content, content_hash, memory_type, importance, confidence,
              created_at, updated_at, valid_from, valid_to, accessed_at, access_count,
              source_type, agent_id, user_id, session_id, entities_json, metadata_json,
              search_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?7, 0, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                id,
                input.content,
                hash,
                input.memory_type.as_str(),
                importance,
                confidence,
                now,
                input.valid_from.unwrap_or(now),
                input.valid_to,
                input.source_type,
                input.agent_id,
                input.user_id,
                input.session_id,
                serde_json::to_string(&input.entities)?,
                serde_json::to_string(&input.metadata)?,
                search_text(&input.content),
            ],
        )
        .storage("upsert", Some(id.as_str()))?;
        Self::insert_entities(conn, &id, &input.entities)?;

        Ok(id)
    }

    /// Fold an incoming duplicate into `target`, reviving it if archived.
    /// Access counters are left alone.
    fn merge_into(
        conn: &Connection,
        target: &str,
        input: &NewMemory,
        importance: f64,
        confidence: f64,
        now: i64,
    ) -> Result<()> {
        let (entities_json, metadata_json) = conn
            .query_row(
                "SELECT entities_json, metadata_json FROM memories WHERE id = ?1",
                params![target],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .storage("upsert", Some(target))?;

        let mut entities: Vec<String> = serde_json::from_str(&entities_json)?;
        entities.extend(input.entities.iter().cloned());
        let entities = dedup_entities(entities);

        let mut metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)?;
        metadata.extend(input.metadata.clone());

        conn.execute(
            "UPDATE memories SET
                importance = MAX(importance, ?1),
                confidence = MAX(confidence, ?2),
                valid_to = CASE WHEN valid_to IS NULL OR ?3 IS NULL THEN NULL
                                ELSE MAX(valid_to, ?3) END,
                entities_json = ?4,
                metadata_json = ?5,
                updated_at = ?6,
                archived_at = NULL
             WHERE id = ?7",
            params![
                importance,
                confidence,
                input.valid_to,
                serde_json::to_string(&entities)?,
                serde_json::to_string(&metadata)?,
                now,
                target,
            ],
        )
        .storage("upsert", Some(target))?;
        Self::insert_entities(conn, target, &entities)
    }

    /// Follow MERGED_INTO edges from an archived record to the live record
    /// that absorbed it. `None` when the chain ends without one.
    fn live_canonical(conn: &Connection, id: &str) -> Result<Option<String>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT m.id, m.archived_at IS NOT NULL
                 FROM memory_relationships r JOIN memories m ON m.id = r.to_id
                 WHERE r.from_id = ?1 AND r.kind = ?2
                 ORDER BY r.created_at DESC, r.to_id
                 LIMIT 1",
            )
            .storage("upsert", Some(id))?;

        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
        let mut current = id.to_string();
        loop {
            let next = stmt
                .query_row(params![current, crate::memory::MERGED_INTO], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
                })
                .optional()
                .storage("upsert", Some(current.as_str()))?;

            match next {
                Some((next_id, false)) => return Ok(Some(next_id)),
                Some((next_id, true)) if seen.insert(next_id.clone()) => current = next_id,
                _ => return Ok(None),
            }
        }
    }

    fn insert_entities(conn: &Connection, id: &str, entities: &[String]) -> Result<()> {
        let mut stmt = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO memory_entities (memory_id, entity, entity_key)
                 VALUES (?1, ?2, ?3)",
            )
            .storage("insert_entities", Some(id))?;
        for entity in entities {
            stmt.execute(params![id, entity, search_text(entity)])
                .storage("insert_entities", Some(id))?;
        }
        Ok(())
    }
}

impl AccessSink for Database {
    fn record_access_batch(&self, updates: &[AccessUpdate]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("record_access_batch", None)?;

        let mut touched = 0;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE memories
                     SET access_count = access_count + ?1, accessed_at = MAX(accessed_at, ?2)
                     WHERE id = ?3",
                )
                .storage("record_access_batch", None)?;
            for update in updates.iter().filter(|u| u.count > 0) {
                touched += stmt
                    .execute(params![update.count, update.accessed_at, update.memory_id])
                    .storage("record_access_batch", Some(update.memory_id.as_str()))?;
                tracing::trace!(
                    memory_id = %update.memory_id,
                    count = update.count,
                    context = %update.context,
                    "Recorded access"
                );
            }
        }

        tx.commit().storage("record_access_batch", None)?;
        Ok(touched)
    }
}

impl MemoryStore for Database {
    fn store_path(&self) -> &Path {
        self.path()
    }

    fn upsert(&self, record: NewMemory) -> Result<String> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("upsert", None)?;
        let id = Self::upsert_in(&tx, record, now_ms())?;
        tx.commit().storage("upsert", Some(id.as_str()))?;
        Ok(id)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM memories WHERE id = ?1"))
            .storage("get_by_id", Some(id))?;

        stmt.query_row(params![id], Self::map_record)
            .optional()
            .storage("get_by_id", Some(id))
    }

    fn query(&self, criteria: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM memories WHERE 1=1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref user_id) = criteria.user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(user_id.clone()));
        }

        if let Some(ref agent_id) = criteria.agent_id {
            sql.push_str(" AND agent_id = ?");
            params_vec.push(Box::new(agent_id.clone()));
        }

        if let Some(ref session_id) = criteria.session_id {
            sql.push_str(" AND session_id = ?");
            params_vec.push(Box::new(session_id.clone()));
        }

        if !criteria.memory_types.is_empty() {
            let placeholders: Vec<&str> = criteria.memory_types.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND memory_type IN ({})", placeholders.join(",")));
            for ty in &criteria.memory_types {
                params_vec.push(Box::new(ty.as_str().to_string()));
            }
        }

        if !criteria.entities.is_empty() {
            let placeholders: Vec<&str> = criteria.entities.iter().map(|_| "?").collect();
            sql.push_str(&format!(
                " AND id IN (SELECT memory_id FROM memory_entities WHERE entity IN ({}))",
                placeholders.join(",")
            ));
            for entity in &criteria.entities {
                params_vec.push(Box::new(entity.clone()));
            }
        }

        if let Some(ref text_match) = criteria.text_match {
            let mut arms: Vec<&str> = Vec::new();
            for term in text_match.terms.iter().filter(|t| !t.is_empty()) {
                arms.push("(' ' || search_text || ' ') LIKE ? ESCAPE '\\'");
                params_vec.push(Box::new(format!("% {} %", escape_like(term))));
            }
            if let Some(ref text) = text_match.mentioned_in {
                arms.push(
                    "id IN (SELECT memory_id FROM memory_entities
                     WHERE entity_key <> '' AND instr(?, ' ' || entity_key || ' ') > 0)",
                );
                params_vec.push(Box::new(format!(" {} ", search_text(text))));
            }
            if arms.is_empty() {
                sql.push_str(" AND 0");
            } else {
                sql.push_str(&format!(" AND ({})", arms.join(" OR ")));
            }
        }

        if !criteria.include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }

        if !criteria.include_expired {
            sql.push_str(" AND (valid_to IS NULL OR valid_to >= ?)");
            params_vec.push(Box::new(now_ms()));
        }

        sql.push_str(match criteria.order {
            QueryOrder::RecentlyAccessed => " ORDER BY accessed_at DESC, id ASC",
            QueryOrder::Newest => " ORDER BY created_at DESC, id ASC",
            QueryOrder::Oldest => " ORDER BY created_at ASC, id ASC",
            QueryOrder::Importance => " ORDER BY importance DESC, accessed_at DESC, id ASC",
            QueryOrder::AccessCount => " ORDER BY access_count DESC, accessed_at DESC, id ASC",
        });

        if let Some(limit) = criteria.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.lock()?;
        let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql).storage("query", None)?;
        let records = stmt
            .query_map(param_refs.as_slice(), Self::map_record)
            .storage("query", None)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .storage("query", None)?;

        Ok(records)
    }

    fn batch_upsert(&self, records: Vec<NewMemory>) -> Result<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Reject the whole batch before touching storage
        let now = now_ms();
        for (index, record) in records.iter().enumerate() {
            if let Err(e) = record.clone().normalized(now) {
                return Err(Error::validation(format!("record #{index}: {e}")));
            }
        }

        let total = records.len();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("batch_upsert", None)?;

        let mut ids = Vec::with_capacity(total);
        for (index, record) in records.into_iter().enumerate() {
            match Self::upsert_in(&tx, record, now) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    // Dropping the transaction rolls back every earlier write
                    tracing::error!(index, total, error = %e, "Batch upsert failed, rolling back");
                    return Err(e);
                }
            }
        }

        tx.commit().storage("batch_upsert", None)?;
        Ok(ids)
    }

    fn batch_get_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM memories WHERE id IN ({})",
            placeholders.join(",")
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).storage("batch_get_by_ids", None)?;
        let mut by_id: HashMap<String, MemoryRecord> = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), Self::map_record)
            .storage("batch_get_by_ids", None)?
            .map(|r| r.map(|record| (record.id.clone(), record)))
            .collect::<std::result::Result<_, _>>()
            .storage("batch_get_by_ids", None)?;

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM memories WHERE id = ?1", params![id])
            .storage("delete", Some(id))?;
        Ok(deleted > 0)
    }

    fn delete_batch(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("delete_batch", None)?;

        let mut deleted = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM memories WHERE id = ?1")
                .storage("delete_batch", None)?;
            for id in ids {
                deleted += stmt.execute(params![id]).storage("delete_batch", Some(id.as_str()))?;
            }
        }

        tx.commit().storage("delete_batch", None)?;
        Ok(deleted)
    }

    fn apply_merge(&self, plan: &MergePlan) -> Result<usize> {
        let canonical = plan.canonical_id.as_str();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("apply_merge", Some(canonical))?;

        let new_hash = plan.content.as_deref().map(content_hash);
        let updated = tx
            .execute(
                "UPDATE memories SET
                    content = COALESCE(?1, content),
                    content_hash = COALESCE(?2, content_hash),
                    importance = ?3,
                    confidence = ?4,
                    entities_json = ?5,
                    metadata_json = ?6,
                    updated_at = ?7,
                    archived_at = NULL,
                    search_text = COALESCE(?9, search_text)
                 WHERE id = ?8",
                params![
                    plan.content,
                    new_hash,
                    plan.importance,
                    plan.confidence,
                    serde_json::to_string(&plan.entities)?,
                    serde_json::to_string(&plan.metadata)?,
                    plan.merged_at,
                    canonical,
                    plan.content.as_deref().map(search_text),
                ],
            )
            .storage("apply_merge", Some(canonical))?;
        if updated == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows).storage("apply_merge", Some(canonical));
        }
        Self::insert_entities(&tx, canonical, &plan.entities)?;

        let mut retired = 0;
        for original in plan.originals.iter().filter(|id| id.as_str() != canonical) {
            tx.execute(
                "INSERT OR IGNORE INTO memory_relationships (from_id, to_id, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![original, canonical, crate::memory::MERGED_INTO, plan.merged_at],
            )
            .storage("apply_merge", Some(original.as_str()))?;

            retired += if plan.archive_originals {
                tx.execute(
                    "UPDATE memories SET archived_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND archived_at IS NULL",
                    params![plan.merged_at, original],
                )
            } else {
                tx.execute("DELETE FROM memories WHERE id = ?1", params![original])
            }
            .storage("apply_merge", Some(original.as_str()))?;
        }

        tx.commit().storage("apply_merge", Some(canonical))?;
        Ok(retired)
    }

    fn relate(&self, from_id: &str, to_id: &str, kind: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO memory_relationships (from_id, to_id, kind, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![from_id, to_id, kind, now_ms()],
        )
        .storage("relate", Some(from_id))?;
        Ok(())
    }

    fn related(&self, id: &str, kind: Option<&str>) -> Result<Vec<Relationship>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT from_id, to_id, kind, created_at FROM memory_relationships
                 WHERE (from_id = ?1 OR to_id = ?1) AND (?2 IS NULL OR kind = ?2)
                 ORDER BY created_at, from_id, to_id",
            )
            .storage("related", Some(id))?;

        let edges = stmt
            .query_map(params![id, kind], |row| {
                Ok(Relationship {
                    from_id: row.get(0)?,
                    to_id: row.get(1)?,
                    kind: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .storage("related", Some(id))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .storage("related", Some(id))?;
        Ok(edges)
    }

    fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats> {
        let conn = self.lock()?;
        let mut stats = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(archived_at IS NULL), 0),
                    COALESCE(SUM(archived_at IS NOT NULL), 0),
                    COALESCE(SUM(access_count), 0),
                    COALESCE(SUM(length(CAST(content AS BLOB))), 0)
                 FROM memories WHERE (?1 IS NULL OR user_id = ?1)",
                params![user_id],
                |row| {
                    Ok(MemoryStats {
                        total: row.get(0)?,
                        archived: row.get(1)?,
                        by_type: BTreeMap::new(),
                        total_accesses: row.get(2)?,
                        content_bytes: row.get(3)?,
                    })
                },
            )
            .storage("stats", user_id)?;

        let mut stmt = conn
            .prepare(
                "SELECT memory_type, COUNT(*) FROM memories
                 WHERE archived_at IS NULL AND (?1 IS NULL OR user_id = ?1)
                 GROUP BY memory_type",
            )
            .storage("stats", user_id)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .storage("stats", user_id)?;
        for row in rows {
            let (memory_type, count) = row.storage("stats", user_id)?;
            stats.by_type.insert(memory_type, count);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextMatch;

    fn scoped(content: &str, ty: MemoryType, user: &str, agent: &str) -> NewMemory {
        let mut record = NewMemory::new(content, ty);
        record.user_id = Some(user.to_string());
        record.agent_id = Some(agent.to_string());
        record
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upsert / Dedup Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_upsert_dedups_normalized_content() {
        let db = Database::open_in_memory().unwrap();

        let first = db
            .upsert(scoped("My name is Alice", MemoryType::Semantic, "u1", "a1"))
            .unwrap();
        let second = db
            .upsert(scoped("  my NAME is alice ", MemoryType::Semantic, "u1", "a1"))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(db.stats(None).unwrap().total, 1);
    }

    #[test]
    fn test_upsert_scopes_by_user_and_agent() {
        let db = Database::open_in_memory().unwrap();

        let a = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a1")).unwrap();
        let b = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a2")).unwrap();
        let c = db.upsert(scoped("likes tea", MemoryType::Preference, "u2", "a1")).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.stats(None).unwrap().total, 3);
    }

    #[test]
    fn test_upsert_merge_keeps_access_counters() {
        let db = Database::open_in_memory().unwrap();
        let id = db.upsert(NewMemory::new("works at TechCorp", MemoryType::Semantic)).unwrap();
        db.record_access_batch(&[AccessUpdate {
            memory_id: id.clone(),
            count: 3,
            accessed_at: now_ms(),
            context: "test".into(),
        }])
        .unwrap();
        let before = db.get_by_id(&id).unwrap().unwrap();

        let mut again = NewMemory::new("works at TechCorp", MemoryType::Semantic);
        again.importance = Some(0.95);
        again.entities = vec!["TechCorp".into()];
        again.metadata.insert("rule".into(), "employer".into());
        assert_eq!(db.upsert(again).unwrap(), id);

        let after = db.get_by_id(&id).unwrap().unwrap();
        assert_eq!(after.access_count, before.access_count);
        assert_eq!(after.accessed_at, before.accessed_at);
        assert_eq!(after.importance, 0.95);
        assert_eq!(after.entities, vec!["TechCorp".to_string()]);
        assert_eq!(after.metadata.get("rule").map(String::as_str), Some("employer"));
    }

    #[test]
    fn test_upsert_rejects_empty_content() {
        let db = Database::open_in_memory().unwrap();
        let err = db.upsert(NewMemory::new("   ", MemoryType::Semantic)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_hostile_content_is_bound_not_interpolated() {
        let db = Database::open_in_memory().unwrap();
        let content = "Robert'); DROP TABLE memories;--";
        let id = db.upsert(NewMemory::new(content, MemoryType::Semantic)).unwrap();

        let record = db.get_by_id(&id).unwrap().unwrap();
        assert_eq!(record.content, content);
        db.ping().unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Batch Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_batch_upsert_is_all_or_nothing() {
        let db = Database::open_in_memory().unwrap();
        let records = vec![
            NewMemory::new("first fact", MemoryType::Semantic),
            NewMemory::new("", MemoryType::Semantic),
        ];

        let err = db.batch_upsert(records).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("record #1"));
        assert_eq!(db.stats(None).unwrap().total, 0);
    }

    #[test]
    fn test_batch_upsert_dedups_within_batch() {
        let db = Database::open_in_memory().unwrap();
        let ids = db
            .batch_upsert(vec![
                NewMemory::new("likes jazz", MemoryType::Preference),
                NewMemory::new("LIKES JAZZ", MemoryType::Preference),
                NewMemory::new("lives in Berlin", MemoryType::Semantic),
            ])
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        assert_eq!(db.stats(None).unwrap().total, 2);
    }

    #[test]
    fn test_batch_get_preserves_request_order() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert(NewMemory::new("alpha", MemoryType::Semantic)).unwrap();
        let b = db.upsert(NewMemory::new("beta", MemoryType::Semantic)).unwrap();

        let records = db
            .batch_get_by_ids(&[b.clone(), "missing".into(), a.clone()])
            .unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![b, a]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_query_filters() {
        let db = Database::open_in_memory().unwrap();
        let mut tea = scoped("likes green tea", MemoryType::Preference, "u1", "a1");
        tea.entities = vec!["Green Tea".into()];
        db.upsert(tea).unwrap();
        db.upsert(scoped("lives in Kyoto", MemoryType::Semantic, "u1", "a1")).unwrap();
        db.upsert(scoped("lives in Oslo", MemoryType::Semantic, "u2", "a1")).unwrap();

        let by_user = db
            .query(&MemoryQuery {
                user_id: Some("u1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_user.len(), 2);

        let by_type = db
            .query(&MemoryQuery {
                memory_types: vec![MemoryType::Semantic],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_type.len(), 2);

        let by_entity = db
            .query(&MemoryQuery {
                entities: vec!["green tea".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_entity.len(), 1);
        assert_eq!(by_entity[0].content, "likes green tea");

        let limited = db
            .query(&MemoryQuery {
                limit: Some(1),
                order: QueryOrder::Importance,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].memory_type, MemoryType::Preference);
    }

    #[test]
    fn test_query_excludes_expired_unless_requested() {
        let db = Database::open_in_memory().unwrap();
        let mut old = NewMemory::new("was debugging the parser", MemoryType::Working);
        old.valid_from = Some(1_000);
        old.valid_to = Some(2_000);
        db.upsert(old).unwrap();

        assert!(db.query(&MemoryQuery::default()).unwrap().is_empty());
        let all = db
            .query(&MemoryQuery {
                include_expired: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_query_text_match_filters_before_limit() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            let mut noise = NewMemory::new(format!("ticket {i} closed"), MemoryType::Episodic);
            noise.importance = Some(0.9);
            db.upsert(noise).unwrap();
        }
        let mut employer = NewMemory::new("User works at TechCorp.", MemoryType::Semantic);
        employer.importance = Some(0.1);
        employer.entities = vec!["Tech Corp".into()];
        db.upsert(employer).unwrap();
        db.upsert(NewMemory::new("100% of builds use_cache", MemoryType::Semantic)).unwrap();

        let matching = |terms: &[&str], mentioned_in: Option<&str>| {
            db.query(&MemoryQuery {
                order: QueryOrder::Importance,
                limit: Some(1),
                text_match: Some(TextMatch {
                    terms: terms.iter().map(|t| t.to_string()).collect(),
                    mentioned_in: mentioned_in.map(str::to_string),
                }),
                ..Default::default()
            })
            .unwrap()
        };

        let by_term = matching(&["techcorp"], None);
        assert_eq!(by_term.len(), 1);
        assert_eq!(by_term[0].content, "User works at TechCorp.");

        // Whole tokens only; wildcards are literal
        assert!(matching(&["tech"], None).is_empty());
        assert!(matching(&["%"], None).is_empty());

        let by_entity = matching(&[], Some("Is tech corp hiring?"));
        assert_eq!(by_entity.len(), 1);
        assert!(matching(&[], Some("tech support")).is_empty());
        assert!(matching(&[], None).is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access / Merge / Delete Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_record_access_batch_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let id = db.upsert(NewMemory::new("prefers vim", MemoryType::Preference)).unwrap();
        let created = db.get_by_id(&id).unwrap().unwrap();

        let touched = db
            .record_access_batch(&[
                AccessUpdate { memory_id: id.clone(), count: 2, accessed_at: created.accessed_at + 50, context: "test".into() },
                AccessUpdate { memory_id: "gone".into(), count: 1, accessed_at: created.accessed_at, context: "test".into() },
            ])
            .unwrap();
        assert_eq!(touched, 1);

        // An older timestamp never moves accessed_at backwards
        db.record_access_batch(&[AccessUpdate {
            memory_id: id.clone(),
            count: 1,
            accessed_at: created.accessed_at - 10_000,
            context: "test".into(),
        }])
        .unwrap();

        let record = db.get_by_id(&id).unwrap().unwrap();
        assert_eq!(record.access_count, 3);
        assert_eq!(record.accessed_at, created.accessed_at + 50);
    }

    #[test]
    fn test_apply_merge_archives_and_links() {
        let db = Database::open_in_memory().unwrap();
        let keep = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a1")).unwrap();
        let dup = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a2")).unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("mergedFrom".to_string(), format!("[\"{dup}\"]"));
        let retired = db
            .apply_merge(&MergePlan {
                canonical_id: keep.clone(),
                content: None,
                importance: 0.9,
                confidence: 0.8,
                entities: vec![],
                metadata,
                originals: vec![keep.clone(), dup.clone()],
                archive_originals: true,
                merged_at: now_ms(),
            })
            .unwrap();

        assert_eq!(retired, 1);
        assert!(db.get_by_id(&dup).unwrap().unwrap().is_archived());
        assert_eq!(db.query(&MemoryQuery::default()).unwrap().len(), 1);

        let edges = db.related(&keep, Some(crate::memory::MERGED_INTO)).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_id, dup);
    }

    #[test]
    fn test_upsert_of_merged_away_content_feeds_canonical() {
        let db = Database::open_in_memory().unwrap();
        let keep = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a1")).unwrap();
        let dup = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a2")).unwrap();
        db.apply_merge(&MergePlan {
            canonical_id: keep.clone(),
            content: None,
            importance: 0.5,
            confidence: 0.5,
            entities: vec![],
            metadata: BTreeMap::new(),
            originals: vec![keep.clone(), dup.clone()],
            archive_originals: true,
            merged_at: now_ms(),
        })
        .unwrap();

        let mut again = scoped("Likes tea", MemoryType::Preference, "u1", "a2");
        again.importance = Some(0.8);
        again.entities = vec!["Tea".into()];
        assert_eq!(db.upsert(again).unwrap(), keep);

        assert!(db.get_by_id(&dup).unwrap().unwrap().is_archived());
        let canonical = db.get_by_id(&keep).unwrap().unwrap();
        assert_eq!(canonical.importance, 0.8);
        assert_eq!(canonical.entities, vec!["Tea".to_string()]);
        assert_eq!(db.query(&MemoryQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_revives_archived_record_without_canonical() {
        let db = Database::open_in_memory().unwrap();
        let keep = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a1")).unwrap();
        let dup = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a2")).unwrap();
        db.apply_merge(&MergePlan {
            canonical_id: keep.clone(),
            content: None,
            importance: 0.5,
            confidence: 0.5,
            entities: vec![],
            metadata: BTreeMap::new(),
            originals: vec![keep.clone(), dup.clone()],
            archive_originals: true,
            merged_at: now_ms(),
        })
        .unwrap();
        assert!(db.delete(&keep).unwrap());

        let again = db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a2")).unwrap();
        assert_eq!(again, dup);
        assert!(!db.get_by_id(&dup).unwrap().unwrap().is_archived());
    }

    #[test]
    fn test_delete_cascades_entities() {
        let db = Database::open_in_memory().unwrap();
        let mut record = NewMemory::new("works at TechCorp", MemoryType::Semantic);
        record.entities = vec!["TechCorp".into()];
        let id = db.upsert(record).unwrap();

        assert!(db.delete(&id).unwrap());
        assert!(!db.delete(&id).unwrap());
        let by_entity = db
            .query(&MemoryQuery {
                entities: vec!["TechCorp".into()],
                include_archived: true,
                include_expired: true,
                ..Default::default()
            })
            .unwrap();
        assert!(by_entity.is_empty());
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(scoped("likes tea", MemoryType::Preference, "u1", "a1")).unwrap();
        db.upsert(scoped("lives in Kyoto", MemoryType::Semantic, "u1", "a1")).unwrap();
        db.upsert(scoped("lives in Oslo", MemoryType::Semantic, "u2", "a1")).unwrap();

        let all = db.stats(None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.by_type.get("semantic"), Some(&2));

        let u1 = db.stats(Some("u1")).unwrap();
        assert_eq!(u1.total, 2);
        assert!(u1.content_bytes > 0);
    }
}
