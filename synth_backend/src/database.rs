use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::agent::reflection::ReflectionRecord;
use crate::embedding::{cosine_similarity, Embedder};
use crate::memory::{
    EpisodicRecord, MemoryStore, SemanticMatch, UncertaintyLogEntry, UncertaintyStats,
};

const CONTEXT_EMBEDDING_CAPACITY: usize = 20;
const UNCERTAINTY_CONTEXT_CHARS: usize = 2000;
const GROUNDING_TOP_K: usize = 3;
const GROUNDING_MIN_SIMILARITY: f64 = 0.3;

pub struct AgentDatabase {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    turn_counter: AtomicU64,
    context_embeddings: Mutex<VecDeque<Vec<f32>>>,
}

impl AgentDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn lock_context(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Vec<f32>>>> {
        self.context_embeddings
            .lock()
            .map_err(|e| anyhow::anyhow!("Context ring lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
            embedder,
            turn_counter: AtomicU64::new(0),
            context_embeddings: Mutex::new(VecDeque::with_capacity(CONTEXT_EMBEDDING_CAPACITY)),
        };
        db.ensure_schema()?;

        let turns = db.count_turns()?;
        db.turn_counter.store(turns, Ordering::SeqCst);
        tracing::info!("Opened memory store at {:?} ({} prior turns)", path, turns);
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                content TEXT NOT NULL,
                valence REAL NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS long_term (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                user_input TEXT NOT NULL,
                assistant_response TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS uncertainty_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                user_message TEXT NOT NULL,
                parsed_intent TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                context TEXT NOT NULL,
                signals TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution_pattern TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS semantic_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                content TEXT NOT NULL,
                category TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                embedding TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS reflection_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_index INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                emotional_impact REAL NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_uncertainty_log_timestamp ON uncertainty_log(timestamp DESC)",
            [],
        )?;

        Ok(())
    }

    fn count_turns(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Nearest semantic memories to `text`, best first.
    pub async fn search_semantic(
        &self,
        text: &str,
        k: usize,
        min_similarity: f64,
    ) -> Result<Vec<SemanticMatch>> {
        let query = self.embedder.embed(text).await?;

        let rows = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, content, category, importance, embedding FROM semantic_memories",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut matches: Vec<SemanticMatch> = rows
            .into_iter()
            .filter_map(|(id, content, category, importance, raw)| {
                let embedding: Vec<f32> = serde_json::from_str(&raw).ok()?;
                let similarity = cosine_similarity(&query, &embedding);
                (similarity >= min_similarity).then_some(SemanticMatch {
                    id,
                    content,
                    category,
                    importance,
                    similarity,
                })
            })
            .collect();

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        Ok(matches)
    }

    fn count_semantic(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM semantic_memories", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn try_grounding_confidence(&self, text: &str) -> Result<f64> {
        if self.count_semantic()? == 0 {
            return Ok(0.5);
        }

        let similar = self
            .search_semantic(text, GROUNDING_TOP_K, GROUNDING_MIN_SIMILARITY)
            .await?;
        if similar.is_empty() {
            return Ok(0.3);
        }

        let weight_total: f64 = similar.iter().map(|m| m.importance).sum();
        if weight_total <= 0.0 {
            return Ok(0.5);
        }
        let weighted: f64 = similar.iter().map(|m| m.similarity * m.importance).sum();
        let mut confidence = weighted / weight_total;

        if similar.len() >= 2 && similar[1].similarity > 0.6 {
            confidence = (confidence * 1.1).min(1.0);
        }

        Ok(confidence.clamp(0.0, 1.0))
    }

    fn track_context_embedding(&self, embedding: Vec<f32>) -> Result<()> {
        let mut ring = self.lock_context()?;
        if ring.len() >= CONTEXT_EMBEDDING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(embedding);
        Ok(())
    }
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json_column(raw: String, column: usize) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn mean_similarity(pairs: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = pairs.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

#[async_trait]
impl MemoryStore for AgentDatabase {
    async fn store_episodic(
        &self,
        event: &str,
        content: serde_json::Value,
        valence: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO episodes (timestamp, event_type, content, valence) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), event, content.to_string(), valence],
        )?;
        Ok(())
    }

    async fn recent_episodes(&self, limit: usize) -> Result<Vec<EpisodicRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_type, content, valence
             FROM episodes
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let episodes = stmt
            .query_map([limit as i64], |row| {
                Ok(EpisodicRecord {
                    id: row.get(0)?,
                    timestamp: parse_timestamp(row.get(1)?, 1)?,
                    event: row.get(2)?,
                    content: parse_json_column(row.get(3)?, 3)?,
                    valence: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(episodes)
    }

    async fn store_persistent(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO long_term (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn retrieve_persistent(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM long_term WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).with_context(|| {
                format!("Stored value for '{}' is not valid JSON", key)
            })?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_turn(&self, user_input: &str, assistant_response: &str) -> Result<u64> {
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO turns (timestamp, user_input, assistant_response) VALUES (?1, ?2, ?3)",
                params![Utc::now().to_rfc3339(), user_input, assistant_response],
            )?;
        }
        let turn = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;

        match self
            .embedder
            .embed(&format!("{} {}", user_input, assistant_response))
            .await
        {
            Ok(embedding) => self.track_context_embedding(embedding)?,
            Err(e) => tracing::debug!("Skipping context embedding for turn {}: {}", turn, e),
        }

        if !user_input.trim().is_empty() {
            self.store_semantic(user_input, "user_statement", 0.5)
                .await?;
        }

        Ok(turn)
    }

    fn current_turn(&self) -> u64 {
        self.turn_counter.load(Ordering::SeqCst)
    }

    async fn store_semantic(
        &self,
        content: &str,
        category: &str,
        importance: f64,
    ) -> Result<i64> {
        let embedding = self.embedder.embed(content).await?;
        let embedding_json = serde_json::to_string(&embedding)?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO semantic_memories (timestamp, content, category, importance, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().to_rfc3339(),
                content,
                category,
                importance.clamp(0.0, 1.0),
                embedding_json
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn grounding_confidence(&self, text: &str) -> f64 {
        match self.try_grounding_confidence(text).await {
            Ok(confidence) => confidence,
            Err(e) => {
                tracing::warn!("Grounding lookup failed, assuming neutral: {}", e);
                0.5
            }
        }
    }

    async fn detect_coherence_drift(&self, threshold: f64) -> bool {
        let ring: Vec<Vec<f32>> = match self.lock_context() {
            Ok(ring) => ring.iter().cloned().collect(),
            Err(e) => {
                tracing::warn!("Coherence check skipped: {}", e);
                return false;
            }
        };

        if ring.len() < 3 {
            return false;
        }

        let (earlier, recent) = ring.split_at(ring.len() - 3);
        let average = if earlier.is_empty() {
            mean_similarity(recent.iter().enumerate().flat_map(move |(i, a)| {
                recent[i + 1..].iter().map(move |b| cosine_similarity(a, b))
            }))
        } else {
            mean_similarity(
                recent
                    .iter()
                    .flat_map(move |r| earlier.iter().map(move |e| cosine_similarity(r, e))),
            )
        };

        average.map(|avg| avg < threshold).unwrap_or(false)
    }

    async fn log_uncertainty(&self, entry: UncertaintyLogEntry) -> Result<i64> {
        let context: String = entry.context.chars().take(UNCERTAINTY_CONTEXT_CHARS).collect();
        let signals = serde_json::to_string(&entry.signals)?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO uncertainty_log
             (timestamp, user_message, parsed_intent, confidence_score, context, signals)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                entry.user_message,
                entry.parsed_intent,
                entry.confidence,
                context,
                signals
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn mark_uncertainty_resolved(&self, id: i64, resolution_pattern: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE uncertainty_log SET resolved = 1, resolution_pattern = ?1 WHERE id = ?2",
            params![resolution_pattern, id],
        )?;
        Ok(())
    }

    async fn uncertainty_stats(&self) -> Result<UncertaintyStats> {
        let conn = self.lock_conn()?;

        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM uncertainty_log", [], |row| row.get(0))?;
        let unresolved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM uncertainty_log WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;
        let avg_confidence: Option<f64> = conn.query_row(
            "SELECT AVG(confidence_score) FROM uncertainty_log",
            [],
            |row| row.get(0),
        )?;
        let day_ago = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM uncertainty_log WHERE timestamp > ?1",
            [day_ago],
            |row| row.get(0),
        )?;

        let total = total.max(0) as u64;
        let unresolved = unresolved.max(0) as u64;
        let resolved = total.saturating_sub(unresolved);

        Ok(UncertaintyStats {
            total_entries: total,
            unresolved,
            resolved,
            resolution_rate: if total > 0 {
                resolved as f64 / total as f64
            } else {
                0.0
            },
            avg_confidence: avg_confidence.unwrap_or(0.0),
            last_24h: last_24h.max(0) as u64,
        })
    }

    async fn append_reflection(&self, record: &ReflectionRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO reflection_log (turn_index, recorded_at, payload, emotional_impact)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.turn_index as i64,
                record.recorded_at.to_rfc3339(),
                payload,
                record.emotional_impact
            ],
        )?;
        Ok(())
    }

    async fn reflection_log(&self, limit: usize) -> Result<Vec<ReflectionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT turn_index, recorded_at, payload, emotional_impact
             FROM reflection_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let mut records = stmt
            .query_map([limit as i64], |row| {
                let payload: String = row.get(2)?;
                Ok(ReflectionRecord {
                    turn_index: row.get::<_, i64>(0)?.max(0) as u64,
                    recorded_at: parse_timestamp(row.get(1)?, 1)?,
                    payload: serde_json::from_str(&payload).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    emotional_impact: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        records.reverse();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::reflection::ReflectionPayload;
    use crate::embedding::HashingEmbedder;
    use crate::llm_client::StructuredPayload;
    use crate::testing::FixedEmbedder;
    use std::collections::BTreeMap;

    fn temp_db(embedder: Arc<dyn Embedder>) -> (tempfile::TempDir, AgentDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = AgentDatabase::new(dir.path().join("synth.db"), embedder).expect("db init");
        (dir, db)
    }

    #[tokio::test]
    async fn persistent_values_roundtrip_as_json() {
        let (_dir, db) = temp_db(Arc::new(HashingEmbedder::default()));
        assert!(db.retrieve_persistent("flow_state").await.unwrap().is_none());

        db.store_persistent("flow_state", serde_json::json!({"moving_average": 0.42}))
            .await
            .unwrap();
        let value = db.retrieve_persistent("flow_state").await.unwrap().unwrap();
        assert_eq!(value["moving_average"], 0.42);
    }

    #[tokio::test]
    async fn grounding_is_neutral_without_memories_and_high_for_known_text() {
        let (_dir, db) = temp_db(Arc::new(HashingEmbedder::default()));
        assert_eq!(db.grounding_confidence("anything").await, 0.5);

        db.store_semantic("the project deadline is friday", "fact", 1.0)
            .await
            .unwrap();
        let known = db.grounding_confidence("the project deadline is friday").await;
        assert!(known > 0.9, "got {known}");
    }

    #[tokio::test]
    async fn grounding_is_low_when_nothing_clears_the_floor() {
        let embedder = FixedEmbedder::new(4)
            .with("stored fact", vec![1.0, 0.0, 0.0, 0.0])
            .with("unrelated", vec![0.0, 1.0, 0.0, 0.0]);
        let (_dir, db) = temp_db(Arc::new(embedder));
        db.store_semantic("stored fact", "fact", 0.5).await.unwrap();
        assert_eq!(db.grounding_confidence("unrelated").await, 0.3);
    }

    #[tokio::test]
    async fn store_turn_counts_and_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synth.db");
        {
            let db = AgentDatabase::new(&path, Arc::new(HashingEmbedder::default())).unwrap();
            assert_eq!(db.store_turn("hello", "hi there").await.unwrap(), 1);
            assert_eq!(db.store_turn("how are you", "well").await.unwrap(), 2);
        }
        let db = AgentDatabase::new(&path, Arc::new(HashingEmbedder::default())).unwrap();
        assert_eq!(db.current_turn(), 2);
    }

    #[tokio::test]
    async fn coherence_drift_needs_three_turns_and_flags_topic_jumps() {
        let embedder = FixedEmbedder::new(2)
            .with("a x", vec![1.0, 0.0])
            .with("b y", vec![0.0, 1.0]);
        let (_dir, db) = temp_db(Arc::new(embedder));

        db.store_turn("a", "x").await.unwrap();
        db.store_turn("a", "x").await.unwrap();
        assert!(!db.detect_coherence_drift(0.7).await);

        db.store_turn("a", "x").await.unwrap();
        assert!(!db.detect_coherence_drift(0.7).await);

        for _ in 0..3 {
            db.store_turn("b", "y").await.unwrap();
        }
        assert!(db.detect_coherence_drift(0.7).await);
    }

    #[tokio::test]
    async fn uncertainty_log_stats_track_resolution() {
        let (_dir, db) = temp_db(Arc::new(HashingEmbedder::default()));
        let mut signals = BTreeMap::new();
        signals.insert("hedging".to_string(), 1.0);

        let first = db
            .log_uncertainty(UncertaintyLogEntry {
                user_message: "what is it".into(),
                parsed_intent: "maybe this".into(),
                confidence: 0.2,
                context: "ctx".into(),
                signals: signals.clone(),
            })
            .await
            .unwrap();
        db.log_uncertainty(UncertaintyLogEntry {
            user_message: "and now".into(),
            parsed_intent: "perhaps".into(),
            confidence: 0.4,
            context: "ctx".into(),
            signals,
        })
        .await
        .unwrap();

        db.mark_uncertainty_resolved(first, "clarified").await.unwrap();
        let stats = db.uncertainty_stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unresolved, 1);
        assert!((stats.resolution_rate - 0.5).abs() < 1e-9);
        assert!((stats.avg_confidence - 0.3).abs() < 1e-9);
        assert_eq!(stats.last_24h, 2);
    }

    #[tokio::test]
    async fn reflection_log_returns_oldest_first() {
        let (_dir, db) = temp_db(Arc::new(HashingEmbedder::default()));
        for turn in [10u64, 20, 30] {
            db.append_reflection(&ReflectionRecord {
                turn_index: turn,
                recorded_at: Utc::now(),
                payload: ReflectionPayload::fallback(),
                emotional_impact: 0.4,
            })
            .await
            .unwrap();
        }
        let log = db.reflection_log(2).await.unwrap();
        let turns: Vec<u64> = log.iter().map(|r| r.turn_index).collect();
        assert_eq!(turns, vec![20, 30]);
    }

    #[tokio::test]
    async fn recent_episodes_are_newest_first() {
        let (_dir, db) = temp_db(Arc::new(HashingEmbedder::default()));
        db.store_episodic("first", serde_json::json!({"n": 1}), 0.1)
            .await
            .unwrap();
        db.store_episodic("second", serde_json::json!({"n": 2}), -0.2)
            .await
            .unwrap();
        let episodes = db.recent_episodes(5).await.unwrap();
        assert_eq!(episodes[0].event, "second");
        assert_eq!(episodes[1].content["n"], 1);
    }
}
