use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::reflection::ReflectionRecord;

pub const EMOTION_VALENCE_KEY: &str = "emotion_valence";
pub const FLOW_STATE_KEY: &str = "flow_state";
pub const NARRATIVE_SUMMARY_KEY: &str = "narrative_summary";
pub const SELF_SCHEMA_EMBEDDING_KEY: &str = "self_schema_embedding";
pub const NARRATIVE_VERSIONS_KEY: &str = "narrative_versions";
pub const NARRATIVE_MILESTONES_KEY: &str = "narrative_milestones";
pub const PURPOSE_METRICS_KEY: &str = "purpose_metrics";

/// One row of the episodic log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub content: serde_json::Value,
    pub valence: f64,
}

/// A low-confidence turn worth revisiting later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyLogEntry {
    pub user_message: String,
    pub parsed_intent: String,
    pub confidence: f64,
    pub context: String,
    pub signals: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyStats {
    pub total_entries: u64,
    pub unresolved: u64,
    pub resolved: u64,
    pub resolution_rate: f64,
    pub avg_confidence: f64,
    pub last_24h: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMatch {
    pub id: i64,
    pub content: String,
    pub category: String,
    pub importance: f64,
    pub similarity: f64,
}

/// Persistent store consumed by the control loop.
///
/// `grounding_confidence` and `detect_coherence_drift` are infallible by
/// contract: implementations fold their own failures into a neutral answer.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store_episodic(
        &self,
        event: &str,
        content: serde_json::Value,
        valence: f64,
    ) -> Result<()>;

    async fn recent_episodes(&self, limit: usize) -> Result<Vec<EpisodicRecord>>;

    async fn store_persistent(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn retrieve_persistent(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Record a completed exchange. Returns the new turn count.
    async fn store_turn(&self, user_input: &str, assistant_response: &str) -> Result<u64>;

    fn current_turn(&self) -> u64;

    async fn store_semantic(&self, content: &str, category: &str, importance: f64)
        -> Result<i64>;

    async fn grounding_confidence(&self, text: &str) -> f64;

    async fn detect_coherence_drift(&self, threshold: f64) -> bool;

    async fn log_uncertainty(&self, entry: UncertaintyLogEntry) -> Result<i64>;

    async fn mark_uncertainty_resolved(&self, id: i64, resolution_pattern: &str) -> Result<()>;

    async fn uncertainty_stats(&self) -> Result<UncertaintyStats>;

    async fn append_reflection(&self, record: &ReflectionRecord) -> Result<()>;

    /// Most recent reflections, oldest first.
    async fn reflection_log(&self, limit: usize) -> Result<Vec<ReflectionRecord>>;
}
