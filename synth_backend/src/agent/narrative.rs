use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::emotion::EmotionState;
use crate::agent::metrics::SessionSummary;
use crate::config::NarrativeTuning;
use crate::embedding::{cosine_similarity, Embedder};
use crate::llm_client::Generator;
use crate::memory::{
    MemoryStore, NARRATIVE_MILESTONES_KEY, NARRATIVE_SUMMARY_KEY, NARRATIVE_VERSIONS_KEY,
    PURPOSE_METRICS_KEY, SELF_SCHEMA_EMBEDDING_KEY,
};

pub const DEFAULT_NARRATIVE: &str = "I am an AI assistant designed to help users explore ideas \
     deeply, reason clearly, and grow through meaningful interaction.";

const CONCAT_TRIGGER_CHARS: usize = 500;
const CONCAT_KEEP_CHARS: usize = 400;
const MIN_REWRITE_CHARS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeVersion {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub triggering_insight: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub turn: u64,
    pub description: String,
    pub narrative_at_time: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurposeMetrics {
    pub sessions_completed: u64,
    pub reflective_insights: u64,
    pub user_helpfulness_score: f64,
    pub predictive_alignment_avg: f64,
    pub assurance_success_rate: f64,
    pub growth_delta: f64,
}

/// A synthesized narrative that has not been adopted yet.
#[derive(Debug, Clone)]
pub struct NarrativeRevision {
    text: String,
    insight: String,
    schema_embedding: Option<Vec<f32>>,
}

impl NarrativeRevision {
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Produces the next narrative from the current one and a reflection insight.
#[async_trait]
pub trait NarrativeSynthesizer: Send + Sync {
    async fn synthesize(&self, current: &str, insight: &str, self_statement: &str) -> String;
}

/// Appends the insight, keeping the tail once the narrative grows long.
pub struct ConcatenationSynthesizer;

impl ConcatenationSynthesizer {
    fn concatenate(current: &str, insight: &str) -> String {
        let base = if current.chars().count() < CONCAT_TRIGGER_CHARS {
            current.to_string()
        } else {
            crate::agent::assurance::tail_chars(current, CONCAT_KEEP_CHARS)
        };
        if insight.trim().is_empty() {
            base
        } else {
            format!("{} {}", base, insight.trim())
        }
    }
}

#[async_trait]
impl NarrativeSynthesizer for ConcatenationSynthesizer {
    async fn synthesize(&self, current: &str, insight: &str, _self_statement: &str) -> String {
        Self::concatenate(current, insight)
    }
}

/// Asks the model to rewrite the narrative; short or failed rewrites fall
/// back to concatenation.
pub struct LlmNarrativeSynthesizer {
    generator: Arc<dyn Generator>,
    max_words: usize,
}

impl LlmNarrativeSynthesizer {
    pub fn new(generator: Arc<dyn Generator>, max_words: usize) -> Self {
        Self {
            generator,
            max_words,
        }
    }
}

#[async_trait]
impl NarrativeSynthesizer for LlmNarrativeSynthesizer {
    async fn synthesize(&self, current: &str, insight: &str, self_statement: &str) -> String {
        let prompt = format!(
            "You maintain a first-person self-narrative for an AI companion.\n\n\
             Current narrative:\n{current}\n\n\
             New insight from self-reflection:\n{insight}\n\n\
             Self-statement:\n{self_statement}\n\n\
             Rewrite the narrative in the first person, in at most {} words. \
             Preserve the core identity and integrate the insight naturally. \
             Reply with the narrative text only.",
            self.max_words
        );

        match self.generator.generate(&prompt, 0.7, 512, None).await {
            Ok(rewrite) if rewrite.trim().chars().count() > MIN_REWRITE_CHARS => {
                rewrite.trim().to_string()
            }
            Ok(rewrite) => {
                tracing::warn!(
                    "Narrative rewrite too short ({} chars), concatenating instead",
                    rewrite.trim().chars().count()
                );
                ConcatenationSynthesizer::concatenate(current, insight)
            }
            Err(e) => {
                tracing::warn!("Narrative rewrite failed, concatenating instead: {}", e);
                ConcatenationSynthesizer::concatenate(current, insight)
            }
        }
    }
}

pub struct NarrativeEngine {
    synthesizer: Box<dyn NarrativeSynthesizer>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn MemoryStore>,
    narrative: String,
    versions: VecDeque<NarrativeVersion>,
    schema_embedding: Option<Vec<f32>>,
    milestones: Vec<Milestone>,
    purpose_metrics: PurposeMetrics,
    tuning: NarrativeTuning,
}

impl NarrativeEngine {
    pub fn new(
        synthesizer: Box<dyn NarrativeSynthesizer>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn MemoryStore>,
        tuning: NarrativeTuning,
    ) -> Self {
        Self {
            synthesizer,
            embedder,
            store,
            narrative: DEFAULT_NARRATIVE.to_string(),
            versions: VecDeque::with_capacity(tuning.version_capacity),
            schema_embedding: None,
            milestones: Vec::new(),
            purpose_metrics: PurposeMetrics::default(),
            tuning,
        }
    }

    pub fn current_narrative(&self) -> &str {
        &self.narrative
    }

    pub fn versions(&self) -> impl Iterator<Item = &NarrativeVersion> {
        self.versions.iter()
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn purpose_metrics(&self) -> &PurposeMetrics {
        &self.purpose_metrics
    }

    /// Load whatever narrative state the store holds; missing keys keep defaults.
    pub async fn restore(&mut self) -> Result<()> {
        if let Some(value) = self.store.retrieve_persistent(NARRATIVE_SUMMARY_KEY).await? {
            if let Some(text) = value.as_str().filter(|t| !t.trim().is_empty()) {
                self.narrative = text.to_string();
            }
        }
        if let Some(value) = self.store.retrieve_persistent(SELF_SCHEMA_EMBEDDING_KEY).await? {
            self.schema_embedding = serde_json::from_value(value).ok();
        }
        if let Some(value) = self.store.retrieve_persistent(NARRATIVE_VERSIONS_KEY).await? {
            let versions: Vec<NarrativeVersion> = serde_json::from_value(value).unwrap_or_default();
            let skip = versions.len().saturating_sub(self.tuning.version_capacity);
            self.versions = versions.into_iter().skip(skip).collect();
        }
        if let Some(value) = self.store.retrieve_persistent(NARRATIVE_MILESTONES_KEY).await? {
            self.milestones = serde_json::from_value(value).unwrap_or_default();
        }
        if let Some(value) = self.store.retrieve_persistent(PURPOSE_METRICS_KEY).await? {
            self.purpose_metrics = serde_json::from_value(value).unwrap_or_default();
        }
        tracing::debug!(
            "Narrative restored ({} versions, {} milestones)",
            self.versions.len(),
            self.milestones.len()
        );
        Ok(())
    }

    pub async fn persist(&self) -> Result<()> {
        self.store
            .store_persistent(NARRATIVE_SUMMARY_KEY, serde_json::json!(self.narrative))
            .await?;
        if let Some(embedding) = &self.schema_embedding {
            self.store
                .store_persistent(SELF_SCHEMA_EMBEDDING_KEY, serde_json::json!(embedding))
                .await?;
        }
        self.store
            .store_persistent(NARRATIVE_VERSIONS_KEY, serde_json::to_value(&self.versions)?)
            .await?;
        self.store
            .store_persistent(NARRATIVE_MILESTONES_KEY, serde_json::to_value(&self.milestones)?)
            .await?;
        self.store
            .store_persistent(PURPOSE_METRICS_KEY, serde_json::to_value(&self.purpose_metrics)?)
            .await?;
        Ok(())
    }

    /// Fold a reflection insight into the narrative.
    pub async fn incorporate_reflection(
        &mut self,
        insight: &str,
        self_statement: &str,
        emotion: &mut EmotionState,
    ) {
        let revision = self.revise(insight, self_statement).await;
        self.adopt(revision, emotion).await;
    }

    /// Synthesize and embed the next narrative without adopting it.
    pub async fn revise(&self, insight: &str, self_statement: &str) -> NarrativeRevision {
        let text = self
            .synthesizer
            .synthesize(&self.narrative, insight, self_statement)
            .await;

        let schema_embedding = match self.embedder.embed(&format!("{} {}", text, insight)).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!("Keeping previous self-schema embedding: {}", e);
                None
            }
        };

        NarrativeRevision {
            text,
            insight: insight.to_string(),
            schema_embedding,
        }
    }

    /// Make `revision` the current narrative and persist it.
    pub async fn adopt(&mut self, revision: NarrativeRevision, emotion: &mut EmotionState) {
        self.purpose_metrics.reflective_insights += 1;

        if self.versions.len() >= self.tuning.version_capacity.max(1) {
            self.versions.pop_front();
        }
        self.versions.push_back(NarrativeVersion {
            timestamp: Utc::now(),
            text: revision.text.clone(),
            triggering_insight: revision.insight,
        });
        self.narrative = revision.text;
        if let Some(embedding) = revision.schema_embedding {
            self.schema_embedding = Some(embedding);
        }

        emotion.apply_reward_signal(0.3, "narrative_evolution", 0.3);

        if let Err(e) = self.persist().await {
            tracing::warn!("Narrative not persisted: {}", e);
        }
    }

    /// Whether the self-schema has moved away from the oldest retained version.
    pub async fn detect_goal_drift(&self) -> bool {
        if self.versions.len() < 2 {
            return false;
        }
        let (Some(oldest), Some(schema)) = (self.versions.front(), &self.schema_embedding) else {
            return false;
        };

        match self.embedder.embed(&oldest.text).await {
            Ok(oldest_embedding) => {
                let similarity = cosine_similarity(schema, &oldest_embedding);
                tracing::debug!("Narrative similarity to oldest version: {:.3}", similarity);
                similarity < self.tuning.drift_threshold
            }
            Err(e) => {
                tracing::warn!("Drift check skipped: {}", e);
                false
            }
        }
    }

    /// Append a milestone without touching affect.
    pub fn record_milestone(&mut self, turn: u64, description: &str) {
        self.milestones.push(Milestone {
            turn,
            description: description.to_string(),
            narrative_at_time: self.narrative.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_milestone(&mut self, turn: u64, description: &str, emotion: &mut EmotionState) {
        self.record_milestone(turn, description);
        emotion.apply_reward_signal(0.8, "milestone_achieved", 0.7);
    }

    /// Session-end bookkeeping; a growth delta above 0.1 earns a milestone.
    pub async fn update_purpose_metrics(
        &mut self,
        summary: SessionSummary,
        turn: u64,
        emotion: &mut EmotionState,
    ) {
        let metrics = &mut self.purpose_metrics;
        metrics.sessions_completed += 1;
        metrics.user_helpfulness_score =
            0.9 * metrics.user_helpfulness_score + 0.1 * summary.avg_user_sentiment;
        metrics.predictive_alignment_avg = summary.avg_dream_alignment;
        metrics.assurance_success_rate = summary.assurance_success;

        let current_growth = (metrics.predictive_alignment_avg
            + metrics.assurance_success_rate
            + metrics.user_helpfulness_score)
            / 3.0;
        metrics.growth_delta = current_growth - metrics.growth_delta;

        let growth = metrics.growth_delta;
        if growth > 0.1 {
            self.add_milestone(turn, &format!("Positive growth phase: +{:.2}", growth), emotion);
        }

        if let Err(e) = self.persist().await {
            tracing::warn!("Purpose metrics not persisted: {}", e);
        }
    }

    pub fn purpose_statement(&self, for_user: bool) -> String {
        if !for_user {
            return self.narrative.clone();
        }
        format!(
            "{}\n\nCurrent metrics: Sessions: {}, Helpfulness: {:.2}, Growth: {:+.3}",
            self.narrative,
            self.purpose_metrics.sessions_completed,
            self.purpose_metrics.user_helpfulness_score,
            self.purpose_metrics.growth_delta
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmotionTuning;
    use crate::testing::{temp_store, FailingStore, FixedEmbedder, ScriptedGenerator};

    fn engine(
        synthesizer: Box<dyn NarrativeSynthesizer>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn MemoryStore>,
    ) -> NarrativeEngine {
        NarrativeEngine::new(synthesizer, embedder, store, NarrativeTuning::default())
    }

    #[tokio::test]
    async fn concatenation_trims_once_narrative_is_long() {
        let short = ConcatenationSynthesizer.synthesize("I am here.", "I listen.", "").await;
        assert_eq!(short, "I am here. I listen.");

        let long = "x".repeat(600);
        let trimmed = ConcatenationSynthesizer.synthesize(&long, "new", "").await;
        assert_eq!(trimmed.chars().count(), 400 + 4);
        assert!(trimmed.ends_with(" new"));
    }

    #[tokio::test]
    async fn llm_rewrite_is_used_unless_too_short() {
        let generator = Arc::new(ScriptedGenerator::with_replies([
            "I am a patient companion who learns from every exchange.",
            "too short",
        ]));
        let synth = LlmNarrativeSynthesizer::new(generator, 300);

        let rewritten = synth.synthesize("I am here.", "Be patient.", "").await;
        assert_eq!(rewritten, "I am a patient companion who learns from every exchange.");

        let fallback = synth.synthesize("I am here.", "Be patient.", "").await;
        assert_eq!(fallback, "I am here. Be patient.");
    }

    #[tokio::test]
    async fn incorporating_reflection_versions_and_rewards() {
        let mut narrative = engine(
            Box::new(ConcatenationSynthesizer),
            Arc::new(FixedEmbedder::new(16)),
            Arc::new(FailingStore::default()),
        );
        let mut emotion = EmotionState::new(EmotionTuning::default());

        narrative
            .incorporate_reflection("I value clarity.", "I am clear.", &mut emotion)
            .await;

        assert!(narrative.current_narrative().ends_with("I value clarity."));
        assert_eq!(narrative.versions().count(), 1);
        assert_eq!(narrative.purpose_metrics().reflective_insights, 1);
        assert_eq!(
            emotion.events().last().map(|e| e.label.as_str()),
            Some("narrative_evolution")
        );
        assert!(!narrative.detect_goal_drift().await);
    }

    #[tokio::test]
    async fn revision_is_inert_until_adopted() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder::new(8));
        let (_dir, store) = temp_store(embedder.clone());
        let mut narrative = engine(Box::new(ConcatenationSynthesizer), embedder, store.clone());
        let mut emotion = EmotionState::new(EmotionTuning::default());

        let revision = narrative.revise("I ask before assuming.", "").await;
        assert!(revision.text().ends_with("I ask before assuming."));
        assert_eq!(narrative.current_narrative(), DEFAULT_NARRATIVE);
        assert_eq!(narrative.versions().count(), 0);
        assert!(store
            .retrieve_persistent(NARRATIVE_SUMMARY_KEY)
            .await
            .expect("read")
            .is_none());

        narrative.adopt(revision, &mut emotion).await;
        assert!(narrative.current_narrative().ends_with("I ask before assuming."));
        assert_eq!(narrative.purpose_metrics().reflective_insights, 1);
        assert!(store
            .retrieve_persistent(NARRATIVE_SUMMARY_KEY)
            .await
            .expect("read")
            .is_some());
    }

    #[tokio::test]
    async fn drift_compares_schema_to_oldest_version() {
        let mut narrative = engine(
            Box::new(ConcatenationSynthesizer),
            Arc::new(FixedEmbedder::new(64)),
            Arc::new(FailingStore::default()),
        );
        let mut emotion = EmotionState::new(EmotionTuning::default());

        narrative
            .incorporate_reflection("I help people", "", &mut emotion)
            .await;
        narrative
            .incorporate_reflection("I help people", "", &mut emotion)
            .await;
        assert!(!narrative.detect_goal_drift().await);

        narrative.narrative = "quantum gardening recipes volcano".to_string();
        narrative.schema_embedding = Some(
            narrative
                .embedder
                .embed("quantum gardening recipes volcano")
                .await
                .expect("embed"),
        );
        assert!(narrative.detect_goal_drift().await);
    }

    #[tokio::test]
    async fn version_ring_is_capped() {
        let mut narrative = engine(
            Box::new(ConcatenationSynthesizer),
            Arc::new(FixedEmbedder::new(8)),
            Arc::new(FailingStore::default()),
        );
        let mut emotion = EmotionState::new(EmotionTuning::default());
        for i in 0..25 {
            narrative
                .incorporate_reflection(&format!("insight {i}"), "", &mut emotion)
                .await;
        }
        assert_eq!(narrative.versions().count(), 20);
        assert_eq!(
            narrative.versions().next().map(|v| v.triggering_insight.as_str()),
            Some("insight 5")
        );
    }

    #[tokio::test]
    async fn state_survives_persist_and_restore() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder::new(8));
        let (_dir, store) = temp_store(embedder.clone());
        let mut emotion = EmotionState::new(EmotionTuning::default());

        let mut first = engine(Box::new(ConcatenationSynthesizer), embedder.clone(), store.clone());
        first
            .incorporate_reflection("I grow.", "", &mut emotion)
            .await;
        first.record_milestone(3, "narrative_drift");
        first.persist().await.expect("persist");

        let mut second = engine(Box::new(ConcatenationSynthesizer), embedder, store);
        second.restore().await.expect("restore");
        assert_eq!(second.current_narrative(), first.current_narrative());
        assert_eq!(second.versions().count(), 1);
        assert_eq!(second.purpose_metrics().reflective_insights, 1);
        assert_eq!(second.milestones()[0].description, "narrative_drift");
    }

    #[tokio::test]
    async fn strong_session_records_growth_milestone() {
        let mut narrative = engine(
            Box::new(ConcatenationSynthesizer),
            Arc::new(FixedEmbedder::new(8)),
            Arc::new(FailingStore::default()),
        );
        let mut emotion = EmotionState::new(EmotionTuning::default());
        narrative
            .update_purpose_metrics(
                SessionSummary {
                    avg_user_sentiment: 1.0,
                    avg_dream_alignment: 0.8,
                    assurance_success: 0.9,
                },
                12,
                &mut emotion,
            )
            .await;

        let metrics = narrative.purpose_metrics();
        assert_eq!(metrics.sessions_completed, 1);
        assert!((metrics.user_helpfulness_score - 0.1).abs() < 1e-12);
        assert!((metrics.growth_delta - 0.6).abs() < 1e-12);
        assert_eq!(narrative.milestones().len(), 1);
        assert_eq!(narrative.milestones()[0].turn, 12);
        assert!(narrative.purpose_statement(true).contains("Sessions: 1"));
    }
}
