//! Periodic self-inquiry.
//!
//! Every `interval_turns` turns (or sooner when valence drops below the
//! distress line or the store reports coherence drift) the model is asked to
//! grade its own coherence and alignment. The parsed verdict feeds tone, the
//! self-narrative, and a corrective line in the next system prompt.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::assurance::tail_chars;
use crate::agent::emotion::EmotionState;
use crate::agent::metrics::ReflectionMetrics;
use crate::agent::narrative::{NarrativeEngine, NarrativeRevision};
use crate::config::ReflectionTuning;
use crate::llm_client::{parse_or_fallback, Generator, StructuredPayload};
use crate::memory::MemoryStore;

const LOG_CAPACITY: usize = 50;
const REFLECTION_TEMPERATURE: f32 = 0.7;
const REFLECTION_MAX_TOKENS: u32 = 1024;
const COMPLETION_IMPACT: f64 = 0.4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendedAdjustments {
    pub tone: Option<String>,
    pub focus: Option<String>,
    pub strategy: Option<String>,
}

impl RecommendedAdjustments {
    fn is_empty(&self) -> bool {
        [&self.tone, &self.focus, &self.strategy]
            .iter()
            .all(|field| field.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

/// The JSON verdict a reflection returns. Both scores are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionPayload {
    pub coherence_score: f64,
    pub alignment_score: f64,
    #[serde(default)]
    pub issues_detected: Vec<String>,
    #[serde(default)]
    pub recommended_adjustments: Option<RecommendedAdjustments>,
    #[serde(default)]
    pub self_statement: Option<String>,
    #[serde(default)]
    pub overall_insight: Option<String>,
}

impl StructuredPayload for ReflectionPayload {
    fn fallback() -> Self {
        Self {
            coherence_score: 0.8,
            alignment_score: 0.8,
            issues_detected: Vec::new(),
            recommended_adjustments: None,
            self_statement: None,
            overall_insight: Some("Operating within normal parameters".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub turn_index: u64,
    pub recorded_at: DateTime<Utc>,
    pub payload: ReflectionPayload,
    pub emotional_impact: f64,
}

/// A verdict that has been generated but not applied.
#[derive(Debug, Clone)]
pub struct PendingReflection {
    payload: ReflectionPayload,
    revision: Option<NarrativeRevision>,
}

impl PendingReflection {
    pub fn payload(&self) -> &ReflectionPayload {
        &self.payload
    }
}

pub(crate) struct ReflectionCheckpoint {
    counter: u64,
    parse_attempts: u64,
    parse_failures: u64,
}

pub struct ReflectionScheduler {
    generator: Arc<dyn Generator>,
    store: Arc<dyn MemoryStore>,
    counter: u64,
    log: VecDeque<ReflectionRecord>,
    parse_attempts: u64,
    parse_failures: u64,
    tuning: ReflectionTuning,
}

impl ReflectionScheduler {
    pub fn new(
        generator: Arc<dyn Generator>,
        store: Arc<dyn MemoryStore>,
        tuning: ReflectionTuning,
    ) -> Self {
        Self {
            generator,
            store,
            counter: 0,
            log: VecDeque::with_capacity(LOG_CAPACITY),
            parse_attempts: 0,
            parse_failures: 0,
            tuning,
        }
    }

    pub fn turn_counter(&self) -> u64 {
        self.counter
    }

    pub fn latest(&self) -> Option<&ReflectionRecord> {
        self.log.back()
    }

    pub fn log(&self) -> impl Iterator<Item = &ReflectionRecord> {
        self.log.iter()
    }

    /// Reload the most recent records so corrective lines survive restarts.
    pub async fn load_history(&mut self) -> anyhow::Result<()> {
        let records = self.store.reflection_log(LOG_CAPACITY).await?;
        tracing::debug!("Loaded {} reflection records", records.len());
        self.log = records.into_iter().collect();
        Ok(())
    }

    /// Count the turn and decide whether a reflection is due.
    pub async fn should_reflect(&mut self, emotion: &EmotionState) -> bool {
        self.counter += 1;
        let interval = self.tuning.interval_turns.max(1);
        if self.counter % interval == 0 {
            return true;
        }
        if emotion.valence() < self.tuning.distress_valence {
            tracing::debug!("Reflection triggered by low valence {:.2}", emotion.valence());
            return true;
        }
        self.store
            .detect_coherence_drift(self.tuning.coherence_drift_threshold)
            .await
    }

    /// Reflect if due. Returns the verdict applied this turn, if any.
    pub async fn run_cycle(
        &mut self,
        context: &str,
        emotion: &mut EmotionState,
        metrics: &ReflectionMetrics,
        narrative: &mut NarrativeEngine,
    ) -> Option<ReflectionPayload> {
        let pending = self.reflect(context, emotion, metrics, narrative).await?;
        Some(self.apply(pending, emotion, narrative).await)
    }

    /// Ask for a verdict and draft the narrative revision it implies.
    /// Nothing outside the scheduler's own counters changes until [`apply`].
    ///
    /// [`apply`]: ReflectionScheduler::apply
    pub async fn reflect(
        &mut self,
        context: &str,
        emotion: &EmotionState,
        metrics: &ReflectionMetrics,
        narrative: &NarrativeEngine,
    ) -> Option<PendingReflection> {
        if !self.should_reflect(emotion).await {
            return None;
        }

        let prompt = self.build_prompt(context, emotion, metrics, narrative.current_narrative());
        self.parse_attempts += 1;
        let payload = match self
            .generator
            .generate(&prompt, REFLECTION_TEMPERATURE, REFLECTION_MAX_TOKENS, None)
            .await
        {
            Ok(raw) => {
                let (payload, used_fallback) = parse_or_fallback::<ReflectionPayload>(&raw, "Reflection");
                if used_fallback {
                    self.parse_failures += 1;
                }
                payload
            }
            Err(e) => {
                tracing::warn!("Reflection generation failed, using neutral verdict: {}", e);
                self.parse_failures += 1;
                ReflectionPayload::fallback()
            }
        };

        tracing::info!(
            "Reflection at turn {}: coherence {:.2}, alignment {:.2}, {} issue(s)",
            self.counter,
            payload.coherence_score,
            payload.alignment_score,
            payload.issues_detected.len()
        );

        let revision = match payload.overall_insight.as_deref().filter(|i| !i.trim().is_empty()) {
            Some(insight) => Some(
                narrative
                    .revise(insight, payload.self_statement.as_deref().unwrap_or_default())
                    .await,
            ),
            None => None,
        };

        Some(PendingReflection { payload, revision })
    }

    /// Apply a verdict: rewards, narrative, tone, then the persisted log.
    pub async fn apply(
        &mut self,
        pending: PendingReflection,
        emotion: &mut EmotionState,
        narrative: &mut NarrativeEngine,
    ) -> ReflectionPayload {
        let PendingReflection { payload, revision } = pending;

        let adjustments = payload.recommended_adjustments.as_ref();
        if adjustments.is_some_and(|a| !a.is_empty()) {
            emotion.apply_reward_signal(COMPLETION_IMPACT, "meta_reflection_completion", 0.3);
        }

        if let Some(revision) = revision {
            narrative.adopt(revision, emotion).await;
        }

        // Tone goes last; reward signals recompute the tags.
        if let Some(tone) = adjustments
            .and_then(|a| a.tone.as_deref())
            .filter(|t| !t.trim().is_empty())
        {
            emotion.adjust_tone([tone.trim(), "reflective"]);
        }

        let record = ReflectionRecord {
            turn_index: self.counter,
            recorded_at: Utc::now(),
            payload: payload.clone(),
            emotional_impact: COMPLETION_IMPACT,
        };

        match serde_json::to_value(&record) {
            Ok(content) => {
                if let Err(e) = self
                    .store
                    .store_episodic("meta_reflection", content, COMPLETION_IMPACT)
                    .await
                {
                    tracing::warn!("Reflection episode not stored: {}", e);
                }
            }
            Err(e) => tracing::warn!("Reflection record not serializable: {}", e),
        }
        if let Err(e) = self.store.append_reflection(&record).await {
            tracing::warn!("Reflection log not persisted: {}", e);
        }

        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(record);

        payload
    }

    pub(crate) fn checkpoint(&self) -> ReflectionCheckpoint {
        ReflectionCheckpoint {
            counter: self.counter,
            parse_attempts: self.parse_attempts,
            parse_failures: self.parse_failures,
        }
    }

    pub(crate) fn rewind(&mut self, checkpoint: ReflectionCheckpoint) {
        self.counter = checkpoint.counter;
        self.parse_attempts = checkpoint.parse_attempts;
        self.parse_failures = checkpoint.parse_failures;
    }

    fn build_prompt(
        &self,
        context: &str,
        emotion: &EmotionState,
        metrics: &ReflectionMetrics,
        narrative: &str,
    ) -> String {
        format!(
            "Perform a meta-reflection on your cognitive process.\n\
             Step outside the conversation and evaluate yourself honestly.\n\n\
             Recent conversation excerpt:\n{}\n\n\
             Current emotional state:\n\
             - Valence: {:.2}\n\
             - Mood tags: {}\n\n\
             Performance metrics:\n\
             - Predictive alignment: {:.2}\n\
             - Assurance success: {:.2}\n\
             - User sentiment: {:.2}\n\n\
             Core purpose: {}\n\n\
             Answer:\n\
             1. Am I remaining coherent and consistent?\n\
             2. Am I aligned with my purpose?\n\
             3. Are there biases or drifts?\n\
             4. How is my emotional state affecting my responses?\n\
             5. What specific adjustment would improve the next few interactions?\n\
             6. Brief self-statement (1 sentence)\n\n\
             Output JSON:\n\
             {{\n  \"coherence_score\": 0-1,\n  \"alignment_score\": 0-1,\n  \
             \"issues_detected\": [list or empty],\n  \
             \"recommended_adjustments\": {{\"tone\": str, \"focus\": str, \"strategy\": str}},\n  \
             \"self_statement\": str,\n  \"overall_insight\": str\n}}",
            tail_chars(context, self.tuning.context_chars),
            emotion.valence(),
            emotion.mood_tags().join(", "),
            metrics.predictive_alignment,
            metrics.assurance_success,
            metrics.user_sentiment,
            narrative
        )
    }

    /// A system-prompt line from the latest verdict, when it found problems.
    pub fn corrective_instruction(&self) -> Option<String> {
        let latest = &self.log.back()?.payload;
        if latest.coherence_score >= 0.7 && latest.issues_detected.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        if latest.coherence_score < 0.7 {
            parts.push(format!(
                "Recent self-check found coherence at {:.0}%. Focus on consistency with previous statements.",
                latest.coherence_score * 100.0
            ));
        }
        if !latest.issues_detected.is_empty() {
            let issues: Vec<&str> = latest
                .issues_detected
                .iter()
                .take(3)
                .map(String::as_str)
                .collect();
            parts.push(format!("Detected issues: {}. Address these.", issues.join(", ")));
        }
        if let Some(strategy) = latest
            .recommended_adjustments
            .as_ref()
            .and_then(|a| a.strategy.as_deref())
            .filter(|s| !s.trim().is_empty())
        {
            parts.push(format!("Strategy adjustment: {}", strategy));
        }

        Some(parts.join(" "))
    }

    /// Corrective line if any, else the latest insight.
    pub fn guidance_line(&self) -> Option<String> {
        if let Some(correction) = self.corrective_instruction() {
            return Some(correction);
        }
        self.log
            .back()
            .and_then(|r| r.payload.overall_insight.as_deref())
            .filter(|i| !i.trim().is_empty())
            .map(|insight| format!("Recent self-insight: {}", insight))
    }

    pub fn parse_failure_rate(&self) -> f64 {
        if self.parse_attempts == 0 {
            0.0
        } else {
            self.parse_failures as f64 / self.parse_attempts as f64
        }
    }
}
