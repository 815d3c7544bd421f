pub mod assurance;
pub mod background;
pub mod calibration;
pub mod dreaming;
pub mod emotion;
pub mod metrics;
pub mod narrative;
pub mod reflection;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{AgentConfig, TurnTuning};
use crate::embedding::Embedder;
use crate::llm_client::{parse_payload, truncate_for_log, Generator};
use crate::memory::{MemoryStore, EMOTION_VALENCE_KEY, FLOW_STATE_KEY};

use assurance::{AssuranceCheckpoint, AssuranceTracker, Vigilance};
use background::BackgroundEvent;
use calibration::{DifficultyInputs, FlowCalibrator, FlowSnapshot, FlowState};
use dreaming::{DreamBuffer, DreamCheckpoint};
use emotion::EmotionState;
use metrics::MetricsTracker;
use narrative::{
    ConcatenationSynthesizer, LlmNarrativeSynthesizer, NarrativeEngine, NarrativeSynthesizer,
};
use reflection::{ReflectionCheckpoint, ReflectionScheduler};

const FALLBACK_RESPONSE: &str =
    "I'm having trouble forming a response right now. Could you say that again?";
const RECALIBRATE_SUFFIX: &str = "\n\n(Taking a moment to recalibrate...)";
const RECALIBRATE_COHERENCE: f64 = 0.6;
const REFINE_TEMPERATURE: f32 = 0.1;
const REFINE_MAX_TOKENS: u32 = 1024;
const CONTEXT_HISTORY_CAPACITY: usize = 200;
const STATUS_EPISODES: usize = 5;
const STATUS_VALENCE_WINDOW: usize = 10;

/// The capabilities every module is built from.
#[derive(Clone)]
pub struct SynthContext {
    pub generator: Arc<dyn Generator>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn MemoryStore>,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TurnCompleted(TurnSnapshot),
    MilestoneRecorded { turn: u64, description: String },
}

/// Observable state after a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnSnapshot {
    pub turn_index: u64,
    pub temperature: f64,
    pub valence: f64,
    pub mood_tags: Vec<String>,
    pub dream_alignment: Option<f64>,
    pub uncertainty: f64,
    pub flow_state: FlowState,
    pub vigilance: Vigilance,
    pub narrative: String,
}

/// End-of-session summary of the psyche state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub turn_index: u64,
    pub valence: f64,
    pub average_valence: f64,
    pub mood_tags: Vec<String>,
    pub vigilance: Vigilance,
    pub flow_distribution: BTreeMap<&'static str, f64>,
    pub reflection_parse_failure_rate: f64,
    /// Event names of the newest episodic records, newest first.
    pub recent_episodes: Vec<String>,
    pub purpose: String,
}

/// In-memory state a turn can roll back to.
struct TurnCheckpoint {
    emotion: EmotionState,
    metrics: MetricsTracker,
    dreams: DreamCheckpoint,
    assurance: AssuranceCheckpoint,
    reflection: ReflectionCheckpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone)]
struct ContextMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RefinePayload {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    internal_thought: Option<String>,
    #[serde(default)]
    final_response: String,
}

/// Clamp the sampling temperature into the effective bounds.
pub fn effective_temperature(flow_temperature: f64, emotion_modifier: f64, tuning: &TurnTuning) -> f64 {
    let (low, high) = if tuning.min_temperature <= tuning.max_temperature {
        (tuning.min_temperature, tuning.max_temperature)
    } else {
        (tuning.max_temperature, tuning.min_temperature)
    };
    let raw = flow_temperature + emotion_modifier;
    if raw.is_nan() {
        return low;
    }
    raw.max(low).min(high)
}

/// Sequences one conversation turn through every module.
///
/// Owns all mutable psyche state. Turns run one at a time through
/// `&mut self`; background work arrives as queued [`BackgroundEvent`]s.
pub struct TurnOrchestrator {
    generator: Arc<dyn Generator>,
    store: Arc<dyn MemoryStore>,
    system_prompt: String,
    tuning: TurnTuning,
    recent_window: usize,
    emotion: EmotionState,
    dreams: DreamBuffer,
    assurance: AssuranceTracker,
    flow: FlowCalibrator,
    reflection: ReflectionScheduler,
    narrative: NarrativeEngine,
    metrics: MetricsTracker,
    context: VecDeque<ContextMessage>,
    turn_index: u64,
    background_tx: Sender<BackgroundEvent>,
    background_rx: Receiver<BackgroundEvent>,
    event_tx: Sender<AgentEvent>,
    shutdown: watch::Receiver<bool>,
}

impl TurnOrchestrator {
    pub fn new(
        ctx: SynthContext,
        config: &AgentConfig,
        event_tx: Sender<AgentEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let config = config.clone().with_ordered_bounds();
        let psyche = &config.psyche;

        let synthesizer: Box<dyn NarrativeSynthesizer> = if config.llm_narrative_synthesis {
            Box::new(LlmNarrativeSynthesizer::new(
                ctx.generator.clone(),
                psyche.narrative.max_words,
            ))
        } else {
            Box::new(ConcatenationSynthesizer)
        };

        let (background_tx, background_rx) = flume::unbounded();

        Self {
            generator: ctx.generator.clone(),
            store: ctx.store.clone(),
            system_prompt: config.system_prompt.clone(),
            tuning: psyche.turn.clone(),
            recent_window: psyche.assurance.recent_window,
            emotion: EmotionState::new(psyche.emotion.clone()),
            dreams: DreamBuffer::new(
                ctx.generator.clone(),
                ctx.embedder.clone(),
                ctx.store.clone(),
                psyche.dreaming.clone(),
            ),
            assurance: AssuranceTracker::new(ctx.store.clone(), psyche.assurance.clone()),
            flow: FlowCalibrator::new(ctx.store.clone(), psyche.flow.clone()),
            reflection: ReflectionScheduler::new(
                ctx.generator.clone(),
                ctx.store.clone(),
                psyche.reflection.clone(),
            ),
            narrative: NarrativeEngine::new(
                synthesizer,
                ctx.embedder,
                ctx.store,
                psyche.narrative.clone(),
            ),
            metrics: MetricsTracker::new(),
            context: VecDeque::new(),
            turn_index: 0,
            background_tx,
            background_rx,
            event_tx,
            shutdown,
        }
    }

    /// Sender for the background ticker.
    pub fn background_sender(&self) -> Sender<BackgroundEvent> {
        self.background_tx.clone()
    }

    pub fn emotion(&self) -> &EmotionState {
        &self.emotion
    }

    pub fn narrative(&self) -> &NarrativeEngine {
        &self.narrative
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    /// Load persisted valence, flow tunables, narrative, and reflection log.
    pub async fn restore_state(&mut self) -> Result<()> {
        if let Some(valence) = self
            .store
            .retrieve_persistent(EMOTION_VALENCE_KEY)
            .await?
            .and_then(|v| v.as_f64())
        {
            self.emotion.restore_valence(valence);
        }

        if let Some(value) = self.store.retrieve_persistent(FLOW_STATE_KEY).await? {
            match serde_json::from_value::<FlowSnapshot>(value) {
                Ok(snapshot) => self.flow.restore(snapshot),
                Err(e) => tracing::warn!("Ignoring unreadable flow state: {}", e),
            }
        }

        self.narrative.restore().await?;
        self.reflection.load_history().await?;
        self.turn_index = self.store.current_turn();

        tracing::info!(
            "Restored state at turn {} ({})",
            self.turn_index,
            self.emotion.describe()
        );
        Ok(())
    }

    pub async fn persist_state(&self) -> Result<()> {
        self.store
            .store_persistent(EMOTION_VALENCE_KEY, serde_json::json!(self.emotion.valence()))
            .await?;
        self.store
            .store_persistent(FLOW_STATE_KEY, serde_json::to_value(self.flow.snapshot())?)
            .await?;
        self.narrative.persist().await?;
        Ok(())
    }

    /// Session-end bookkeeping, then a final flush.
    pub async fn finish_session(&mut self) -> Result<()> {
        let summary = self.metrics.session_summary();
        let milestones_before = self.narrative.milestones().len();
        self.narrative
            .update_purpose_metrics(summary, self.turn_index, &mut self.emotion)
            .await;
        self.announce_milestones(milestones_before);
        self.persist_state().await
    }

    /// Apply queued background events.
    pub async fn drain_background(&mut self) {
        let events: Vec<BackgroundEvent> = self.background_rx.drain().collect();
        for event in events {
            match event {
                BackgroundEvent::Decay => {
                    self.emotion.decay();
                    tracing::trace!("Background decay: {}", self.emotion.describe());
                }
                BackgroundEvent::CheckDrift => {
                    if self.narrative.detect_goal_drift().await {
                        tracing::info!("Narrative drift detected at turn {}", self.turn_index);
                        let before = self.narrative.milestones().len();
                        self.narrative.record_milestone(self.turn_index, "narrative_drift");
                        self.announce_milestones(before);
                    }
                }
            }
        }
    }

    fn announce_milestones(&self, from: usize) {
        for milestone in self.narrative.milestones().iter().skip(from) {
            let _ = self.event_tx.send(AgentEvent::MilestoneRecorded {
                turn: milestone.turn,
                description: milestone.description.clone(),
            });
        }
    }

    fn ensure_running(&self, stage: &str) -> Result<()> {
        if *self.shutdown.borrow() {
            anyhow::bail!("Shutdown began during {}, turn abandoned", stage);
        }
        Ok(())
    }

    /// Run one full turn and return the response with a state snapshot.
    ///
    /// A turn abandoned for shutdown leaves the in-memory state as it was
    /// before the turn began.
    pub async fn process_turn(&mut self, user_input: &str) -> Result<(String, TurnSnapshot)> {
        self.ensure_running("turn start")?;
        self.drain_background().await;

        let checkpoint = self.checkpoint();
        match self.run_turn(user_input).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.rewind(checkpoint);
                tracing::info!("Turn {} rolled back: {}", self.turn_index + 1, e);
                Err(e)
            }
        }
    }

    /// Every await before the commit point is followed by a shutdown check,
    /// and nothing after it can fail.
    async fn run_turn(&mut self, user_input: &str) -> Result<(String, TurnSnapshot)> {
        let scored = self.dreams.score(user_input).await;
        self.ensure_running("dream resolution")?;

        let had_dreams = scored.is_some();
        let (_, best_similarity) = self
            .dreams
            .settle(scored, user_input, &mut self.emotion)
            .await;
        let dream_alignment = had_dreams.then_some(best_similarity);
        if let Some(alignment) = dream_alignment {
            self.metrics.log_dream_alignment(alignment);
            self.assurance.note_dream_alignment(alignment);
        }

        let turn = self.turn_index + 1;
        let context = self.format_context_with(Some(user_input));

        let system = self.build_system_text();
        let temperature = effective_temperature(
            self.flow.creativity_temperature(),
            self.emotion.temperature_modifier(),
            &self.tuning,
        );
        tracing::debug!("Turn {} temperature {:.3}", turn, temperature);

        let draft = match self
            .generator
            .generate(
                &context,
                temperature as f32,
                self.tuning.max_response_tokens,
                Some(&system),
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!("Empty draft response, using fallback");
                FALLBACK_RESPONSE.to_string()
            }
            Err(e) => {
                tracing::warn!("Draft generation failed, using fallback: {}", e);
                FALLBACK_RESPONSE.to_string()
            }
        };
        self.ensure_running("draft generation")?;

        self.metrics
            .log_user_sentiment(self.assurance.feedback_sentiment(user_input));
        let (uncertainty, signals) = self.assurance.assess_uncertainty(&draft, &context).await;
        self.ensure_running("assurance")?;
        let resolved = self
            .assurance
            .apply_assessment(
                &draft,
                &context,
                Some(user_input),
                uncertainty,
                signals,
                &mut self.emotion,
            )
            .await;
        self.metrics.log_uncertainty(uncertainty);
        tracing::debug!(
            "Turn {} uncertainty {:.3} ({} concern(s) resolved)",
            turn,
            uncertainty,
            resolved
        );

        let every = self.tuning.refine_every_turns.max(1);
        let mut response =
            if uncertainty > self.tuning.refine_uncertainty_threshold || turn % every == 0 {
                self.refine(&draft, user_input).await
            } else {
                draft
            };
        self.ensure_running("refinement")?;

        let reflection_metrics = self.metrics.reflection_metrics();
        let reflection = self
            .reflection
            .reflect(&context, &self.emotion, &reflection_metrics, &self.narrative)
            .await;
        self.ensure_running("reflection")?;

        // Commit point.
        if let Some(pending) = reflection {
            let verdict = self
                .reflection
                .apply(pending, &mut self.emotion, &mut self.narrative)
                .await;
            if verdict.coherence_score < RECALIBRATE_COHERENCE {
                response.push_str(RECALIBRATE_SUFFIX);
            }
        }

        self.turn_index = turn;
        self.push_context(Role::User, user_input);

        let calibration = self
            .flow
            .run_cycle(
                DifficultyInputs {
                    recent_alignment: self.dreams.recent_alignment_avg(self.recent_window),
                    recent_uncertainty: self.assurance.recent_uncertainty_avg(self.recent_window),
                    turn_count: self.turn_index,
                },
                &mut self.emotion,
            )
            .await;
        self.metrics.log_flow_state(calibration.state);

        self.emotion.decay();

        self.push_context(Role::Assistant, &response);
        if let Err(e) = self.store.store_turn(user_input, &response).await {
            tracing::warn!("Turn {} not stored: {}", self.turn_index, e);
        }

        let next_context = self.format_context();
        let dreams = self.dreams.dream_next(&next_context).await;
        if *self.shutdown.borrow() {
            tracing::info!(
                "Shutdown began while dreaming ahead, {} dream(s) discarded",
                dreams.len()
            );
        } else {
            let dreamed = self.dreams.accept(dreams);
            tracing::debug!("Turn {} complete, {} dream(s) pending", self.turn_index, dreamed);
        }

        let snapshot = TurnSnapshot {
            turn_index: self.turn_index,
            temperature,
            valence: self.emotion.valence(),
            mood_tags: self.emotion.mood_tags().to_vec(),
            dream_alignment,
            uncertainty,
            flow_state: calibration.state,
            vigilance: self.assurance.vigilance(),
            narrative: self.narrative.current_narrative().to_string(),
        };
        let _ = self.event_tx.send(AgentEvent::TurnCompleted(snapshot.clone()));

        Ok((response, snapshot))
    }

    fn checkpoint(&self) -> TurnCheckpoint {
        TurnCheckpoint {
            emotion: self.emotion.clone(),
            metrics: self.metrics.clone(),
            dreams: self.dreams.checkpoint(),
            assurance: self.assurance.checkpoint(),
            reflection: self.reflection.checkpoint(),
        }
    }

    fn rewind(&mut self, checkpoint: TurnCheckpoint) {
        self.emotion = checkpoint.emotion;
        self.metrics = checkpoint.metrics;
        self.dreams.rewind(checkpoint.dreams);
        self.assurance.rewind(checkpoint.assurance);
        self.reflection.rewind(checkpoint.reflection);
    }

    /// Counters and summaries for the end-of-session log.
    pub async fn status_report(&self) -> StatusReport {
        let recent_episodes = match self.store.recent_episodes(STATUS_EPISODES).await {
            Ok(episodes) => episodes.into_iter().map(|e| e.event).collect(),
            Err(e) => {
                tracing::warn!("Recent episodes unavailable: {}", e);
                Vec::new()
            }
        };

        StatusReport {
            turn_index: self.turn_index,
            valence: self.emotion.valence(),
            average_valence: self.emotion.average_valence(STATUS_VALENCE_WINDOW),
            mood_tags: self.emotion.mood_tags().to_vec(),
            vigilance: self.assurance.vigilance(),
            flow_distribution: self.metrics.flow_state_distribution(),
            reflection_parse_failure_rate: self.reflection.parse_failure_rate(),
            recent_episodes,
            purpose: self.narrative.purpose_statement(true),
        }
    }

    /// Ordered system text: personality, mood, narrative, anticipation,
    /// reflection guidance, confidence directive.
    fn build_system_text(&self) -> String {
        let mut sections = vec![self.system_prompt.clone()];

        if let Some(modifier) = self.emotion.system_prompt_modifier() {
            sections.push(modifier);
        }
        sections.push(format!(
            "Your self-narrative: {}",
            self.narrative.current_narrative()
        ));
        if let Some(hint) = self.dreams.anticipation_hint() {
            sections.push(format!("You anticipated the user might say: \"{}\"", hint));
        }
        if let Some(guidance) = self.reflection.guidance_line() {
            sections.push(guidance);
        }
        if let Some(directive) = self.assurance.confidence_directive() {
            sections.push(directive);
        }

        sections.join("\n\n")
    }

    /// One critique-and-rewrite pass. Any failure keeps the draft.
    async fn refine(&self, draft: &str, user_input: &str) -> String {
        let prompt = format!(
            "Review this draft response for quality and alignment.\n\n\
             User input: \"{}\"\n\
             Draft response: \"{}\"\n\
             Current emotional state: {}\n\n\
             Rate alignment with the user input (0-1) and with the emotional state (0-1).\n\
             If meaningful improvements are needed, rewrite. Otherwise return the original.\n\n\
             Output JSON: {{\"score\": float, \"internal_thought\": str, \"final_response\": str}}",
            user_input,
            draft,
            self.emotion.describe()
        );

        let raw = match self
            .generator
            .generate(&prompt, REFINE_TEMPERATURE, REFINE_MAX_TOKENS, None)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Refinement skipped: {}", e);
                return draft.to_string();
            }
        };

        match parse_payload::<RefinePayload>(&raw) {
            Ok(critique) if !critique.final_response.trim().is_empty() => {
                tracing::debug!(
                    "Refinement score {:?}: {}",
                    critique.score,
                    truncate_for_log(critique.internal_thought.as_deref().unwrap_or(""), 200)
                );
                critique.final_response.trim().to_string()
            }
            Ok(_) => draft.to_string(),
            Err(e) => {
                tracing::warn!("Refinement unparsable, keeping draft: {}", e);
                draft.to_string()
            }
        }
    }

    fn push_context(&mut self, role: Role, content: &str) {
        if self.context.len() >= CONTEXT_HISTORY_CAPACITY {
            self.context.pop_front();
        }
        self.context.push_back(ContextMessage {
            role,
            content: content.to_string(),
        });
    }

    fn format_context(&self) -> String {
        self.format_context_with(None)
    }

    /// The last `context_window` lines, with an uncommitted user message
    /// appended when given.
    fn format_context_with(&self, pending_user: Option<&str>) -> String {
        let lines: Vec<String> = self
            .context
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .chain(pending_user.map(|text| format!("{}: {}", Role::User.label(), text)))
            .collect();
        let skip = lines.len().saturating_sub(self.tuning.context_window);
        lines[skip..].join("\n")
    }
}
