use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::emotion::EmotionState;
use crate::config::DreamTuning;
use crate::embedding::{cosine_similarity, Embedder};
use crate::llm_client::{parse_payload, truncate_for_log, Generator};
use crate::memory::MemoryStore;

const ALIGNMENT_HISTORY_CAPACITY: usize = 50;

/// A guess at the user's next message.
#[derive(Debug, Clone)]
pub struct Dream {
    pub text: String,
    pub probability: f64,
    pub embedding: Vec<f32>,
    pub consumed: bool,
}

/// Outcome of scoring the pending dreams against what the user actually said.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DreamResolution {
    pub reward: f64,
    pub best_similarity: f64,
    pub best_match: Option<String>,
    /// Highest-probability dream of the resolved set, kept for the prompt hint.
    pub top_dream: Option<String>,
}

/// Pending dreams scored against a real input, not yet applied.
#[derive(Debug, Clone)]
pub struct ScoredDreams {
    resolution: DreamResolution,
    embedded: bool,
}

impl ScoredDreams {
    pub fn resolution(&self) -> &DreamResolution {
        &self.resolution
    }
}

/// Buffer state a turn can roll back to.
pub(crate) struct DreamCheckpoint {
    pending: Vec<Dream>,
    alignment_history: VecDeque<f64>,
    last_resolution: Option<DreamResolution>,
}

#[derive(Debug, Deserialize)]
struct DreamCandidate {
    #[serde(default)]
    text: String,
    #[serde(default, alias = "prob")]
    probability: Option<f64>,
}

pub struct DreamBuffer {
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn MemoryStore>,
    pending: Vec<Dream>,
    alignment_history: VecDeque<f64>,
    last_resolution: Option<DreamResolution>,
    tuning: DreamTuning,
}

impl DreamBuffer {
    pub fn new(
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn MemoryStore>,
        tuning: DreamTuning,
    ) -> Self {
        Self {
            generator,
            embedder,
            store,
            pending: Vec::new(),
            alignment_history: VecDeque::with_capacity(ALIGNMENT_HISTORY_CAPACITY),
            last_resolution: None,
            tuning,
        }
    }

    pub fn pending(&self) -> &[Dream] {
        &self.pending
    }

    pub fn last_resolution(&self) -> Option<&DreamResolution> {
        self.last_resolution.as_ref()
    }

    /// Top dream of the set resolved this turn, if there was one.
    pub fn anticipation_hint(&self) -> Option<&str> {
        self.last_resolution
            .as_ref()
            .and_then(|r| r.top_dream.as_deref())
    }

    /// Mean of the last `n` normalised rewards; 0.5 before any resolution.
    pub fn recent_alignment_avg(&self, n: usize) -> f64 {
        if self.alignment_history.is_empty() || n == 0 {
            return 0.5;
        }
        let take = n.min(self.alignment_history.len());
        self.alignment_history.iter().rev().take(take).sum::<f64>() / take as f64
    }

    pub async fn generate_next(&mut self, context: &str) -> usize {
        self.generate_n(context, self.tuning.dream_count).await
    }

    pub async fn generate_n(&mut self, context: &str, n: usize) -> usize {
        let dreams = self.dream(context, n).await;
        self.accept(dreams)
    }

    /// The configured number of dreams for `context`, without touching the buffer.
    pub async fn dream_next(&self, context: &str) -> Vec<Dream> {
        self.dream(context, self.tuning.dream_count).await
    }

    /// Ask the model for `n` likely next user messages and embed them.
    ///
    /// Only complete sets come back: if any embedding fails the result is empty.
    pub async fn dream(&self, context: &str, n: usize) -> Vec<Dream> {
        if n == 0 {
            return Vec::new();
        }

        let prompt = format!(
            "Based on this conversation, simulate {n} plausible next user messages.\n\
             Vary in tone, intent, and length. Be creative but grounded.\n\n\
             Conversation:\n{context}\n\n\
             Output a JSON list: [{{\"text\": \"...\", \"probability\": 0.0-1.0}}]\n\
             Keep probabilities normalized (sum close to 1.0)."
        );

        let candidates = match self
            .generator
            .generate(&prompt, self.tuning.temperature, self.tuning.max_tokens, None)
            .await
        {
            Ok(raw) => parse_dreams(&raw, n),
            Err(e) => {
                tracing::warn!("Dream generation failed, using placeholders: {}", e);
                placeholder_dreams(n)
            }
        };

        let mut dreams = Vec::with_capacity(candidates.len());
        for (text, probability) in candidates {
            match self.embedder.embed(&text).await {
                Ok(embedding) => dreams.push(Dream {
                    text,
                    probability,
                    embedding,
                    consumed: false,
                }),
                Err(e) => {
                    tracing::warn!("Dream embedding failed, discarding dream set: {}", e);
                    return Vec::new();
                }
            }
        }
        dreams
    }

    /// Append a dream set to the buffer.
    pub fn accept(&mut self, dreams: Vec<Dream>) -> usize {
        let added = dreams.len();
        self.pending.extend(dreams);
        tracing::debug!("Dreamed {} candidate next turns", added);
        added
    }

    /// Score pending dreams against the real input, reward the emotion state,
    /// and empty the buffer.
    pub async fn resolve(&mut self, actual_input: &str, emotion: &mut EmotionState) -> (f64, f64) {
        let scored = self.score(actual_input).await;
        self.settle(scored, actual_input, emotion).await
    }

    /// Similarity-weighted match of the pending dreams against `actual_input`.
    /// `None` when nothing is pending. The buffer is left as it is.
    pub async fn score(&self, actual_input: &str) -> Option<ScoredDreams> {
        if self.pending.is_empty() {
            return None;
        }

        let top_dream = self
            .pending
            .iter()
            .max_by(|a, b| a.probability.total_cmp(&b.probability))
            .map(|d| d.text.clone());

        let actual = match self.embedder.embed(actual_input).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!("Could not embed user input, dropping dreams: {}", e);
                return Some(ScoredDreams {
                    resolution: DreamResolution {
                        top_dream,
                        ..DreamResolution::default()
                    },
                    embedded: false,
                });
            }
        };

        let mut total_reward = 0.0;
        let mut best_similarity = -1.0;
        let mut best_match: Option<String> = None;

        for dream in &self.pending {
            let similarity = cosine_similarity(&dream.embedding, &actual);
            total_reward += similarity * dream.probability;
            if similarity > best_similarity {
                best_similarity = similarity;
                best_match = Some(dream.text.clone());
            }
        }

        Some(ScoredDreams {
            resolution: DreamResolution {
                reward: (total_reward / self.pending.len() as f64).clamp(0.0, 1.0),
                best_similarity,
                best_match,
                top_dream,
            },
            embedded: true,
        })
    }

    /// Apply a score from [`DreamBuffer::score`] and empty the buffer.
    ///
    /// Returns `(normalised reward, best similarity)`; `(0, 0)` when nothing was
    /// pending or the input could not be embedded.
    pub async fn settle(
        &mut self,
        scored: Option<ScoredDreams>,
        actual_input: &str,
        emotion: &mut EmotionState,
    ) -> (f64, f64) {
        let mut resolved = std::mem::take(&mut self.pending);
        for dream in &mut resolved {
            dream.consumed = true;
        }

        let Some(ScoredDreams {
            resolution,
            embedded,
        }) = scored
        else {
            self.last_resolution = None;
            return (0.0, 0.0);
        };
        if !embedded {
            self.last_resolution = Some(resolution);
            return (0.0, 0.0);
        }

        let reward = resolution.reward;
        emotion.apply_reward_signal(
            reward,
            "predictive_alignment",
            reward * self.tuning.reward_weight,
        );
        if reward > 0.7 {
            emotion.adjust_tone(["engaged", "empathetic"]);
        } else if reward < 0.3 {
            emotion.adjust_tone(["curious", "attentive"]);
        }

        let content = serde_json::json!({
            "actual": truncate_for_log(actual_input, 100),
            "best_dream": resolution.best_match.as_deref().map(|m| truncate_for_log(m, 100)),
            "alignment_score": resolution.best_similarity,
            "reward": reward,
        });
        if let Err(e) = self
            .store
            .store_episodic("dream_resolution", content, reward)
            .await
        {
            tracing::debug!("Dream resolution not logged: {}", e);
        }

        if self.alignment_history.len() >= ALIGNMENT_HISTORY_CAPACITY {
            self.alignment_history.pop_front();
        }
        self.alignment_history.push_back(reward);

        tracing::debug!(
            "Dream alignment {:.3} (best {:.3}: {:?})",
            reward,
            resolution.best_similarity,
            resolution.best_match
        );

        let best_similarity = resolution.best_similarity;
        self.last_resolution = Some(resolution);
        (reward, best_similarity)
    }

    pub(crate) fn checkpoint(&self) -> DreamCheckpoint {
        DreamCheckpoint {
            pending: self.pending.clone(),
            alignment_history: self.alignment_history.clone(),
            last_resolution: self.last_resolution.clone(),
        }
    }

    pub(crate) fn rewind(&mut self, checkpoint: DreamCheckpoint) {
        self.pending = checkpoint.pending;
        self.alignment_history = checkpoint.alignment_history;
        self.last_resolution = checkpoint.last_resolution;
    }

    #[cfg(test)]
    pub(crate) fn seed(&mut self, dreams: Vec<Dream>) {
        self.pending = dreams;
    }
}

fn parse_dreams(raw: &str, n: usize) -> Vec<(String, f64)> {
    let uniform = 1.0 / n as f64;
    let parsed = match parse_payload::<Vec<DreamCandidate>>(raw) {
        Ok(candidates) => candidates
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .take(n)
            .map(|c| {
                let probability = c
                    .probability
                    .filter(|p| p.is_finite())
                    .unwrap_or(uniform)
                    .clamp(0.0, 1.0);
                (c.text.trim().to_string(), probability)
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("Dream list unparsable, using placeholders: {}", e);
            Vec::new()
        }
    };

    if parsed.is_empty() {
        placeholder_dreams(n)
    } else {
        parsed
    }
}

fn placeholder_dreams(n: usize) -> Vec<(String, f64)> {
    (1..=n)
        .map(|i| (format!("[Dream {}]", i), 1.0 / n as f64))
        .collect()
}
