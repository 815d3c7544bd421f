use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::EmotionTuning;

const VALENCE_HISTORY_CAPACITY: usize = 100;

/// One applied reward signal and the valence it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalEvent {
    pub label: String,
    pub valence: f64,
    pub intensity: f64,
    pub resulting_valence: f64,
}

/// Bounded affective state driving tone and temperature.
///
/// Only the turn sequence mutates this. Background work reaches it through
/// queued decay events, never directly.
#[derive(Debug, Clone)]
pub struct EmotionState {
    valence: f64,
    mood_tags: Vec<String>,
    events: VecDeque<EmotionalEvent>,
    valence_history: VecDeque<f64>,
    tuning: EmotionTuning,
}

impl EmotionState {
    pub fn new(tuning: EmotionTuning) -> Self {
        let valence = tuning.baseline_valence.clamp(-1.0, 1.0);
        Self {
            valence,
            mood_tags: tags_for_valence(valence),
            events: VecDeque::with_capacity(tuning.event_log_capacity),
            valence_history: VecDeque::with_capacity(VALENCE_HISTORY_CAPACITY),
            tuning,
        }
    }

    pub fn valence(&self) -> f64 {
        self.valence
    }

    pub fn mood_tags(&self) -> &[String] {
        &self.mood_tags
    }

    pub fn events(&self) -> impl Iterator<Item = &EmotionalEvent> {
        self.events.iter()
    }

    /// Restore a persisted valence without logging an event.
    pub fn restore_valence(&mut self, valence: f64) {
        if valence.is_finite() {
            self.valence = valence.clamp(-1.0, 1.0);
            self.mood_tags = tags_for_valence(self.valence);
        }
    }

    /// `valence += signal * intensity * reward_scale`, clamped to [-1, 1].
    pub fn apply_reward_signal(&mut self, valence: f64, label: &str, intensity: f64) {
        let signal = sanitize(valence).clamp(-1.0, 1.0);
        let intensity = sanitize(intensity).clamp(0.0, 1.0);
        let delta = signal * intensity * self.tuning.reward_scale;

        self.valence = (self.valence + delta).clamp(-1.0, 1.0);

        if self.events.len() >= self.tuning.event_log_capacity.max(1) {
            self.events.pop_front();
        }
        self.events.push_back(EmotionalEvent {
            label: label.to_string(),
            valence: signal,
            intensity,
            resulting_valence: self.valence,
        });

        if self.valence_history.len() >= VALENCE_HISTORY_CAPACITY {
            self.valence_history.pop_front();
        }
        self.valence_history.push_back(self.valence);

        self.mood_tags = tags_for_valence(self.valence);
        tracing::trace!(
            "Reward '{}' ({:+.2} x {:.2}) -> valence {:+.3}",
            label,
            signal,
            intensity,
            self.valence
        );
    }

    /// Step once toward baseline, landing on it rather than crossing it.
    pub fn decay(&mut self) {
        let baseline = self.tuning.baseline_valence.clamp(-1.0, 1.0);
        let step = self.tuning.decay_rate.abs();
        let gap = baseline - self.valence;

        self.valence = if gap.abs() <= step {
            baseline
        } else {
            self.valence + step * gap.signum()
        };
        self.mood_tags = tags_for_valence(self.valence);
    }

    /// Force mood tags until the next reward signal recomputes them.
    pub fn adjust_tone<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if !tags.is_empty() {
            self.mood_tags = tags;
        }
    }

    pub fn temperature_modifier(&self) -> f64 {
        self.valence * self.tuning.temperature_modifier_scale
    }

    pub fn system_prompt_modifier(&self) -> Option<String> {
        let tone = if self.valence > 0.5 {
            "Respond with warmth and enthusiasm."
        } else if self.valence > 0.2 {
            "Respond with a warm, supportive tone."
        } else if self.valence < -0.5 {
            "Respond with care and caution. Something feels off, so be gentle and measured."
        } else if self.valence < -0.2 {
            "Respond thoughtfully. Be slightly more careful than usual."
        } else {
            return None;
        };

        Some(format!(
            "Emotional context: {} Current mood: {}.",
            tone,
            self.mood_tags.join(", ")
        ))
    }

    /// Mean of the last `n` post-signal valences; current valence when empty.
    pub fn average_valence(&self, n: usize) -> f64 {
        if self.valence_history.is_empty() || n == 0 {
            return self.valence;
        }
        let take = n.min(self.valence_history.len());
        let sum: f64 = self.valence_history.iter().rev().take(take).sum();
        sum / take as f64
    }

    pub fn describe(&self) -> String {
        format!(
            "Valence: {:+.2} | Mood: {}",
            self.valence,
            self.mood_tags.join(", ")
        )
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn tags_for_valence(valence: f64) -> Vec<String> {
    let tags: &[&str] = if valence > 0.6 {
        &["joyful", "engaged", "empathetic"]
    } else if valence > 0.3 {
        &["positive", "attentive", "warm"]
    } else if valence > -0.3 {
        &["neutral", "balanced"]
    } else if valence > -0.6 {
        &["concerned", "cautious", "uncertain"]
    } else {
        &["anxious", "distressed", "uncertain"]
    };
    tags.iter().map(|t| t.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EmotionState {
        EmotionState::new(EmotionTuning::default())
    }

    #[test]
    fn valence_stays_bounded_under_any_signal_sequence() {
        let mut emotion = state();
        let signals = [
            (1.0, 1.0),
            (5.0, 3.0),
            (-1.0, 1.0),
            (-40.0, 1.0),
            (f64::NAN, 1.0),
            (0.7, f64::INFINITY),
        ];
        for _ in 0..50 {
            for (valence, intensity) in signals {
                emotion.apply_reward_signal(valence, "stress", intensity);
                assert!((-1.0..=1.0).contains(&emotion.valence()));
            }
        }
        for _ in 0..20 {
            emotion.apply_reward_signal(1.0, "joy", 1.0);
        }
        assert_eq!(emotion.valence(), 1.0);
    }

    #[test]
    fn reward_delta_is_scaled_by_intensity() {
        let mut emotion = state();
        emotion.apply_reward_signal(0.5, "test", 0.4);
        assert!((emotion.valence() - 0.06).abs() < 1e-12);
    }

    #[test]
    fn mood_tags_follow_valence_bands() {
        let mut emotion = state();
        assert_eq!(emotion.mood_tags(), ["neutral", "balanced"]);

        emotion.restore_valence(0.65);
        assert_eq!(emotion.mood_tags(), ["joyful", "engaged", "empathetic"]);

        emotion.restore_valence(-0.45);
        assert_eq!(emotion.mood_tags(), ["concerned", "cautious", "uncertain"]);

        emotion.restore_valence(-0.9);
        assert_eq!(emotion.mood_tags(), ["anxious", "distressed", "uncertain"]);
    }

    #[test]
    fn decay_converges_monotonically_without_overshoot() {
        let mut emotion = state();
        emotion.restore_valence(0.5);

        let before = emotion.valence().abs();
        emotion.decay();
        let first = emotion.valence().abs();
        emotion.decay();
        let second = emotion.valence().abs();
        assert!(first < before);
        assert!(second < first);

        emotion.restore_valence(-0.03);
        emotion.decay();
        assert_eq!(emotion.valence(), 0.0);
        emotion.decay();
        assert_eq!(emotion.valence(), 0.0);
    }

    #[test]
    fn tone_override_lasts_until_next_signal() {
        let mut emotion = state();
        emotion.adjust_tone(["cautious", "hedging"]);
        assert_eq!(emotion.mood_tags(), ["cautious", "hedging"]);

        emotion.apply_reward_signal(0.1, "baseline_assurance", 0.1);
        assert_eq!(emotion.mood_tags(), ["neutral", "balanced"]);
    }

    #[test]
    fn event_log_is_bounded() {
        let mut emotion = state();
        for i in 0..150 {
            emotion.apply_reward_signal(0.1, &format!("e{i}"), 0.1);
        }
        assert_eq!(emotion.events().count(), 100);
        assert_eq!(emotion.events().next().map(|e| e.label.as_str()), Some("e50"));
    }

    #[test]
    fn modifiers_are_pure_projections() {
        let mut emotion = state();
        assert!(emotion.system_prompt_modifier().is_none());
        assert_eq!(emotion.temperature_modifier(), 0.0);

        emotion.restore_valence(0.6);
        let modifier = emotion.system_prompt_modifier().expect("modifier");
        assert!(modifier.starts_with("Emotional context:"));
        assert!(modifier.contains("positive"));
        assert!((emotion.temperature_modifier() - 0.09).abs() < 1e-12);
        assert_eq!(emotion.valence(), 0.6);
    }
}
