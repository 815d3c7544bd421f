use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::emotion::EmotionState;
use crate::config::AssuranceTuning;
use crate::memory::{MemoryStore, UncertaintyLogEntry, UncertaintyStats};

const UNCERTAINTY_HISTORY_CAPACITY: usize = 50;
const RESPONSE_SNIPPET_CHARS: usize = 200;
const CONTEXT_SNIPPET_CHARS: usize = 500;
const LOGGED_CONTEXT_CHARS: usize = 1000;

const HEDGE_WORDS: &[&str] = &[
    "maybe",
    "perhaps",
    "might",
    "possibly",
    "unsure",
    "unclear",
    "probably",
    "likely",
    "unlikely",
    "conceivably",
    "potentially",
    "arguably",
    "presumably",
    "supposedly",
    "apparently",
    "seemingly",
    "uncertain",
    "doubtful",
    "questionable",
    "debatable",
];

const ABSOLUTE_TERMS: &[&str] = &[
    "definitely",
    "certain",
    "guaranteed",
    "always",
    "never",
    "absolutely",
    "undoubtedly",
    "unquestionably",
    "invariably",
    "certainly",
    "positively",
    "impossibly",
    "infallibly",
    "100%",
    "zero chance",
    "no way",
    "for sure",
];

const POSITIVE_FEEDBACK: &[&str] = &[
    "good", "great", "yes", "correct", "right", "thanks", "perfect", "excellent", "awesome",
    "wonderful", "helpful", "exactly", "brilliant", "fantastic", "amazing", "love", "nice",
    "fine", "ok", "okay", "works", "working", "fixed",
];

const NEGATIVE_FEEDBACK: &[&str] = &[
    "no", "wrong", "incorrect", "bad", "error", "terrible", "awful", "horrible", "useless",
    "broken", "fail", "failed", "failing", "mistake", "issue", "problem", "confused",
    "confusing", "unclear", "unhelpful", "worse",
];

/// Case-insensitive whole-word (or whole-phrase) term set.
struct Lexicon {
    patterns: Vec<Regex>,
}

impl Lexicon {
    fn new(terms: &[&str]) -> Self {
        let patterns = terms
            .iter()
            .filter_map(|term| {
                Regex::new(&format!(
                    r"(?i)(?:^|[^a-z0-9]){}(?:[^a-z0-9]|$)",
                    regex_lite::escape(term)
                ))
                .ok()
            })
            .collect();
        Self { patterns }
    }

    /// Number of distinct terms present in `text`.
    fn count_in(&self, text: &str) -> usize {
        self.patterns.iter().filter(|p| p.is_match(text)).count()
    }
}

const VIGILANT_DIRECTIVE: &str = "The user went somewhere you did not anticipate. Read their \
     message closely and check your assumptions before answering.";
const UNCERTAIN_DIRECTIVE: &str = "You have been uncertain recently. Acknowledge the limits of \
     what you know and ask clarifying questions where it helps.";
const CONFIDENT_DIRECTIVE: &str =
    "You have been confident recently. Stay direct, and keep checking your claims.";

/// Watchfulness raised when the user's message matched no dream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vigilance {
    #[default]
    Normal,
    High,
}

impl Vigilance {
    pub fn as_str(self) -> &'static str {
        match self {
            Vigilance::Normal => "NORMAL",
            Vigilance::High => "HIGH",
        }
    }
}

/// A response the tracker was not confident about, awaiting resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concern {
    pub response_snippet: String,
    pub context_snippet: String,
    pub uncertainty_score: f64,
    pub signals: BTreeMap<String, f64>,
    pub resolved: bool,
    pub resolution_methods: Vec<String>,
    pub relief_valence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty_log_id: Option<i64>,
}

/// Tracker state a turn can roll back to.
pub(crate) struct AssuranceCheckpoint {
    pending: Vec<Concern>,
    uncertainty_history: VecDeque<f64>,
    total_concerns: u64,
    resolved_concerns: u64,
    vigilance: Vigilance,
}

pub struct AssuranceTracker {
    store: Arc<dyn MemoryStore>,
    pending: Vec<Concern>,
    uncertainty_history: VecDeque<f64>,
    total_concerns: u64,
    resolved_concerns: u64,
    vigilance: Vigilance,
    tuning: AssuranceTuning,
    hedges: Lexicon,
    absolutes: Lexicon,
    positive: Lexicon,
    negative: Lexicon,
}

impl AssuranceTracker {
    pub fn new(store: Arc<dyn MemoryStore>, tuning: AssuranceTuning) -> Self {
        Self {
            store,
            pending: Vec::new(),
            uncertainty_history: VecDeque::with_capacity(UNCERTAINTY_HISTORY_CAPACITY),
            total_concerns: 0,
            resolved_concerns: 0,
            vigilance: Vigilance::Normal,
            tuning,
            hedges: Lexicon::new(HEDGE_WORDS),
            absolutes: Lexicon::new(ABSOLUTE_TERMS),
            positive: Lexicon::new(POSITIVE_FEEDBACK),
            negative: Lexicon::new(NEGATIVE_FEEDBACK),
        }
    }

    pub fn pending_concerns(&self) -> &[Concern] {
        &self.pending
    }

    pub fn vigilance(&self) -> Vigilance {
        self.vigilance
    }

    /// Raise vigilance when the best dream match was poor, relax it otherwise.
    pub fn note_dream_alignment(&mut self, best_similarity: f64) -> Vigilance {
        let vigilance = if best_similarity < self.tuning.vigilance_alignment_threshold {
            Vigilance::High
        } else {
            Vigilance::Normal
        };
        if vigilance != self.vigilance {
            tracing::debug!(
                "Vigilance {} (dream alignment {:.3})",
                vigilance.as_str(),
                best_similarity
            );
        }
        self.vigilance = vigilance;
        vigilance
    }

    /// Weighted uncertainty in [0, 1] plus the individual signals.
    pub async fn assess_uncertainty(
        &self,
        response: &str,
        _context: &str,
    ) -> (f64, BTreeMap<String, f64>) {
        let mut signals = BTreeMap::new();

        let hedging = (self.hedges.count_in(response) as f64 / 3.0).min(1.0);
        signals.insert("hedging".to_string(), hedging);

        let baseline = self.tuning.length_baseline_chars.max(1) as f64;
        let length_ratio = response.chars().count() as f64 / baseline;
        let length_anomaly = if !(0.3..=2.0).contains(&length_ratio) {
            0.7
        } else {
            0.2
        };
        signals.insert("length_anomaly".to_string(), length_anomaly);

        let grounding = 1.0 - self.store.grounding_confidence(response).await.clamp(0.0, 1.0);
        signals.insert("grounding".to_string(), grounding);

        let risk = self.risk_level(response);
        signals.insert("risk_level".to_string(), risk);

        let score = self.tuning.hedging_weight * hedging
            + self.tuning.length_weight * length_anomaly
            + self.tuning.grounding_weight * grounding
            + self.tuning.risk_weight * risk;

        (score.clamp(0.0, 1.0), signals)
    }

    fn risk_level(&self, response: &str) -> f64 {
        (self.absolutes.count_in(response) as f64 / 3.0).min(1.0)
    }

    /// Keyword sentiment in [-1, 1]; 0 when no feedback words appear.
    pub fn feedback_sentiment(&self, feedback: &str) -> f64 {
        let pos = self.positive.count_in(feedback) as f64;
        let neg = self.negative.count_in(feedback) as f64;
        if pos + neg == 0.0 {
            return 0.0;
        }
        (pos - neg) / (pos + neg)
    }

    /// Open a concern, signal anxiety, and log the turn if confidence is low.
    pub async fn trigger_concern(
        &mut self,
        response: &str,
        context: &str,
        user_message: Option<&str>,
        uncertainty_score: f64,
        signals: BTreeMap<String, f64>,
        emotion: &mut EmotionState,
    ) {
        self.total_concerns += 1;

        let mut concern = Concern {
            response_snippet: head_chars(response, RESPONSE_SNIPPET_CHARS),
            context_snippet: tail_chars(context, CONTEXT_SNIPPET_CHARS),
            uncertainty_score,
            signals: signals.clone(),
            resolved: false,
            resolution_methods: Vec::new(),
            relief_valence: 0.0,
            uncertainty_log_id: None,
        };

        let confidence = 1.0 - uncertainty_score;
        if confidence < self.tuning.log_threshold {
            let entry = UncertaintyLogEntry {
                user_message: user_message.unwrap_or_default().to_string(),
                parsed_intent: head_chars(response, RESPONSE_SNIPPET_CHARS),
                confidence,
                context: tail_chars(context, LOGGED_CONTEXT_CHARS),
                signals,
            };
            match self.store.log_uncertainty(entry).await {
                Ok(id) => concern.uncertainty_log_id = Some(id),
                Err(e) => tracing::debug!("Uncertainty log write skipped: {}", e),
            }
        }

        let threshold = self.tuning.uncertainty_threshold.max(f64::EPSILON);
        let intensity = (uncertainty_score / threshold).min(1.0);
        emotion.apply_reward_signal(-intensity, "cognitive_uncertainty", intensity);

        if uncertainty_score > self.tuning.risk_threshold {
            emotion.adjust_tone(["cautious", "hedging"]);
        }

        tracing::debug!(
            "Concern raised at uncertainty {:.3} ({} pending)",
            uncertainty_score,
            self.pending.len() + 1
        );
        self.pending.push(concern);
    }

    /// Close a concern and return the relief it produced.
    pub async fn seek_resolution(
        &mut self,
        concern: &mut Concern,
        user_feedback: Option<&str>,
        emotion: &mut EmotionState,
    ) -> f64 {
        if concern.resolved {
            return concern.relief_valence;
        }

        let mut methods = Vec::new();
        let mut relief = 0.0;

        if concern.uncertainty_score < 0.8 {
            methods.push("self_verification".to_string());
            relief += 0.6;
        }

        if let Some(feedback) = user_feedback.filter(|f| !f.trim().is_empty()) {
            let sentiment = self.feedback_sentiment(feedback);
            if sentiment > 0.5 {
                methods.push("user_confirmation".to_string());
                relief += 0.8;
            } else if sentiment < -0.3 {
                methods.push("user_correction".to_string());
                relief -= 0.4;
            }
        }

        methods.push("memory_consistency".to_string());
        relief += 0.5;

        concern.resolved = true;
        concern.resolution_methods = methods;
        concern.relief_valence = relief;
        self.resolved_concerns += 1;

        if relief > 0.0 {
            emotion.apply_reward_signal(relief, "assurance_resolution", relief);
            emotion.adjust_tone(["relieved", "confident"]);
        }

        if let Some(id) = concern.uncertainty_log_id {
            let pattern = concern.resolution_methods.join("+");
            if let Err(e) = self.store.mark_uncertainty_resolved(id, &pattern).await {
                tracing::debug!("Could not mark uncertainty {} resolved: {}", id, e);
            }
        }

        let content = serde_json::to_value(&*concern).unwrap_or_default();
        if let Err(e) = self
            .store
            .store_episodic("assurance_cycle", content, relief)
            .await
        {
            tracing::debug!("Assurance episode not logged: {}", e);
        }

        relief
    }

    /// Assess a fresh response, then resolve and evict every pending concern.
    ///
    /// Returns the uncertainty score and how many concerns this call resolved.
    pub async fn run_cycle(
        &mut self,
        response: &str,
        context: &str,
        user_message: Option<&str>,
        emotion: &mut EmotionState,
    ) -> (f64, usize) {
        let (uncertainty, signals) = self.assess_uncertainty(response, context).await;
        let resolved = self
            .apply_assessment(response, context, user_message, uncertainty, signals, emotion)
            .await;
        (uncertainty, resolved)
    }

    /// Record a score from [`AssuranceTracker::assess_uncertainty`], raise a
    /// concern above the threshold, then resolve every pending concern.
    pub async fn apply_assessment(
        &mut self,
        response: &str,
        context: &str,
        user_message: Option<&str>,
        uncertainty: f64,
        signals: BTreeMap<String, f64>,
        emotion: &mut EmotionState,
    ) -> usize {
        if self.uncertainty_history.len() >= UNCERTAINTY_HISTORY_CAPACITY {
            self.uncertainty_history.pop_front();
        }
        self.uncertainty_history.push_back(uncertainty);

        if uncertainty > self.tuning.uncertainty_threshold {
            self.trigger_concern(response, context, user_message, uncertainty, signals, emotion)
                .await;
        } else {
            emotion.apply_reward_signal(0.3, "baseline_assurance", 0.2);
        }

        let mut concerns = std::mem::take(&mut self.pending);
        let mut resolved = 0;
        for concern in concerns.iter_mut().filter(|c| !c.resolved) {
            self.seek_resolution(concern, user_message, emotion).await;
            resolved += 1;
        }

        tracing::debug!(
            "Assurance cycle: uncertainty {:.3}, resolved {}",
            uncertainty,
            resolved
        );
        resolved
    }

    /// Mean uncertainty over the last `n` turns; 0.5 before any.
    pub fn recent_uncertainty_avg(&self, n: usize) -> f64 {
        if self.uncertainty_history.is_empty() || n == 0 {
            return 0.5;
        }
        let take = n.min(self.uncertainty_history.len());
        self.uncertainty_history.iter().rev().take(take).sum::<f64>() / take as f64
    }

    pub fn last_uncertainty(&self) -> Option<f64> {
        self.uncertainty_history.back().copied()
    }

    /// Directive for the next system prompt from vigilance and recent confidence.
    pub fn confidence_directive(&self) -> Option<String> {
        let mut lines = Vec::new();
        if self.vigilance == Vigilance::High {
            lines.push(VIGILANT_DIRECTIVE);
        }
        if !self.uncertainty_history.is_empty() {
            let avg = self.recent_uncertainty_avg(self.tuning.recent_window);
            if avg > 0.7 {
                lines.push(UNCERTAIN_DIRECTIVE);
            } else if avg < 0.3 {
                lines.push(CONFIDENT_DIRECTIVE);
            }
        }
        (!lines.is_empty()).then(|| lines.join(" "))
    }

    pub fn assurance_success_rate(&self) -> f64 {
        if self.total_concerns == 0 {
            return 0.0;
        }
        self.resolved_concerns as f64 / self.total_concerns as f64
    }

    pub(crate) fn checkpoint(&self) -> AssuranceCheckpoint {
        AssuranceCheckpoint {
            pending: self.pending.clone(),
            uncertainty_history: self.uncertainty_history.clone(),
            total_concerns: self.total_concerns,
            resolved_concerns: self.resolved_concerns,
            vigilance: self.vigilance,
        }
    }

    pub(crate) fn rewind(&mut self, checkpoint: AssuranceCheckpoint) {
        self.pending = checkpoint.pending;
        self.uncertainty_history = checkpoint.uncertainty_history;
        self.total_concerns = checkpoint.total_concerns;
        self.resolved_concerns = checkpoint.resolved_concerns;
        self.vigilance = checkpoint.vigilance;
    }

    /// Store-backed statistics, or counts from this session if the store fails.
    pub async fn uncertainty_stats(&self) -> UncertaintyStats {
        match self.store.uncertainty_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::debug!("Uncertainty stats unavailable from store: {}", e);
                let unresolved = self.total_concerns.saturating_sub(self.resolved_concerns);
                UncertaintyStats {
                    total_entries: self.total_concerns,
                    unresolved,
                    resolved: self.resolved_concerns,
                    resolution_rate: self.assurance_success_rate(),
                    avg_confidence: 1.0 - self.recent_uncertainty_avg(UNCERTAINTY_HISTORY_CAPACITY),
                    last_24h: self.total_concerns,
                }
            }
        }
    }
}

fn head_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

pub(crate) fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmotionTuning;
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::testing::{temp_store, FailingStore};

    fn tracker_on(store: Arc<dyn MemoryStore>) -> AssuranceTracker {
        AssuranceTracker::new(store, AssuranceTuning::default())
    }

    fn emotion() -> EmotionState {
        EmotionState::new(EmotionTuning::default())
    }

    #[tokio::test]
    async fn hedged_response_is_less_certain_than_absolute_one() {
        let tracker = tracker_on(Arc::new(FailingStore::default()));
        let (hedged, hedged_signals) = tracker.assess_uncertainty("maybe perhaps unsure", "").await;
        let (absolute, absolute_signals) =
            tracker.assess_uncertainty("This will definitely work", "").await;

        assert_eq!(hedged_signals["hedging"], 1.0);
        assert_eq!(hedged_signals["risk_level"], 0.0);
        assert_eq!(absolute_signals["hedging"], 0.0);
        assert!(absolute_signals["risk_level"] > 0.0);
        assert!(hedged > absolute);
    }

    #[tokio::test]
    async fn hedging_outweighs_absolutes_at_baseline_grounding() {
        let tracker = tracker_on(Arc::new(FailingStore::grounded(0.8)));
        let (hedged, hedged_signals) = tracker.assess_uncertainty("maybe perhaps unsure", "").await;
        let (absolute, absolute_signals) =
            tracker.assess_uncertainty("This will definitely work", "").await;

        assert!((hedged_signals["grounding"] - 0.2).abs() < 1e-12);
        assert!((absolute_signals["grounding"] - 0.2).abs() < 1e-12);
        assert_eq!(hedged_signals["hedging"], 1.0);
        assert_eq!(hedged_signals["risk_level"], 0.0);
        assert_eq!(absolute_signals["hedging"], 0.0);
        assert!((absolute_signals["risk_level"] - 1.0 / 3.0).abs() < 1e-12);

        // Both are short against the 500-char baseline, so length_anomaly is 0.7.
        assert!((hedged - (0.3 + 0.2 * 0.7 + 0.3 * 0.2)).abs() < 1e-12);
        assert!((absolute - (0.2 * 0.7 + 0.3 * 0.2 + 0.2 / 3.0)).abs() < 1e-12);
        assert!(hedged > absolute);
    }

    #[test]
    fn lexicon_matches_whole_words_and_phrases_only() {
        let tracker = tracker_on(Arc::new(FailingStore::default()));
        assert_eq!(tracker.hedges.count_in("Mightily unlikelyness"), 0);
        assert_eq!(tracker.hedges.count_in("It MIGHT work, possibly."), 2);
        assert_eq!(tracker.absolutes.count_in("I'm 100% sure, no way"), 2);
        assert_eq!(tracker.negative.count_in("know nothing"), 0);
    }

    #[test]
    fn feedback_sentiment_is_balanced_ratio() {
        let tracker = tracker_on(Arc::new(FailingStore::default()));
        assert_eq!(tracker.feedback_sentiment("thanks, perfect"), 1.0);
        assert_eq!(tracker.feedback_sentiment("wrong and broken"), -1.0);
        assert_eq!(tracker.feedback_sentiment("great but wrong"), 0.0);
        assert_eq!(tracker.feedback_sentiment("tell me about owls"), 0.0);
    }

    #[tokio::test]
    async fn concerns_resolve_once_and_leave_the_queue() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        let mut emotion = emotion();

        tracker
            .trigger_concern("maybe", "ctx", None, 0.75, BTreeMap::new(), &mut emotion)
            .await;
        assert_eq!(tracker.pending_concerns().len(), 1);
        assert!(!tracker.pending_concerns()[0].resolved);

        let (_, resolved) = tracker
            .run_cycle("A grounded answer of reasonable length.", "", Some("thanks"), &mut emotion)
            .await;
        assert!(resolved >= 1);
        assert!(tracker.pending_concerns().is_empty());

        let (_, resolved_again) = tracker
            .run_cycle("A grounded answer of reasonable length.", "", None, &mut emotion)
            .await;
        assert!(tracker.last_uncertainty().is_some_and(|u| u < 0.6));
        assert_eq!(resolved_again, 0);
    }

    #[tokio::test]
    async fn seek_resolution_does_not_reopen_a_resolved_concern() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        let mut emotion = emotion();
        let mut concern = Concern {
            response_snippet: "r".into(),
            context_snippet: "c".into(),
            uncertainty_score: 0.7,
            signals: BTreeMap::new(),
            resolved: false,
            resolution_methods: Vec::new(),
            relief_valence: 0.0,
            uncertainty_log_id: None,
        };

        let relief = tracker
            .seek_resolution(&mut concern, Some("yes exactly, thanks"), &mut emotion)
            .await;
        assert!((relief - 1.9).abs() < 1e-9);
        assert_eq!(
            concern.resolution_methods,
            ["self_verification", "user_confirmation", "memory_consistency"]
        );
        assert_eq!(emotion.mood_tags(), ["relieved", "confident"]);

        let events_before = emotion.events().count();
        let again = tracker
            .seek_resolution(&mut concern, Some("wrong"), &mut emotion)
            .await;
        assert_eq!(again, relief);
        assert_eq!(emotion.events().count(), events_before);
        assert_eq!(tracker.assurance_success_rate(), 0.0);
    }

    #[tokio::test]
    async fn high_risk_concern_forces_cautious_tone_and_logs_uncertainty() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let (_dir, store) = temp_store(embedder);
        let mut tracker = tracker_on(store.clone());
        let mut emotion = emotion();

        tracker
            .trigger_concern("response", "context", Some("q"), 0.9, BTreeMap::new(), &mut emotion)
            .await;
        assert_eq!(emotion.mood_tags(), ["cautious", "hedging"]);
        assert!(emotion.valence() < 0.0);
        assert!(tracker.pending_concerns()[0].uncertainty_log_id.is_some());

        let mut concern = tracker.pending.remove(0);
        tracker
            .seek_resolution(&mut concern, None, &mut emotion)
            .await;
        let stats = tracker.uncertainty_stats().await;
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.resolved, 1);
    }

    #[tokio::test]
    async fn failing_store_never_breaks_the_cycle() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        let mut emotion = emotion();
        let (score, _) = tracker
            .run_cycle("maybe perhaps possibly unsure", "ctx", Some("hm"), &mut emotion)
            .await;
        assert!(score > 0.0);
        let stats = tracker.uncertainty_stats().await;
        assert_eq!(stats.total_entries, tracker.total_concerns);
    }

    #[test]
    fn confidence_directive_tracks_recent_average() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        assert!(tracker.confidence_directive().is_none());
        tracker.uncertainty_history.extend([0.9, 0.8, 0.85]);
        assert!(tracker
            .confidence_directive()
            .is_some_and(|d| d.contains("uncertain")));
        tracker.uncertainty_history.clear();
        tracker.uncertainty_history.extend([0.1, 0.2]);
        assert!(tracker
            .confidence_directive()
            .is_some_and(|d| d.contains("confident")));
    }

    #[test]
    fn poor_dream_alignment_raises_vigilance() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        assert_eq!(tracker.vigilance(), Vigilance::Normal);
        assert!(tracker.confidence_directive().is_none());

        assert_eq!(tracker.note_dream_alignment(0.25), Vigilance::High);
        let directive = tracker.confidence_directive().expect("vigilant");
        assert!(directive.starts_with("The user went somewhere you did not anticipate."));

        tracker.uncertainty_history.extend([0.9, 0.9]);
        let directive = tracker.confidence_directive().expect("vigilant and uncertain");
        assert!(directive.contains("did not anticipate"));
        assert!(directive.contains("uncertain recently"));

        assert_eq!(tracker.note_dream_alignment(0.4), Vigilance::Normal);
        assert!(!tracker
            .confidence_directive()
            .is_some_and(|d| d.contains("did not anticipate")));
        assert_eq!(serde_json::json!(Vigilance::High), "HIGH");
    }

    #[tokio::test]
    async fn rewind_forgets_an_applied_assessment() {
        let mut tracker = tracker_on(Arc::new(FailingStore::default()));
        let mut emotion = emotion();
        let checkpoint = tracker.checkpoint();

        let (uncertainty, signals) = tracker.assess_uncertainty("maybe perhaps unsure", "").await;
        assert!(tracker.last_uncertainty().is_none());
        tracker
            .apply_assessment("maybe perhaps unsure", "", None, 0.95, signals, &mut emotion)
            .await;
        tracker.note_dream_alignment(0.0);
        assert!(uncertainty > 0.0);
        assert_eq!(tracker.last_uncertainty(), Some(0.95));
        assert_eq!(tracker.total_concerns, 1);

        tracker.rewind(checkpoint);
        assert!(tracker.last_uncertainty().is_none());
        assert_eq!(tracker.total_concerns, 0);
        assert_eq!(tracker.resolved_concerns, 0);
        assert_eq!(tracker.vigilance(), Vigilance::Normal);
    }

    #[test]
    fn tail_chars_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
