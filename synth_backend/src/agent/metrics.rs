use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::agent::calibration::FlowState;

const SERIES_CAPACITY: usize = 100;

/// The three figures the reflection prompt reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReflectionMetrics {
    pub predictive_alignment: f64,
    pub assurance_success: f64,
    pub user_sentiment: f64,
}

/// Session-level averages fed into the purpose metrics at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionSummary {
    pub avg_user_sentiment: f64,
    pub avg_dream_alignment: f64,
    pub assurance_success: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    dream_alignments: VecDeque<f64>,
    uncertainty_scores: VecDeque<f64>,
    flow_states: VecDeque<FlowState>,
    user_sentiments: VecDeque<f64>,
}

fn push_bounded<T>(series: &mut VecDeque<T>, value: T) {
    if series.len() >= SERIES_CAPACITY {
        series.pop_front();
    }
    series.push_back(value);
}

fn recent_mean(series: &VecDeque<f64>, n: usize) -> f64 {
    if series.is_empty() || n == 0 {
        return 0.5;
    }
    let take = n.min(series.len());
    series.iter().rev().take(take).sum::<f64>() / take as f64
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_dream_alignment(&mut self, alignment: f64) {
        push_bounded(&mut self.dream_alignments, alignment);
    }

    pub fn log_uncertainty(&mut self, uncertainty: f64) {
        push_bounded(&mut self.uncertainty_scores, uncertainty);
    }

    pub fn log_flow_state(&mut self, state: FlowState) {
        push_bounded(&mut self.flow_states, state);
    }

    /// Sentiment in [-1, 1], stored rescaled to [0, 1].
    pub fn log_user_sentiment(&mut self, sentiment: f64) {
        push_bounded(&mut self.user_sentiments, ((sentiment + 1.0) / 2.0).clamp(0.0, 1.0));
    }

    pub fn avg_dream_alignment(&self, n: usize) -> f64 {
        recent_mean(&self.dream_alignments, n)
    }

    pub fn avg_uncertainty(&self, n: usize) -> f64 {
        recent_mean(&self.uncertainty_scores, n)
    }

    pub fn avg_user_sentiment(&self, n: usize) -> f64 {
        recent_mean(&self.user_sentiments, n)
    }

    pub fn assurance_success_rate(&self) -> f64 {
        1.0 - self.avg_uncertainty(20)
    }

    /// Share of each flow state over the last 20 turns.
    pub fn flow_state_distribution(&self) -> BTreeMap<&'static str, f64> {
        let mut distribution = BTreeMap::new();
        if self.flow_states.is_empty() {
            distribution.insert(FlowState::Flow.as_str(), 1.0);
            return distribution;
        }
        let recent: Vec<FlowState> = self.flow_states.iter().rev().take(20).copied().collect();
        for state in &recent {
            *distribution.entry(state.as_str()).or_insert(0.0) += 1.0;
        }
        let total = recent.len() as f64;
        for share in distribution.values_mut() {
            *share /= total;
        }
        distribution
    }

    pub fn reflection_metrics(&self) -> ReflectionMetrics {
        ReflectionMetrics {
            predictive_alignment: self.avg_dream_alignment(10),
            assurance_success: self.assurance_success_rate(),
            user_sentiment: self.avg_user_sentiment(10),
        }
    }

    pub fn session_summary(&self) -> SessionSummary {
        SessionSummary {
            avg_user_sentiment: self.avg_user_sentiment(SERIES_CAPACITY),
            avg_dream_alignment: self.avg_dream_alignment(SERIES_CAPACITY),
            assurance_success: self.assurance_success_rate(),
        }
    }
}
