use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::emotion::EmotionState;
use crate::config::FlowTuning;
use crate::memory::MemoryStore;

const DIFFICULTY_HISTORY_CAPACITY: usize = 100;
const BASELINE_EXPLORATION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Bored,
    Flow,
    Overloaded,
}

impl FlowState {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Bored => "bored",
            FlowState::Flow => "flow",
            FlowState::Overloaded => "overloaded",
        }
    }
}

/// Inputs to one difficulty estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifficultyInputs {
    pub recent_alignment: f64,
    pub recent_uncertainty: f64,
    pub turn_count: u64,
}

/// Result of one calibration step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationState {
    pub current_difficulty: f64,
    pub moving_average: f64,
    pub state: FlowState,
    pub temperature: f64,
    pub persistence: f64,
    pub rejection_threshold: f64,
    pub exploration_bonus: f64,
    pub should_suggest_simplification: bool,
}

/// Tunables that survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub moving_average: f64,
    pub temperature: f64,
    pub persistence: f64,
    pub rejection_threshold: f64,
    pub exploration_bonus: f64,
}

pub struct FlowCalibrator {
    store: Arc<dyn MemoryStore>,
    moving_average: f64,
    temperature: f64,
    persistence: f64,
    rejection_threshold: f64,
    exploration_bonus: f64,
    last_state: FlowState,
    difficulty_history: VecDeque<f64>,
    tuning: FlowTuning,
}

impl FlowCalibrator {
    pub fn new(store: Arc<dyn MemoryStore>, tuning: FlowTuning) -> Self {
        Self {
            store,
            moving_average: 0.5,
            temperature: tuning.initial_temperature,
            persistence: 1.0,
            rejection_threshold: 0.9,
            exploration_bonus: BASELINE_EXPLORATION,
            last_state: FlowState::Flow,
            difficulty_history: VecDeque::with_capacity(DIFFICULTY_HISTORY_CAPACITY),
            tuning,
        }
    }

    pub fn moving_average(&self) -> f64 {
        self.moving_average
    }

    pub fn creativity_temperature(&self) -> f64 {
        self.temperature
    }

    pub fn persistence(&self) -> f64 {
        self.persistence
    }

    pub fn rejection_threshold(&self) -> f64 {
        self.rejection_threshold
    }

    pub fn exploration_bonus(&self) -> f64 {
        self.exploration_bonus
    }

    pub fn flow_state(&self) -> FlowState {
        self.last_state
    }

    pub fn should_suggest_simplification(&self, difficulty: f64) -> bool {
        difficulty > self.rejection_threshold
    }

    pub fn estimate_difficulty(&self, inputs: DifficultyInputs) -> (f64, BTreeMap<String, f64>) {
        let predictive = 1.0 - inputs.recent_alignment.clamp(0.0, 1.0);
        let uncertainty = inputs.recent_uncertainty.clamp(0.0, 1.0);
        let horizon = self.tuning.context_load_turns.max(1) as f64;
        let context_load = (inputs.turn_count as f64 / horizon).min(1.0);

        let mut signals = BTreeMap::new();
        signals.insert("predictive".to_string(), predictive);
        signals.insert("uncertainty".to_string(), uncertainty);
        signals.insert("context_load".to_string(), context_load);

        let difficulty = self.tuning.predictive_weight * predictive
            + self.tuning.uncertainty_weight * uncertainty
            + self.tuning.context_load_weight * context_load;

        (difficulty, signals)
    }

    /// EMA update, band classification, parameter nudges, and flow reward.
    pub fn update_flow_state(
        &mut self,
        difficulty: f64,
        emotion: &mut EmotionState,
    ) -> CalibrationState {
        let sample = if difficulty.is_finite() {
            difficulty.clamp(0.0, 1.0)
        } else {
            self.moving_average
        };
        let alpha = self.tuning.alpha.clamp(0.0, 1.0);
        self.moving_average =
            (alpha * sample + (1.0 - alpha) * self.moving_average).clamp(0.0, 1.0);

        if self.difficulty_history.len() >= DIFFICULTY_HISTORY_CAPACITY {
            self.difficulty_history.pop_front();
        }
        self.difficulty_history.push_back(self.moving_average);

        let avg = self.moving_average;
        let state = if avg < self.tuning.target_min {
            let deviation = self.tuning.target_min - avg;
            self.temperature = (self.temperature + 0.1 * deviation).min(self.tuning.max_temperature);
            self.exploration_bonus += 0.1 * deviation;
            self.persistence = (self.persistence + 0.15 * deviation).max(1.3);
            FlowState::Bored
        } else if avg > self.tuning.target_max {
            let deviation = avg - self.tuning.target_max;
            self.temperature = (self.temperature - 0.1 * deviation).max(self.tuning.min_temperature);
            self.persistence = (self.persistence - 0.15 * deviation).min(0.7);
            self.rejection_threshold = (self.rejection_threshold + 0.05 * deviation).min(0.95);
            FlowState::Overloaded
        } else {
            self.exploration_bonus = BASELINE_EXPLORATION;
            FlowState::Flow
        };
        self.last_state = state;

        let center = (self.tuning.target_min + self.tuning.target_max) / 2.0;
        let proximity = 1.0 - (avg - center).abs() * 2.0;
        emotion.apply_reward_signal(
            proximity * 0.6,
            &format!("flow_state_{}", state.as_str()),
            (proximity * 0.5).clamp(0.0, 1.0),
        );

        CalibrationState {
            current_difficulty: difficulty,
            moving_average: avg,
            state,
            temperature: self.temperature,
            persistence: self.persistence,
            rejection_threshold: self.rejection_threshold,
            exploration_bonus: self.exploration_bonus,
            should_suggest_simplification: self.should_suggest_simplification(difficulty),
        }
    }

    pub async fn run_cycle(
        &mut self,
        inputs: DifficultyInputs,
        emotion: &mut EmotionState,
    ) -> CalibrationState {
        let (difficulty, signals) = self.estimate_difficulty(inputs);
        let calibration = self.update_flow_state(difficulty, emotion);

        let mut content = serde_json::to_value(&calibration).unwrap_or_default();
        if let Some(map) = content.as_object_mut() {
            map.insert("signals".to_string(), serde_json::json!(signals));
        }
        if let Err(e) = self.store.store_episodic("flow_calibration", content, 0.0).await {
            tracing::debug!("Flow calibration not logged: {}", e);
        }

        tracing::debug!(
            "Flow {}: difficulty {:.3}, avg {:.3}, temperature {:.3}",
            calibration.state.as_str(),
            difficulty,
            calibration.moving_average,
            calibration.temperature
        );
        calibration
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            moving_average: self.moving_average,
            temperature: self.temperature,
            persistence: self.persistence,
            rejection_threshold: self.rejection_threshold,
            exploration_bonus: self.exploration_bonus,
        }
    }

    pub fn restore(&mut self, snapshot: FlowSnapshot) {
        let finite_or = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };
        self.moving_average = finite_or(snapshot.moving_average, 0.5).clamp(0.0, 1.0);
        self.temperature = finite_or(snapshot.temperature, self.tuning.initial_temperature)
            .clamp(self.tuning.min_temperature, self.tuning.max_temperature);
        self.persistence = finite_or(snapshot.persistence, 1.0);
        self.rejection_threshold = finite_or(snapshot.rejection_threshold, 0.9).clamp(0.0, 0.95);
        self.exploration_bonus = finite_or(snapshot.exploration_bonus, BASELINE_EXPLORATION);
    }
}
