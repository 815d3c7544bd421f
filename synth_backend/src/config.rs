use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Affective state tuning. `reward_scale` multiplies every incoming signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionTuning {
    pub reward_scale: f64,
    pub decay_rate: f64,
    pub baseline_valence: f64,
    pub event_log_capacity: usize,
    pub temperature_modifier_scale: f64,
}

impl Default for EmotionTuning {
    fn default() -> Self {
        Self {
            reward_scale: 0.3,
            decay_rate: 0.05,
            baseline_valence: 0.0,
            event_log_capacity: 100,
            temperature_modifier_scale: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamTuning {
    pub dream_count: usize,
    pub reward_weight: f64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for DreamTuning {
    fn default() -> Self {
        Self {
            dream_count: 5,
            reward_weight: 0.5,
            temperature: 0.9,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssuranceTuning {
    pub uncertainty_threshold: f64,
    pub risk_threshold: f64,
    /// Turns whose confidence (1 - uncertainty) falls below this are written
    /// to the store's uncertainty log.
    pub log_threshold: f64,
    pub hedging_weight: f64,
    pub length_weight: f64,
    pub grounding_weight: f64,
    pub risk_weight: f64,
    pub length_baseline_chars: usize,
    pub recent_window: usize,
    /// Best dream similarity below this puts the tracker on high vigilance.
    pub vigilance_alignment_threshold: f64,
}

impl Default for AssuranceTuning {
    fn default() -> Self {
        Self {
            uncertainty_threshold: 0.6,
            risk_threshold: 0.8,
            log_threshold: 0.8,
            hedging_weight: 0.3,
            length_weight: 0.2,
            grounding_weight: 0.3,
            risk_weight: 0.2,
            length_baseline_chars: 500,
            recent_window: 5,
            vigilance_alignment_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTuning {
    pub target_min: f64,
    pub target_max: f64,
    pub alpha: f64,
    pub predictive_weight: f64,
    pub uncertainty_weight: f64,
    pub context_load_weight: f64,
    pub context_load_turns: u64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub initial_temperature: f64,
}

impl Default for FlowTuning {
    fn default() -> Self {
        Self {
            target_min: 0.4,
            target_max: 0.7,
            alpha: 0.1,
            predictive_weight: 0.4,
            uncertainty_weight: 0.4,
            context_load_weight: 0.2,
            context_load_turns: 50,
            min_temperature: 0.3,
            max_temperature: 1.0,
            initial_temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionTuning {
    pub interval_turns: u64,
    pub distress_valence: f64,
    pub coherence_drift_threshold: f64,
    pub context_chars: usize,
}

impl Default for ReflectionTuning {
    fn default() -> Self {
        Self {
            interval_turns: 10,
            distress_valence: -0.5,
            coherence_drift_threshold: 0.7,
            context_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeTuning {
    pub version_capacity: usize,
    pub drift_threshold: f64,
    pub max_words: usize,
}

impl Default for NarrativeTuning {
    fn default() -> Self {
        Self {
            version_capacity: 20,
            drift_threshold: 0.7,
            max_words: 300,
        }
    }
}

/// Bounds and triggers owned by the turn sequence itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTuning {
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub refine_uncertainty_threshold: f64,
    pub refine_every_turns: u64,
    pub context_window: usize,
    pub max_response_tokens: u32,
}

impl Default for TurnTuning {
    fn default() -> Self {
        Self {
            min_temperature: 0.1,
            max_temperature: 1.5,
            refine_uncertainty_threshold: 0.6,
            refine_every_turns: 3,
            context_window: 20,
            max_response_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsycheTuning {
    #[serde(default)]
    pub emotion: EmotionTuning,
    #[serde(default)]
    pub dreaming: DreamTuning,
    #[serde(default)]
    pub assurance: AssuranceTuning,
    #[serde(default)]
    pub flow: FlowTuning,
    #[serde(default)]
    pub reflection: ReflectionTuning,
    #[serde(default)]
    pub narrative: NarrativeTuning,
    #[serde(default)]
    pub turn: TurnTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Embeddings: hashed locally unless an endpoint is configured
    #[serde(default)]
    pub embedding_api_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    // Base personality, always first in the system text
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // Set to false to keep the narrative engine on plain concatenation
    #[serde(default = "default_true")]
    pub llm_narrative_synthesis: bool,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,

    #[serde(default)]
    pub psyche: PsycheTuning,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_embedding_dimension() -> usize {
    crate::embedding::EMBEDDING_DIM
}

fn default_system_prompt() -> String {
    "You are Synth, a thoughtful conversational companion. \
     You reason carefully, admit uncertainty honestly, and grow through your conversations."
        .to_string()
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> String {
    "synth_memory.db".to_string()
}

fn default_background_interval_secs() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            embedding_api_url: None,
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            system_prompt: default_system_prompt(),
            llm_narrative_synthesis: true,
            database_path: default_database_path(),
            background_interval_secs: default_background_interval_secs(),
            psyche: PsycheTuning::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("synth_config.toml")
    }

    /// Load config from synth_config.toml (next to executable), then apply env overrides.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path(), |key| env::var(key).ok())
    }

    /// Read `path` and apply overrides from `lookup` exactly once.
    pub fn load_from(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config = match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        config.with_overrides_from(lookup).with_ordered_bounds()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<AgentConfig>(contents)
            .map(Self::with_ordered_bounds)
            .context("Failed to parse config TOML")
    }

    /// Repair temperature bounds so every `min <= max` pair can be clamped to.
    pub fn with_ordered_bounds(mut self) -> Self {
        let turn = TurnTuning::default();
        (self.psyche.turn.min_temperature, self.psyche.turn.max_temperature) = ordered_bounds(
            "turn",
            (self.psyche.turn.min_temperature, self.psyche.turn.max_temperature),
            (turn.min_temperature, turn.max_temperature),
        );

        let flow = FlowTuning::default();
        (self.psyche.flow.min_temperature, self.psyche.flow.max_temperature) = ordered_bounds(
            "flow",
            (self.psyche.flow.min_temperature, self.psyche.flow.max_temperature),
            (flow.min_temperature, flow.max_temperature),
        );
        self
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Overrides win over the file.
    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Some(url) = lookup("SYNTH_EMBEDDING_URL") {
            if !url.trim().is_empty() {
                self.embedding_api_url = Some(url);
            }
        }

        if let Some(model) = lookup("SYNTH_EMBEDDING_MODEL") {
            self.embedding_model = model;
        }

        if let Some(dimension) = lookup("SYNTH_EMBEDDING_DIMENSION") {
            if let Ok(dimension) = dimension.parse() {
                self.embedding_dimension = dimension;
            }
        }

        if let Some(path) = lookup("SYNTH_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Some(interval) = lookup("SYNTH_BACKGROUND_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.background_interval_secs = seconds;
            }
        }

        self
    }
}

/// Non-finite bounds fall back to the defaults; inverted ones are swapped.
fn ordered_bounds(section: &str, (min, max): (f64, f64), defaults: (f64, f64)) -> (f64, f64) {
    if !min.is_finite() || !max.is_finite() {
        tracing::warn!(
            "Non-finite {} temperature bounds ({}, {}), using defaults",
            section,
            min,
            max
        );
        return defaults;
    }
    if min > max {
        tracing::warn!(
            "{} min_temperature {} exceeds max_temperature {}, swapping",
            section,
            min,
            max
        );
        return (max, min);
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_documented_defaults() {
        let config = AgentConfig::from_toml_str("").expect("parse");
        assert_eq!(config.background_interval_secs, 300);
        assert_eq!(config.psyche.emotion.decay_rate, 0.05);
        assert_eq!(config.psyche.assurance.uncertainty_threshold, 0.6);
        assert_eq!(config.psyche.flow.alpha, 0.1);
        assert_eq!(config.psyche.turn.min_temperature, 0.1);
        assert_eq!(config.psyche.turn.max_temperature, 1.5);
        assert_eq!(config.psyche.reflection.interval_turns, 10);
    }

    #[test]
    fn partial_tuning_section_keeps_other_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            llm_model = "mistral"

            [psyche.flow]
            alpha = 0.25

            [psyche.emotion]
            decay_rate = 0.1
            "#,
        )
        .expect("parse");

        assert_eq!(config.llm_model, "mistral");
        assert_eq!(config.psyche.flow.alpha, 0.25);
        assert_eq!(config.psyche.flow.target_min, 0.4);
        assert_eq!(config.psyche.emotion.decay_rate, 0.1);
        assert_eq!(config.psyche.emotion.reward_scale, 0.3);
    }

    #[test]
    fn config_survives_toml_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synth_config.toml");
        let mut config = AgentConfig::default();
        config.psyche.dreaming.dream_count = 3;
        config.save_to(&path).expect("save");

        let text = fs::read_to_string(&path).expect("read back");
        let back = AgentConfig::from_toml_str(&text).expect("parse");
        assert_eq!(back.psyche.dreaming.dream_count, 3);
        assert_eq!(back.system_prompt, config.system_prompt);
    }

    #[test]
    fn inverted_temperature_bounds_are_swapped() {
        let config = AgentConfig::from_toml_str(
            r#"
            [psyche.turn]
            min_temperature = 1.4
            max_temperature = 0.2

            [psyche.flow]
            min_temperature = nan
            "#,
        )
        .expect("parse");

        assert_eq!(config.psyche.turn.min_temperature, 0.2);
        assert_eq!(config.psyche.turn.max_temperature, 1.4);
        assert_eq!(config.psyche.flow.min_temperature, 0.3);
        assert_eq!(config.psyche.flow.max_temperature, 1.0);
        assert_eq!(
            crate::agent::effective_temperature(5.0, 0.0, &config.psyche.turn),
            1.4
        );
    }

    #[test]
    fn load_applies_overrides_once_over_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synth_config.toml");
        fs::write(
            &path,
            "llm_model = \"from-file\"\nbackground_interval_secs = 30\n\n\
             [psyche.turn]\nmin_temperature = 1.2\nmax_temperature = 0.4\n",
        )
        .expect("write");

        let lookup = |key: &str| match key {
            "LLM_MODEL" => Some("from-env".to_string()),
            "SYNTH_EMBEDDING_DIMENSION" => Some("768".to_string()),
            "SYNTH_BACKGROUND_INTERVAL_SECS" => Some("not a number".to_string()),
            _ => None,
        };
        let config = AgentConfig::load_from(&path, lookup);

        assert_eq!(config.llm_model, "from-env");
        assert_eq!(config.embedding_dimension, 768);
        assert_eq!(config.background_interval_secs, 30);
        assert_eq!(config.psyche.turn.min_temperature, 0.4);
        assert_eq!(config.psyche.turn.max_temperature, 1.2);

        let missing = AgentConfig::load_from(&dir.path().join("absent.toml"), |_| None);
        assert_eq!(missing.llm_model, AgentConfig::default().llm_model);
    }
}
