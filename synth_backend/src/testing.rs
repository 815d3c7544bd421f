//! Test doubles for the capability traits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::reflection::ReflectionRecord;
use crate::database::AgentDatabase;
use crate::embedding::{Embedder, HashingEmbedder};
use crate::llm_client::{GenerationError, Generator};
use crate::memory::{EpisodicRecord, MemoryStore, UncertaintyLogEntry, UncertaintyStats};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub temperature: f32,
    pub system: Option<String>,
}

/// Replies by prompt substring first, then from a FIFO script.
/// Anything unmatched once the script runs dry is an `EmptyResponse` error.
#[derive(Default)]
pub struct ScriptedGenerator {
    routes: Vec<(String, String)>,
    script: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<RecordedCall>>,
    always_fail: bool,
}

impl ScriptedGenerator {
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn route(mut self, needle: &str, reply: &str) -> Self {
        self.routes.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        _max_tokens: u32,
        system: Option<&str>,
    ) -> Result<String, GenerationError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: prompt.to_string(),
                temperature,
                system: system.map(str::to_string),
            });
        }

        if self.always_fail {
            return Err(GenerationError::Status {
                status: 503,
                body: "scripted outage".to_string(),
            });
        }

        if let Some((_, reply)) = self.routes.iter().find(|(needle, _)| prompt.contains(needle)) {
            return Ok(reply.clone());
        }

        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .ok_or(GenerationError::EmptyResponse)
    }
}

/// Fixed vectors for registered texts, hashing for everything else.
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: HashingEmbedder,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback: HashingEmbedder::new(dimension),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.embed_sync(text)))
    }
}

pub fn temp_store(embedder: Arc<dyn Embedder>) -> (tempfile::TempDir, Arc<dyn MemoryStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = AgentDatabase::new(dir.path().join("synth.db"), embedder).expect("db init");
    (dir, Arc::new(db))
}

/// A store whose writes always fail and whose reads are neutral.
pub struct FailingStore {
    grounding: f64,
}

impl Default for FailingStore {
    fn default() -> Self {
        Self { grounding: 0.5 }
    }
}

impl FailingStore {
    /// Same failures, but grounding lookups answer `grounding`.
    pub fn grounded(grounding: f64) -> Self {
        Self { grounding }
    }
}

#[async_trait]
impl MemoryStore for FailingStore {
    async fn store_episodic(&self, _: &str, _: serde_json::Value, _: f64) -> Result<()> {
        anyhow::bail!("disk full")
    }

    async fn recent_episodes(&self, _: usize) -> Result<Vec<EpisodicRecord>> {
        anyhow::bail!("disk full")
    }

    async fn store_persistent(&self, _: &str, _: serde_json::Value) -> Result<()> {
        anyhow::bail!("disk full")
    }

    async fn retrieve_persistent(&self, _: &str) -> Result<Option<serde_json::Value>> {
        anyhow::bail!("disk full")
    }

    async fn store_turn(&self, _: &str, _: &str) -> Result<u64> {
        anyhow::bail!("disk full")
    }

    fn current_turn(&self) -> u64 {
        0
    }

    async fn store_semantic(&self, _: &str, _: &str, _: f64) -> Result<i64> {
        anyhow::bail!("disk full")
    }

    async fn grounding_confidence(&self, _: &str) -> f64 {
        self.grounding
    }

    async fn detect_coherence_drift(&self, _: f64) -> bool {
        false
    }

    async fn log_uncertainty(&self, _: UncertaintyLogEntry) -> Result<i64> {
        anyhow::bail!("disk full")
    }

    async fn mark_uncertainty_resolved(&self, _: i64, _: &str) -> Result<()> {
        anyhow::bail!("disk full")
    }

    async fn uncertainty_stats(&self) -> Result<UncertaintyStats> {
        anyhow::bail!("disk full")
    }

    async fn append_reflection(&self, _: &ReflectionRecord) -> Result<()> {
        anyhow::bail!("disk full")
    }

    async fn reflection_log(&self, _: usize) -> Result<Vec<ReflectionRecord>> {
        anyhow::bail!("disk full")
    }
}
