use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agent::background::spawn_ticker;
use crate::agent::{AgentEvent, SynthContext, TurnOrchestrator, TurnSnapshot};
use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::embedding::{embedder_from_config, Embedder};
use crate::llm_client::{Generator, LlmClient};
use crate::memory::MemoryStore;

/// Flips the shared shutdown flag. Cloneable so a signal handler can hold one.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

pub struct BackendRuntime {
    pub config: AgentConfig,
    orchestrator: TurnOrchestrator,
    shutdown: ShutdownHandle,
    ticker: Option<JoinHandle<()>>,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Sender<AgentEvent>,
    generator: Option<Arc<dyn Generator>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn MemoryStore>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            generator: None,
            embedder: None,
            store: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the capability context, restore persisted state, start the ticker.
    pub async fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let generator: Arc<dyn Generator> = match self.generator {
            Some(generator) => generator,
            None => {
                let client = LlmClient::from_config(&config);
                tracing::info!("Generation via {} ({})", config.llm_api_url, client.model());
                Arc::new(client)
            }
        };
        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::from(embedder_from_config(&config)),
        };
        let store: Arc<dyn MemoryStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                AgentDatabase::new(&config.database_path, embedder.clone())
                    .context("Failed to open memory store")?,
            ),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut orchestrator = TurnOrchestrator::new(
            SynthContext {
                generator,
                embedder,
                store,
            },
            &config,
            self.event_tx,
            shutdown_rx.clone(),
        );
        orchestrator
            .restore_state()
            .await
            .context("Failed to restore persisted state")?;

        let period = Duration::from_secs(config.background_interval_secs.max(1));
        let ticker = spawn_ticker(period, orchestrator.background_sender(), shutdown_rx);
        tracing::info!("Background ticker every {:?}", period);

        Ok(BackendRuntime {
            config,
            orchestrator,
            shutdown: ShutdownHandle {
                tx: Arc::new(shutdown_tx),
            },
            ticker: Some(ticker),
        })
    }
}

impl BackendRuntime {
    pub async fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build().await
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    pub async fn process_turn(&mut self, user_input: &str) -> Result<(String, TurnSnapshot)> {
        self.orchestrator.process_turn(user_input).await
    }

    /// Stop the ticker, apply what it already queued, and flush state.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!("Shutting down at turn {}", self.orchestrator.turn_index());
        self.shutdown.trigger();

        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                tracing::warn!("Background ticker ended abnormally: {}", e);
            }
        }

        self.orchestrator.drain_background().await;
        self.orchestrator
            .finish_session()
            .await
            .context("Failed to persist state at shutdown")?;

        let report = self.orchestrator.status_report().await;
        match serde_json::to_string(&report) {
            Ok(json) => tracing::info!("Session report: {}", json),
            Err(e) => tracing::warn!("Session report not serializable: {}", e),
        }
        tracing::info!("State saved ({})", self.orchestrator.emotion().describe());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedEmbedder, ScriptedGenerator};

    fn config_in(dir: &tempfile::TempDir) -> AgentConfig {
        AgentConfig {
            database_path: dir.path().join("synth.db").to_string_lossy().into_owned(),
            llm_narrative_synthesis: false,
            ..AgentConfig::default()
        }
    }

    async fn runtime(config: AgentConfig, replies: &[&str]) -> BackendRuntime {
        let (event_tx, _event_rx) = flume::unbounded();
        BackendRuntimeBuilder::new(config, event_tx)
            .with_generator(Arc::new(ScriptedGenerator::with_replies(replies.iter().copied())))
            .with_embedder(Arc::new(FixedEmbedder::new(32)))
            .build()
            .await
            .expect("runtime")
    }

    #[tokio::test]
    async fn shutdown_persists_and_bootstrap_restores() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut first = runtime(config_in(&dir), &["Glad to help with that question."]).await;
        first.process_turn("thanks, that was great").await.expect("turn");
        let handle = first.shutdown_handle();
        assert!(!handle.is_triggered());
        first.shutdown().await.expect("shutdown");
        assert!(handle.is_triggered());

        let second = runtime(config_in(&dir), &[]).await;
        let orchestrator = second.orchestrator();
        assert_eq!(orchestrator.turn_index(), 1);
        assert_eq!(orchestrator.narrative().purpose_metrics().sessions_completed, 1);
        second.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn triggered_handle_stops_further_turns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rt = runtime(config_in(&dir), &["unused"]).await;

        rt.shutdown_handle().trigger();
        assert!(rt.process_turn("hello").await.is_err());
        rt.shutdown().await.expect("shutdown");
    }
}
