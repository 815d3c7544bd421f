use anyhow::{Context, Result};
use flume::unbounded;
use synth_backend::agent::AgentEvent;
use synth_backend::config::AgentConfig;
use synth_backend::runtime::BackendRuntime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,synth=debug,synth_backend=debug")),
        )
        .init();

    tracing::info!("Synth starting...");

    let config = AgentConfig::load();
    if !AgentConfig::config_path().exists() {
        if let Err(e) = AgentConfig::default().save() {
            tracing::warn!("Could not write a starter config: {}", e);
        }
    }
    let (event_tx, event_rx) = unbounded();
    let mut runtime = BackendRuntime::bootstrap(config, event_tx)
        .await
        .context("failed to bootstrap backend runtime")?;

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                AgentEvent::TurnCompleted(snapshot) => tracing::debug!(
                    "Turn {}: temp {:.2}, valence {:+.2} [{}], uncertainty {:.2}, flow {}, vigilance {}",
                    snapshot.turn_index,
                    snapshot.temperature,
                    snapshot.valence,
                    snapshot.mood_tags.join(", "),
                    snapshot.uncertainty,
                    snapshot.flow_state.as_str(),
                    snapshot.vigilance.as_str()
                ),
                AgentEvent::MilestoneRecorded { turn, description } => {
                    tracing::info!("Milestone at turn {}: {}", turn, description)
                }
            }
        }
    });

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            shutdown.trigger();
        }
    });

    let handle = runtime.shutdown_handle();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !handle.is_triggered() {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = handle.triggered() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match runtime.process_turn(input).await {
            Ok((response, _)) => println!("\nSynth: {}\n", response),
            Err(e) => tracing::warn!("Turn not completed: {}", e),
        }
    }

    runtime.shutdown().await
}
