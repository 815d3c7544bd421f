use std::time::Duration;

use flume::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Work the ticker asks the turn sequence to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundEvent {
    Decay,
    CheckDrift,
}

/// Post `Decay` then `CheckDrift` every `period` until shutdown flips.
///
/// The ticker never touches agent state itself; the orchestrator drains the
/// queue at the start of each turn and on shutdown.
pub fn spawn_ticker(
    period: Duration,
    tx: Sender<BackgroundEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::trace!("Background tick");
                    if tx.send(BackgroundEvent::Decay).is_err()
                        || tx.send(BackgroundEvent::CheckDrift).is_err()
                    {
                        tracing::debug!("Background queue closed, stopping ticker");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Background ticker stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_posts_decay_then_drift_until_shutdown() {
        let (tx, rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_ticker(Duration::from_millis(20), tx, shutdown_rx);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv_async()).await;
        assert_eq!(first.ok().and_then(Result::ok), Some(BackgroundEvent::Decay));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv_async()).await;
        assert_eq!(second.ok().and_then(Result::ok), Some(BackgroundEvent::CheckDrift));

        shutdown_tx.send(true).expect("ticker alive");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ticker stops")
            .expect("ticker joined");
    }
}
