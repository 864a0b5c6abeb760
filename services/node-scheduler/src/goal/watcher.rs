//! Goal watcher task.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{GoalSource, SourceEvent};
use crate::backoff::ReconnectPolicy;

/// Follows `source` and forwards every update to the orchestration loop.
///
/// A failed subscription or an ended stream is retried after the policy's
/// delay. Nothing is replayed across a reconnect. Returns on shutdown or
/// when the loop stops listening.
pub async fn run_goal_watcher(
    source: Arc<dyn GoalSource>,
    tx: mpsc::Sender<SourceEvent>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting goal watcher");
    let mut attempt = 0u32;

    loop {
        let subscribed = tokio::select! {
            result = source.subscribe() => result,
            _ = shutdown.changed() => break,
        };

        match subscribed {
            Ok(mut rx) => {
                attempt = 0;
                info!("Subscribed to goal source");
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => {
                                debug!(kind = ?event.kind, "Goal source event");
                                if tx.send(event).await.is_err() {
                                    info!("Scheduler gone, goal watcher exiting");
                                    return;
                                }
                            }
                            None => {
                                warn!("Goal source stream ended");
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            info!("Goal watcher shutting down");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, attempt, "Failed to subscribe to goal source");
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to goal source");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("Goal watcher shutting down");
}
