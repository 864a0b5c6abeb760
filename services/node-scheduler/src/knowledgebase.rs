//! Rule engine ("knowledgebase") IPC.
//!
//! Two Unix sockets: a request channel the scheduler connects to, carrying
//! one JSON request and one JSON reply per line, and an event channel the
//! scheduler listens on, carrying runnability notifications.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ses_events::{Event, KbRequest, PluginContextEvent};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::model::ScienceGoal;

#[derive(Debug, Error)]
pub enum KnowledgebaseError {
    #[error("rule engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule engine message error: {0}")]
    Message(#[from] serde_json::Error),

    #[error("rule engine closed the connection")]
    Closed,

    #[error("rule engine did not reply within {0:?}")]
    Timeout(Duration),

    #[error("request queue unavailable")]
    QueueUnavailable,
}

/// Handle for queueing requests to the rule engine.
#[derive(Debug, Clone)]
pub struct Knowledgebase {
    requests: mpsc::Sender<KbRequest>,
}

impl Knowledgebase {
    pub fn new(requests: mpsc::Sender<KbRequest>) -> Self {
        Self { requests }
    }

    /// Queues the rules of this node's sub-goal under the goal's id.
    ///
    /// Returns `false` when the sub-goal has no rules. Never blocks.
    pub fn register_rules(
        &self,
        goal: &ScienceGoal,
        node_id: &str,
    ) -> Result<bool, KnowledgebaseError> {
        let Some(sub_goal) = goal.my_sub_goal(node_id).filter(|s| s.has_rules()) else {
            return Ok(false);
        };
        let request = KbRequest::rule(goal.id.to_string(), &sub_goal.science_rules);
        self.requests
            .try_send(request)
            .map_err(|_| KnowledgebaseError::QueueUnavailable)?;
        debug!(goal = %goal.name, rules = sub_goal.science_rules.len(), "Queued rule registration");
        Ok(true)
    }
}

// =============================================================================
// Request channel
// =============================================================================

/// Sends queued requests over the request socket until shutdown.
///
/// A request that fails mid-exchange, or whose reply does not arrive within
/// `reply_timeout`, is retried on the next connection.
pub async fn run_request_channel(
    path: PathBuf,
    mut requests: mpsc::Receiver<KbRequest>,
    policy: ReconnectPolicy,
    reply_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = %path.display(), "Starting rule engine request channel");
    let mut pending: Option<KbRequest> = None;
    let mut attempt = 0u32;

    loop {
        let connected = tokio::select! {
            result = UnixStream::connect(&path) => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(stream) => {
                attempt = 0;
                info!(path = %path.display(), "Connected to rule engine");
                let (read, mut write) = stream.into_split();
                let mut replies = BufReader::new(read).lines();

                loop {
                    let request = match pending.take() {
                        Some(request) => request,
                        None => tokio::select! {
                            request = requests.recv() => match request {
                                Some(request) => request,
                                None => return,
                            },
                            _ = shutdown.changed() => return,
                        },
                    };

                    let reply = tokio::select! {
                        reply = exchange(&mut write, &mut replies, &request, reply_timeout) => reply,
                        _ = shutdown.changed() => return,
                    };
                    match reply {
                        Ok(reply) if reply.return_code != 0 => {
                            warn!(
                                command = %request.command,
                                return_code = reply.return_code,
                                result = %reply.result,
                                "Rule engine rejected request"
                            );
                        }
                        Ok(_) => debug!(command = %request.command, "Rule engine accepted request"),
                        Err(e) => {
                            warn!(error = %e, "Rule engine exchange failed, reconnecting");
                            pending = Some(request);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, attempt, "Rule engine not reachable");
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn exchange(
    write: &mut OwnedWriteHalf,
    replies: &mut Lines<BufReader<OwnedReadHalf>>,
    request: &KbRequest,
    reply_timeout: Duration,
) -> Result<KbRequest, KnowledgebaseError> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    write.write_all(&line).await?;

    let reply = tokio::time::timeout(reply_timeout, replies.next_line())
        .await
        .map_err(|_| KnowledgebaseError::Timeout(reply_timeout))??
        .ok_or(KnowledgebaseError::Closed)?;
    Ok(serde_json::from_str(&reply)?)
}

// =============================================================================
// Event channel
// =============================================================================

/// Listens for runnability notifications and forwards them to the loop.
///
/// Plugin names are lower-cased. Unparsable lines and `unknown` verdicts are
/// skipped. A failed bind is retried after the policy's delay.
pub async fn run_event_listener(
    path: PathBuf,
    tx: mpsc::Sender<Event>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = %path.display(), "Starting rule engine event listener");
    let mut attempt = 0u32;

    loop {
        match bind(&path).await {
            Ok(listener) => {
                attempt = 0;
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                tokio::spawn(forward_events(stream, tx.clone()));
                            }
                            Err(e) => {
                                error!(error = %e, "Rule engine event listener failed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            let _ = tokio::fs::remove_file(&path).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to bind rule engine event socket");
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn bind(path: &Path) -> std::io::Result<UnixListener> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

async fn forward_events(stream: UnixStream, tx: mpsc::Sender<Event>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Rule engine event connection failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let context = match PluginContextEvent::from_line(&line) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, line = %line, "Skipping malformed rule engine event");
                continue;
            }
        };
        let Some(event) = context.to_event() else {
            debug!(plugin = %context.plugin_name, "Ignoring unknown plugin context");
            continue;
        };
        debug!(plugin = %context.plugin_name, status = ?context.status, "Plugin context event");
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
