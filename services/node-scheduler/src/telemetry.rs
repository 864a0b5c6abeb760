//! Best-effort telemetry egress.
//!
//! Publishing never blocks the loop: records go into a bounded queue that a
//! background task drains into a transport. A full queue or a failed send is
//! logged and the record dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ses_events::TelemetryRecord;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn send(&self, record: &TelemetryRecord) -> Result<()>;
}

/// POSTs each record as JSON.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build telemetry HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn send(&self, record: &TelemetryRecord) -> Result<()> {
        self.client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .context("telemetry request failed")?
            .error_for_status()
            .context("telemetry endpoint rejected record")?;
        Ok(())
    }
}

/// Emits each record as a log line.
pub struct LogTransport;

#[async_trait]
impl TelemetryTransport for LogTransport {
    async fn send(&self, record: &TelemetryRecord) -> Result<()> {
        info!(
            name = %record.name,
            value = %record.value,
            timestamp = record.timestamp_ns,
            meta = ?record.meta,
            "Telemetry"
        );
        Ok(())
    }
}

/// Non-blocking handle for publishing records.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<TelemetryRecord>,
}

impl TelemetrySink {
    /// Returns the sink and the queue the forwarder drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn publish(&self, record: TelemetryRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(name = %record.name, "Telemetry queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!(name = %record.name, "Telemetry forwarder gone, dropping record");
            }
        }
    }
}

/// Drains the telemetry queue into `transport` until shutdown.
pub async fn run_telemetry_forwarder(
    mut rx: mpsc::Receiver<TelemetryRecord>,
    transport: Arc<dyn TelemetryTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                if let Err(e) = transport.send(&record).await {
                    warn!(name = %record.name, error = %e, "Failed to deliver telemetry");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Telemetry forwarder stopped");
}
