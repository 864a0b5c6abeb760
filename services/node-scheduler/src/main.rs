//! Node scheduler
//!
//! Runs on every edge node and decides which science goal plugins run there.
//!
//! ## Tasks
//!
//! - **Goal watcher**: follows the goal source and forwards job template updates
//! - **Rule engine channels**: registers goal rules, receives plugin contexts
//! - **Telemetry forwarder**: ships plugin status records, best effort
//! - **Status API**: read-only view of the goal table
//! - **Orchestration loop**: the only owner of goal and plugin state

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ses_node_scheduler::api::{self, ApiState};
use ses_node_scheduler::config::LogFormat;
use ses_node_scheduler::goal::run_goal_watcher;
use ses_node_scheduler::knowledgebase::{run_event_listener, run_request_channel, Knowledgebase};
use ses_node_scheduler::telemetry::{
    run_telemetry_forwarder, HttpTransport, LogTransport, TelemetrySink, TelemetryTransport,
};
use ses_node_scheduler::{
    Config, GoalSource, MockSubstrate, NodeGoalManager, NodeScheduler, ResourceManager,
    SchedulerInputs, SimpleSchedulingPolicy, CHANNEL_CAPACITY,
};

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        node_id = %config.node_id,
        simulate = config.simulate,
        capacity = ?config.capacity(),
        rule_mode = ?config.rule_mode(),
        "Starting node scheduler"
    );

    if !config.simulate {
        error!("No cluster substrate is available; run with --simulate");
        bail!("no execution substrate configured");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconnect = config.reconnect_policy();

    // Execution substrate
    let substrate = Arc::new(MockSubstrate::new(Duration::from_secs(config.mock_run_secs)));

    // Goal source
    let Some(source) = config.goal_source() else {
        error!("No goal file configured; run with --goal-file");
        bail!("no goal source configured");
    };
    info!(path = ?config.goal_file, "Watching goal file");
    let source: Arc<dyn GoalSource> = Arc::new(source);
    let (goal_tx, goal_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let watcher_handle = tokio::spawn(run_goal_watcher(
        source,
        goal_tx,
        reconnect,
        shutdown_rx.clone(),
    ));

    // Rule engine
    let (context_tx, context_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let knowledgebase = if config.no_rules {
        info!("Rule engine disabled, promoting plugins unconditionally");
        None
    } else {
        let (kb_tx, kb_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_request_channel(
            config.kb_request_socket.clone(),
            kb_rx,
            reconnect,
            config.kb_reply_timeout(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_event_listener(
            config.kb_event_socket.clone(),
            context_tx.clone(),
            reconnect,
            shutdown_rx.clone(),
        ));
        Some(Knowledgebase::new(kb_tx))
    };

    // Telemetry
    let (telemetry, telemetry_rx) = TelemetrySink::new(CHANNEL_CAPACITY);
    let transport: Arc<dyn TelemetryTransport> = match &config.telemetry_url {
        Some(url) => Arc::new(HttpTransport::new(url.clone())?),
        None => Arc::new(LogTransport),
    };
    tokio::spawn(run_telemetry_forwarder(
        telemetry_rx,
        transport,
        shutdown_rx.clone(),
    ));

    // Status API
    let (query_tx, query_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let api_handle = tokio::spawn(api::serve(
        config.listen_addr,
        ApiState {
            node_id: config.node_id.clone(),
            queries: query_tx,
        },
        shutdown_rx.clone(),
    ));

    // Orchestration loop
    let (status_tx, status_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let resources = ResourceManager::new(substrate, config.resource_manager_config(), status_tx);
    let mut scheduler = NodeScheduler::new(
        NodeGoalManager::new(config.node_id.clone(), config.goal_key.clone()),
        SimpleSchedulingPolicy::new(config.rule_mode()),
        resources,
        telemetry,
    )
    .with_gc_interval(config.gc_interval());
    if let Some(kb) = knowledgebase {
        scheduler = scheduler.with_knowledgebase(kb);
    }
    let inputs = SchedulerInputs {
        goals: goal_rx,
        statuses: status_rx,
        contexts: context_rx,
        queries: query_rx,
    };
    let loop_handle = tokio::spawn(scheduler.run(inputs, shutdown_rx.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => info!("Status API exited"),
                Ok(Err(e)) => error!(error = %e, "Status API error"),
                Err(e) => error!(error = %e, "Status API task panicked"),
            }
        }
        _ = watcher_handle => {
            info!("Goal watcher exited");
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);
    drop(context_tx);

    info!("Waiting for tasks to shut down...");
    let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;

    info!("Node scheduler shutdown complete");
    Ok(())
}
