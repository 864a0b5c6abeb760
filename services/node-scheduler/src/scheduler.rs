//! The orchestration loop.
//!
//! One task, one `select!` over every input queue. Each event is handled to
//! completion before the next is taken, so goal and plugin state is never
//! mutated concurrently. Everything else in the process only produces events.

use std::time::Duration;

use ses_events::{ContextStatus, Event, EventKind, META_DISPATCH, META_GOAL, META_REASON};
use ses_id::DispatchId;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::StatusQuery;
use crate::goal::{NodeGoalManager, SourceEvent};
use crate::knowledgebase::Knowledgebase;
use crate::model::SchedulingStatus;
use crate::policy::{SchedulingPolicy, Selection};
use crate::resource::ResourceManager;
use crate::telemetry::TelemetrySink;
use crate::transition::Transition;

/// Default period of the garbage collection tick.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Receiving ends of the loop's input queues.
pub struct SchedulerInputs {
    /// Updates from the goal watcher.
    pub goals: mpsc::Receiver<SourceEvent>,
    /// Launch/complete/fail reports from the resource manager.
    pub statuses: mpsc::Receiver<Event>,
    /// Runnability notifications from the rule engine.
    pub contexts: mpsc::Receiver<Event>,
    /// Reads from the status surface.
    pub queries: mpsc::Receiver<StatusQuery>,
}

pub struct NodeScheduler {
    goals: NodeGoalManager,
    policy: Box<dyn SchedulingPolicy>,
    resources: ResourceManager,
    knowledgebase: Option<Knowledgebase>,
    telemetry: TelemetrySink,
    triggers_tx: mpsc::Sender<Event>,
    triggers_rx: mpsc::Receiver<Event>,
    active_goal: Option<String>,
    gc_interval: Duration,
}

impl NodeScheduler {
    pub fn new(
        goals: NodeGoalManager,
        policy: impl SchedulingPolicy + 'static,
        resources: ResourceManager,
        telemetry: TelemetrySink,
    ) -> Self {
        // Capacity 1: a pending trigger already covers any later request.
        let (triggers_tx, triggers_rx) = mpsc::channel(1);
        Self {
            goals,
            policy: Box::new(policy),
            resources,
            knowledgebase: None,
            telemetry,
            triggers_tx,
            triggers_rx,
            active_goal: None,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }

    /// Registers goal rules with the rule engine on every goal change.
    pub fn with_knowledgebase(mut self, knowledgebase: Knowledgebase) -> Self {
        self.knowledgebase = Some(knowledgebase);
        self
    }

    pub fn with_gc_interval(mut self, gc_interval: Duration) -> Self {
        self.gc_interval = gc_interval;
        self
    }

    pub fn goals(&self) -> &NodeGoalManager {
        &self.goals
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Id of the goal behind the last goal change.
    pub fn active_goal(&self) -> Option<&str> {
        self.active_goal.as_deref()
    }

    /// Takes a pending scheduling trigger without running it.
    pub fn take_trigger(&mut self) -> Option<Event> {
        self.triggers_rx.try_recv().ok()
    }

    /// Runs until shutdown.
    pub async fn run(mut self, mut inputs: SchedulerInputs, mut shutdown: watch::Receiver<bool>) {
        info!(
            node_id = %self.goals.node_id(),
            gc_interval_secs = self.gc_interval.as_secs(),
            "Starting orchestration loop"
        );

        let mut gc = tokio::time::interval(self.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(update) = inputs.goals.recv() => {
                    self.handle_goal_source_event(update).await;
                }
                Some(event) = inputs.statuses.recv() => {
                    self.handle_event(event).await;
                }
                Some(event) = inputs.contexts.recv() => {
                    self.handle_event(event).await;
                }
                Some(event) = self.triggers_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = gc.tick() => {
                    self.collect_garbage().await;
                }
                Some(query) = inputs.queries.recv() => {
                    self.answer(query);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Orchestration loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Applies a goal source update and reacts to the resulting goal event.
    pub async fn handle_goal_source_event(&mut self, update: SourceEvent) {
        for event in self.goals.apply_source_event(&update) {
            self.handle_event(event).await;
        }
    }

    /// Routes one event.
    pub async fn handle_event(&mut self, event: Event) {
        debug!(event = %event.kind, body = %event.body, "Event received");
        match event.kind {
            EventKind::GoalNew | EventKind::GoalUpdated | EventKind::GoalRemoved => {
                self.on_goal_changed(event).await;
            }
            EventKind::PluginStatusLaunched
            | EventKind::PluginStatusComplete
            | EventKind::PluginStatusFailed => {
                self.on_plugin_status(event);
            }
            EventKind::PluginStatusStopped => {
                debug!(plugin = %event.body, "Ignoring stopped report");
            }
            EventKind::PluginContextRunnable | EventKind::PluginContextStoppable => {
                self.on_plugin_context(event).await;
            }
            EventKind::SchedulingTick | EventKind::SchedulingNeeded => {
                self.schedule_pass();
            }
        }
    }

    async fn on_goal_changed(&mut self, event: Event) {
        if let Err(e) = self.resources.clean_up().await {
            warn!(error = %e, "Failed to clean up workloads");
        }
        self.active_goal = Some(event.goal().unwrap_or(&event.body).to_string());

        if event.kind != EventKind::GoalRemoved {
            if let (Some(kb), Some(goal)) = (&self.knowledgebase, self.goals.get_goal(&event.body)) {
                if let Err(e) = kb.register_rules(goal, self.goals.node_id()) {
                    warn!(goal = %goal.name, error = %e, "Failed to register rules");
                }
            }
        }

        self.request_scheduling(event.kind);
    }

    fn on_plugin_status(&mut self, event: Event) {
        let transition = match event.kind {
            EventKind::PluginStatusLaunched => Transition::Launched,
            EventKind::PluginStatusComplete => Transition::Completed,
            EventKind::PluginStatusFailed => Transition::Failed,
            _ => return,
        };
        let dispatch = event
            .meta(META_DISPATCH)
            .and_then(|d| d.parse::<DispatchId>().ok());

        let released = match transition {
            Transition::Completed | Transition::Failed => self
                .resources
                .release(&event.body.to_lowercase(), dispatch.as_ref())
                .is_some(),
            _ => false,
        };

        let Some((goal_name, plugin)) = self.goals.find_plugin_mut(event.goal(), &event.body)
        else {
            warn!(
                plugin = %event.body,
                goal = event.goal().unwrap_or_default(),
                event = %event.kind,
                "Could not find plugin to update status"
            );
            if released {
                self.request_scheduling(event.kind);
            }
            return;
        };

        if let Some(dispatch) = dispatch {
            if plugin.status.dispatch != Some(dispatch) {
                debug!(
                    goal = %goal_name,
                    plugin = %plugin.name,
                    dispatch = %dispatch,
                    "Report belongs to an earlier dispatch"
                );
                if released {
                    self.request_scheduling(event.kind);
                }
                return;
            }
        }

        match plugin.apply(transition) {
            Ok(status) => {
                info!(
                    goal = %goal_name,
                    plugin = %plugin.name,
                    status = %status,
                    reason = event.meta(META_REASON).unwrap_or_default(),
                    "Plugin status updated"
                );
            }
            Err(e) => {
                warn!(goal = %goal_name, plugin = %plugin.name, error = %e, "Dropping status report");
                return;
            }
        }

        self.telemetry.publish(event.to_telemetry());
        self.request_scheduling(event.kind);
    }

    async fn on_plugin_context(&mut self, event: Event) {
        let context = match event.kind {
            EventKind::PluginContextRunnable => ContextStatus::Runnable,
            EventKind::PluginContextStoppable => ContextStatus::Stoppable,
            _ => return,
        };

        let Some((goal_name, plugin)) = self.goals.find_plugin_mut(event.goal(), &event.body)
        else {
            warn!(plugin = %event.body, "Context event for unknown plugin");
            return;
        };
        plugin.set_context(context);

        if context == ContextStatus::Runnable {
            if plugin.scheduling() == SchedulingStatus::Stopped {
                match plugin.apply(Transition::Resume) {
                    Ok(_) => info!(goal = %goal_name, plugin = %plugin.name, "Stopped plugin is runnable again"),
                    Err(e) => warn!(goal = %goal_name, plugin = %plugin.name, error = %e, "Cannot resume plugin"),
                }
            }
            self.request_scheduling(event.kind);
            return;
        }

        if plugin.scheduling() != SchedulingStatus::Running {
            debug!(goal = %goal_name, plugin = %plugin.name, "Stoppable plugin is not running");
            return;
        }
        if let Err(e) = plugin.apply(Transition::Stop) {
            warn!(goal = %goal_name, plugin = %plugin.name, error = %e, "Cannot stop plugin");
            return;
        }
        let workload = plugin.workload_name();
        let stopped =
            Event::new(EventKind::PluginStatusStopped, plugin.name.as_str()).with_meta(META_GOAL, goal_name.as_str());
        info!(goal = %goal_name, plugin = %plugin.name, "Plugin has been triggered to stop");

        self.telemetry.publish(stopped.to_telemetry());
        if let Err(e) = self.resources.terminate_plugin(&workload).await {
            error!(plugin = %workload, error = %e, "Failed to terminate plugin");
        }
        self.request_scheduling(event.kind);
    }

    /// Promotes, selects and dispatches at most one plugin.
    ///
    /// Returns the dispatched selection. After a dispatch another pass is
    /// requested so remaining Ready plugins get their turn.
    pub fn schedule_pass(&mut self) -> Option<Selection> {
        let mut promoted = 0;
        for sub_goal in self.goals.local_sub_goals_mut() {
            promoted += self.policy.promote_plugins(sub_goal);
        }
        if promoted > 0 {
            debug!(promoted, "Promoted plugins");
        }

        let Some(available) = self.resources.available() else {
            debug!("Node capacity unknown, not dispatching");
            return None;
        };
        let resources = &self.resources;
        let Some(selection) = self.policy.select_best_task(
            self.goals.goals(),
            &available,
            self.goals.node_id(),
            &|workload| resources.is_reserved(workload),
        ) else {
            debug!("No eligible task");
            return None;
        };

        let (goal_name, plugin) = self
            .goals
            .find_plugin_mut(Some(selection.goal_name.as_str()), &selection.plugin_name)?;
        if !self.resources.will_it_fit(plugin) {
            debug!(plugin = %plugin.name, "Resource is not available for plugin");
            return None;
        }

        let dispatch = DispatchId::new();
        plugin.mark_dispatched(dispatch);
        self.resources
            .launch_and_watch_plugin(&goal_name, plugin, dispatch);

        self.policy.record_dispatch(&selection);
        self.request_scheduling(EventKind::SchedulingNeeded);
        Some(selection)
    }

    /// Periodic reconciliation against the substrate.
    pub async fn collect_garbage(&mut self) {
        match self.resources.clean_up().await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Garbage collection failed"),
        }
        self.request_scheduling(EventKind::SchedulingTick);
    }

    /// Answers a status read with a copy of the table.
    pub fn answer(&self, query: StatusQuery) {
        match query {
            StatusQuery::Goals(reply) => {
                let _ = reply.send(self.goals.snapshot());
            }
            StatusQuery::Goal(name, reply) => {
                let _ = reply.send(self.goals.get_goal(&name).cloned());
            }
        }
    }

    fn request_scheduling(&self, reason: EventKind) {
        let trigger = Event::new(EventKind::SchedulingNeeded, reason.as_str());
        match self.triggers_tx.try_send(trigger) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(reason = %reason, "Scheduling already pending");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
