//! Capacity accounting and plugin dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use ses_events::{Event, EventKind, META_DISPATCH, META_GOAL, META_REASON};
use ses_id::DispatchId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExecutionSubstrate, PluginCredential, SubstrateError, WorkloadSpec, WorkloadStatus};
use crate::backoff::ReconnectPolicy;
use crate::model::{Plugin, Resource};

/// Message broker address handed to plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "rabbitmq-server".to_string(),
            port: 5672,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Node capacity. `None` means accounting is unavailable and nothing fits.
    pub capacity: Option<Resource>,

    /// Registry prefix for plugins without an explicit image.
    pub registry: String,

    pub broker: BrokerEndpoint,

    /// Delay between create retries and watch re-opens.
    pub retry: ReconnectPolicy,

    /// Creates attempted before a dispatch is reported failed.
    pub max_create_attempts: u32,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            registry: "waggle".to_string(),
            broker: BrokerEndpoint::default(),
            retry: ReconnectPolicy::default(),
            max_create_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    dispatch: DispatchId,
    resource: Resource,
}

/// Answers "would this plugin fit" and runs plugins on the substrate.
///
/// Capacity is tracked in one node-scoped reservation set keyed by workload
/// name, so a plugin is counted once no matter how many goals name it.
pub struct ResourceManager {
    substrate: Arc<dyn ExecutionSubstrate>,
    config: ResourceManagerConfig,
    reservations: BTreeMap<String, Reservation>,
    events: mpsc::Sender<Event>,
}

impl ResourceManager {
    /// `events` receives launch/complete/fail reports for the loop.
    pub fn new(
        substrate: Arc<dyn ExecutionSubstrate>,
        config: ResourceManagerConfig,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            substrate,
            config,
            reservations: BTreeMap::new(),
            events,
        }
    }

    pub fn capacity(&self) -> Option<Resource> {
        self.config.capacity
    }

    /// Sum of all reservations.
    pub fn reserved(&self) -> Resource {
        self.reservations.values().map(|r| r.resource).sum()
    }

    /// Capacity minus reservations, recomputed on every call.
    pub fn available(&self) -> Option<Resource> {
        self.config
            .capacity
            .map(|capacity| capacity.saturating_sub(&self.reserved()))
    }

    /// True when the plugin's requirement fits what is left.
    ///
    /// Rejects when capacity accounting is unavailable.
    pub fn will_it_fit(&self, plugin: &Plugin) -> bool {
        match self.available() {
            Some(available) => plugin.requirement().fits_within(&available),
            None => false,
        }
    }

    pub fn is_reserved(&self, workload: &str) -> bool {
        self.reservations.contains_key(workload)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Releases a reservation. With a dispatch id, only a reservation made
    /// by that dispatch is released.
    pub fn release(&mut self, workload: &str, dispatch: Option<&DispatchId>) -> Option<Resource> {
        match (self.reservations.get(workload), dispatch) {
            (None, _) => return None,
            (Some(r), Some(d)) if r.dispatch != *d => {
                debug!(workload, dispatch = %d, "Reservation belongs to a newer dispatch");
                return None;
            }
            _ => {}
        }
        let released = self.reservations.remove(workload).map(|r| r.resource);
        debug!(workload, "Released reservation");
        released
    }

    /// Builds the substrate request for a plugin, with a fresh credential.
    pub fn workload_spec(&self, plugin: &Plugin, dispatch: Option<DispatchId>) -> WorkloadSpec {
        let name = plugin.workload_name();
        let version = &plugin.spec.version;
        let credential = PluginCredential::generate(plugin);

        let image = plugin
            .spec
            .image
            .clone()
            .unwrap_or_else(|| format!("{}/{}:{}", self.config.registry, name, version));

        let mut env = plugin.spec.env.clone();
        env.insert(
            "WAGGLE_PLUGIN_NAME".into(),
            format!("{}:{}", plugin.name, version),
        );
        env.insert("WAGGLE_PLUGIN_VERSION".into(), version.clone());
        env.insert("WAGGLE_PLUGIN_USERNAME".into(), credential.username.clone());
        env.insert("WAGGLE_PLUGIN_PASSWORD".into(), credential.password.clone());
        env.insert("WAGGLE_PLUGIN_HOST".into(), self.config.broker.host.clone());
        env.insert(
            "WAGGLE_PLUGIN_PORT".into(),
            self.config.broker.port.to_string(),
        );

        WorkloadSpec {
            name,
            image,
            args: plugin.spec.args.clone(),
            env,
            resource: *plugin.requirement(),
            credential,
            dispatch,
        }
    }

    /// Reserves the plugin's resources and starts it in the background.
    ///
    /// The spawned task creates the workload (retrying transient failures a
    /// bounded number of times) and then follows its status, re-opening a
    /// broken watch after a delay. Every report is sent to the loop with the
    /// goal name and dispatch id in its meta.
    pub fn launch_and_watch_plugin(
        &mut self,
        goal_name: &str,
        plugin: &Plugin,
        dispatch: DispatchId,
    ) -> JoinHandle<()> {
        let spec = self.workload_spec(plugin, Some(dispatch));
        self.reservations.insert(
            spec.name.clone(),
            Reservation {
                dispatch,
                resource: spec.resource,
            },
        );
        info!(
            goal = %goal_name,
            plugin = %plugin.name,
            dispatch = %dispatch,
            image = %spec.image,
            "Launching plugin"
        );

        let task = LaunchTask {
            substrate: Arc::clone(&self.substrate),
            spec,
            plugin_name: plugin.name.clone(),
            goal_name: goal_name.to_string(),
            dispatch,
            events: self.events.clone(),
            retry: self.config.retry,
            max_create_attempts: self.config.max_create_attempts.max(1),
        };
        tokio::spawn(task.run())
    }

    /// Deletes a plugin's workload and releases its reservation.
    pub async fn terminate_plugin(&mut self, workload: &str) -> Result<(), SubstrateError> {
        self.release(workload, None);
        match self.substrate.delete(workload).await {
            Ok(()) | Err(SubstrateError::NotFound(_)) => {
                info!(workload, "Terminated plugin");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes finished workloads and releases their reservations.
    ///
    /// A finished workload whose name is reserved by a newer dispatch is
    /// left for that dispatch to replace. Returns the number deleted.
    pub async fn clean_up(&mut self) -> Result<usize, SubstrateError> {
        let workloads = self.substrate.list().await?;
        let mut cleaned = 0;

        for info in workloads.into_iter().filter(|w| w.phase.is_finished()) {
            if let Some(r) = self.reservations.get(&info.name) {
                if info.dispatch != Some(r.dispatch) {
                    continue;
                }
            }
            match self.substrate.delete(&info.name).await {
                Ok(()) | Err(SubstrateError::NotFound(_)) => {}
                Err(e) => {
                    warn!(workload = %info.name, error = %e, "Failed to delete finished workload");
                    continue;
                }
            }
            self.release(&info.name, info.dispatch.as_ref());
            debug!(workload = %info.name, phase = ?info.phase, "Cleaned up workload");
            cleaned += 1;
        }

        if cleaned > 0 {
            info!(cleaned, "Cleaned up finished workloads");
        }
        Ok(cleaned)
    }
}

// =============================================================================
// Launch task
// =============================================================================

struct LaunchTask {
    substrate: Arc<dyn ExecutionSubstrate>,
    spec: WorkloadSpec,
    plugin_name: String,
    goal_name: String,
    dispatch: DispatchId,
    events: mpsc::Sender<Event>,
    retry: ReconnectPolicy,
    max_create_attempts: u32,
}

impl LaunchTask {
    async fn run(self) {
        if let Err(e) = self.create().await {
            error!(
                plugin = %self.plugin_name,
                error = %e,
                "Failed to launch plugin"
            );
            let event = self
                .event(EventKind::PluginStatusFailed)
                .with_meta(META_REASON, e.to_string());
            let _ = self.events.send(event).await;
            return;
        }
        self.watch().await;
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind, self.plugin_name.as_str())
            .with_meta(META_GOAL, self.goal_name.as_str())
            .with_meta(META_DISPATCH, self.dispatch.to_string())
    }

    async fn create(&self) -> Result<(), SubstrateError> {
        let mut attempt = 0;
        loop {
            match self.substrate.create(&self.spec).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_create_attempts || !e.is_transient() {
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        plugin = %self.plugin_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Create failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn watch(&self) {
        let mut attempt = 0u32;
        let mut launched = false;

        loop {
            match self.substrate.watch(&self.spec.name).await {
                Ok(mut rx) => {
                    attempt = 0;
                    while let Some(status) = rx.recv().await {
                        let terminal = status.is_terminal();
                        let event = match status {
                            WorkloadStatus::Launched if launched => continue,
                            WorkloadStatus::Launched => {
                                launched = true;
                                self.event(EventKind::PluginStatusLaunched)
                            }
                            WorkloadStatus::Completed => {
                                self.event(EventKind::PluginStatusComplete)
                            }
                            WorkloadStatus::Failed(reason) => self
                                .event(EventKind::PluginStatusFailed)
                                .with_meta(META_REASON, reason),
                        };
                        if self.events.send(event).await.is_err() || terminal {
                            return;
                        }
                    }
                    warn!(plugin = %self.plugin_name, "Workload watch ended, re-opening");
                }
                Err(SubstrateError::NotFound(_)) => {
                    debug!(plugin = %self.plugin_name, "Workload gone, stopping watch");
                    return;
                }
                Err(e) => {
                    warn!(plugin = %self.plugin_name, error = %e, "Failed to watch workload");
                }
            }

            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;

    use crate::model::PluginSpec;
    use crate::resource::{MockSubstrate, WorkloadPhase};

    fn test_plugin(name: &str, cpu: f64, memory: f64) -> Plugin {
        Plugin::new(PluginSpec {
            name: name.into(),
            version: "1.0.0".into(),
            resource: Resource::new(cpu, memory, 0.0),
            ..Default::default()
        })
    }

    fn test_manager(
        substrate: Arc<MockSubstrate>,
        capacity: Option<Resource>,
    ) -> (ResourceManager, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(16);
        let config = ResourceManagerConfig {
            capacity,
            retry: ReconnectPolicy::fixed(Duration::from_secs(1)),
            ..Default::default()
        };
        (ResourceManager::new(substrate, config, tx), rx)
    }

    #[test]
    fn test_no_capacity_rejects() {
        let (rm, _rx) = test_manager(Arc::new(MockSubstrate::manual()), None);
        assert!(!rm.will_it_fit(&test_plugin("p", 0.0, 0.0)));
        assert!(rm.available().is_none());
    }

    #[test]
    fn test_workload_spec() {
        let (rm, _rx) = test_manager(Arc::new(MockSubstrate::manual()), None);
        let mut plugin = test_plugin("Cloud-Cover", 1.0, 1.0);
        plugin.spec.env.insert("MODE".into(), "night".into());
        plugin.spec.args = vec!["--interval".into(), "30".into()];

        let spec = rm.workload_spec(&plugin, None);
        assert_eq!(spec.name, "cloud-cover");
        assert_eq!(spec.image, "waggle/cloud-cover:1.0.0");
        assert_eq!(spec.args, plugin.spec.args);
        assert_eq!(spec.env["MODE"], "night");
        assert_eq!(spec.env["WAGGLE_PLUGIN_NAME"], "Cloud-Cover:1.0.0");
        assert_eq!(spec.env["WAGGLE_PLUGIN_VERSION"], "1.0.0");
        assert_eq!(spec.env["WAGGLE_PLUGIN_USERNAME"], "cloud-cover-1.0.0");
        assert_eq!(spec.env["WAGGLE_PLUGIN_PASSWORD"], spec.credential.password);
        assert_eq!(spec.env["WAGGLE_PLUGIN_HOST"], "rabbitmq-server");
        assert_eq!(spec.env["WAGGLE_PLUGIN_PORT"], "5672");

        plugin.spec.image = Some("registry.local/cc:dev".into());
        assert_eq!(rm.workload_spec(&plugin, None).image, "registry.local/cc:dev");
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_reports_and_reserves() {
        let substrate = Arc::new(MockSubstrate::new(Duration::from_secs(5)));
        let (mut rm, mut rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(2.0, 2.0, 0.0)));
        let plugin = test_plugin("cloud-cover", 1.0, 1.0);
        let dispatch = DispatchId::new();

        rm.launch_and_watch_plugin("sky-watch", &plugin, dispatch);
        assert!(rm.is_reserved("cloud-cover"));
        assert_eq!(rm.available(), Some(Resource::new(1.0, 1.0, 0.0)));
        assert!(!rm.will_it_fit(&test_plugin("big", 2.0, 1.0)));

        let launched = rx.recv().await.unwrap();
        assert_eq!(launched.kind, EventKind::PluginStatusLaunched);
        assert_eq!(launched.body, "cloud-cover");
        assert_eq!(launched.goal(), Some("sky-watch"));
        assert_eq!(launched.meta(META_DISPATCH), Some(dispatch.to_string().as_str()));

        let complete = rx.recv().await.unwrap();
        assert_eq!(complete.kind, EventKind::PluginStatusComplete);

        assert_eq!(rm.release("cloud-cover", Some(&dispatch)), Some(Resource::new(1.0, 1.0, 0.0)));
        assert_eq!(rm.available(), Some(Resource::new(2.0, 2.0, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_then_fails() {
        let substrate = Arc::new(MockSubstrate::manual().with_failing_creates(5));
        let (mut rm, mut rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(2.0, 2.0, 0.0)));

        rm.launch_and_watch_plugin("sky-watch", &test_plugin("cloud-cover", 1.0, 1.0), DispatchId::new());
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::PluginStatusFailed);
        assert!(failed.meta(META_REASON).unwrap().contains("refused"));
        assert!(substrate.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retry_recovers() {
        let substrate = Arc::new(MockSubstrate::manual().with_failing_creates(2));
        let (mut rm, mut rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(2.0, 2.0, 0.0)));

        rm.launch_and_watch_plugin("sky-watch", &test_plugin("cloud-cover", 1.0, 1.0), DispatchId::new());
        let launched = rx.recv().await.unwrap();
        assert_eq!(launched.kind, EventKind::PluginStatusLaunched);
        assert_eq!(substrate.created(), vec!["cloud-cover"]);
    }

    #[test]
    fn test_release_respects_dispatch() {
        let (mut rm, _rx) = test_manager(Arc::new(MockSubstrate::manual()), Some(Resource::new(4.0, 4.0, 0.0)));
        let current = DispatchId::new();
        rm.reservations.insert(
            "cloud-cover".into(),
            Reservation {
                dispatch: current,
                resource: Resource::new(1.0, 1.0, 0.0),
            },
        );

        assert!(rm.release("cloud-cover", Some(&DispatchId::new())).is_none());
        assert!(rm.is_reserved("cloud-cover"));
        assert!(rm.release("cloud-cover", Some(&current)).is_some());
        assert!(rm.release("cloud-cover", None).is_none());
    }

    #[tokio::test]
    async fn test_terminate() {
        let substrate = Arc::new(MockSubstrate::manual());
        let (mut rm, _rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(2.0, 2.0, 0.0)));
        let handle =
            rm.launch_and_watch_plugin("sky-watch", &test_plugin("cloud-cover", 1.0, 1.0), DispatchId::new());
        while substrate.phase("cloud-cover").is_none() {
            tokio::task::yield_now().await;
        }

        rm.terminate_plugin("cloud-cover").await.unwrap();
        assert!(!rm.is_reserved("cloud-cover"));
        assert!(substrate.phase("cloud-cover").is_none());
        rm.terminate_plugin("cloud-cover").await.unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_clean_up_finished() {
        let substrate = Arc::new(MockSubstrate::manual());
        let (mut rm, _rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(4.0, 4.0, 0.0)));

        for name in ["cloud-cover", "rain-gauge"] {
            let spec = rm.workload_spec(&test_plugin(name, 1.0, 1.0), None);
            substrate.create(&spec).await.unwrap();
        }
        substrate.complete("cloud-cover").unwrap();

        assert_eq!(rm.clean_up().await.unwrap(), 1);
        assert!(substrate.phase("cloud-cover").is_none());
        assert_eq!(substrate.phase("rain-gauge"), Some(WorkloadPhase::Running));
        assert_eq!(rm.clean_up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_up_releases_lost_reservation() {
        let substrate = Arc::new(MockSubstrate::manual());
        let (mut rm, _rx) =
            test_manager(Arc::clone(&substrate), Some(Resource::new(4.0, 4.0, 0.0)));
        let dispatch = DispatchId::new();
        let plugin = test_plugin("cloud-cover", 1.0, 1.0);
        let spec = rm.workload_spec(&plugin, Some(dispatch));
        rm.reservations.insert(
            spec.name.clone(),
            Reservation {
                dispatch,
                resource: spec.resource,
            },
        );
        substrate.create(&spec).await.unwrap();
        substrate.fail("cloud-cover", "oom").unwrap();

        assert_eq!(rm.clean_up().await.unwrap(), 1);
        assert_eq!(rm.reservation_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_fit_monotonicity(
            capacity in (0.0..16.0f64, 0.0..16.0f64, 0.0..8.0f64),
            running in prop::collection::vec((0.0..4.0f64, 0.0..4.0f64), 0..4),
            requirement in (0.0..16.0f64, 0.0..16.0f64, 0.0..8.0f64),
        ) {
            let capacity = Resource::new(capacity.0, capacity.1, capacity.2);
            let (mut rm, _rx) = test_manager(Arc::new(MockSubstrate::manual()), Some(capacity));
            for (i, (cpu, memory)) in running.iter().enumerate() {
                rm.reservations.insert(
                    format!("running-{i}"),
                    Reservation { dispatch: DispatchId::new(), resource: Resource::new(*cpu, *memory, 0.0) },
                );
            }
            let mut plugin = test_plugin("candidate", 0.0, 0.0);
            plugin.spec.resource = Resource::new(requirement.0, requirement.1, requirement.2);

            let remaining = capacity.saturating_sub(&rm.reserved());
            let exceeds = plugin.spec.resource.cpu > remaining.cpu
                || plugin.spec.resource.memory > remaining.memory
                || plugin.spec.resource.gpu_memory > remaining.gpu_memory;
            if exceeds {
                prop_assert!(!rm.will_it_fit(&plugin));
            }
            if running.is_empty() && plugin.spec.resource.fits_within(&capacity) {
                prop_assert!(rm.will_it_fit(&plugin));
            }
        }
    }
}
