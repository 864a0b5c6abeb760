//! Execution substrate seam and a mock implementation.
//!
//! The substrate actually runs plugins. The scheduler needs only four
//! operations from it: create, list and delete by name, plus a status watch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use ses_id::DispatchId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::PluginCredential;
use crate::model::Resource;

/// Everything the substrate needs to run one plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    /// Lower-cased plugin name.
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resource: Resource,
    pub credential: PluginCredential,
    /// Label tying the workload to the dispatch that created it.
    pub dispatch: Option<DispatchId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub name: String,
    pub phase: WorkloadPhase,
    pub dispatch: Option<DispatchId>,
}

/// What a status watch yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Launched,
    Completed,
    Failed(String),
}

impl WorkloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkloadStatus::Launched)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("workload {0} already exists")]
    AlreadyExists(String),

    #[error("substrate unavailable: {0}")]
    Unavailable(String),

    #[error("workload rejected: {0}")]
    Rejected(String),
}

impl SubstrateError {
    /// Worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubstrateError::Unavailable(_))
    }
}

#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Creates and starts a workload.
    async fn create(&self, spec: &WorkloadSpec) -> Result<(), SubstrateError>;

    /// Lists all workloads this scheduler created.
    async fn list(&self) -> Result<Vec<WorkloadInfo>, SubstrateError>;

    /// Deletes a workload, stopping it if it runs.
    async fn delete(&self, name: &str) -> Result<(), SubstrateError>;

    /// Streams status changes of a workload, starting with its current
    /// status. The stream ends after a terminal status or when the workload
    /// is deleted.
    async fn watch(&self, name: &str) -> Result<mpsc::Receiver<WorkloadStatus>, SubstrateError>;
}

// =============================================================================
// Mock substrate
// =============================================================================

#[derive(Debug, Clone)]
struct MockState {
    phase: WorkloadPhase,
    reason: Option<String>,
}

impl MockState {
    fn status(&self) -> Option<WorkloadStatus> {
        match self.phase {
            WorkloadPhase::Pending => None,
            WorkloadPhase::Running => Some(WorkloadStatus::Launched),
            WorkloadPhase::Succeeded => Some(WorkloadStatus::Completed),
            WorkloadPhase::Failed => Some(WorkloadStatus::Failed(
                self.reason.clone().unwrap_or_else(|| "workload failed".into()),
            )),
        }
    }
}

struct MockWorkload {
    generation: u64,
    spec: WorkloadSpec,
    state: watch::Sender<MockState>,
}

#[derive(Default)]
struct MockInner {
    workloads: HashMap<String, MockWorkload>,
    next_generation: u64,
    created: Vec<String>,
}

/// In-memory substrate for simulation and tests.
///
/// Workloads start running on create. With a run time they finish on their
/// own; in manual mode they run until [`MockSubstrate::complete`] or
/// [`MockSubstrate::fail`] is called.
pub struct MockSubstrate {
    inner: Arc<Mutex<MockInner>>,
    run_time: Option<Duration>,
    fail_runs: bool,
    failing_creates: AtomicU32,
}

impl MockSubstrate {
    /// Runs succeed after `run_time`.
    pub fn new(run_time: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            run_time: Some(run_time),
            fail_runs: false,
            failing_creates: AtomicU32::new(0),
        }
    }

    /// Runs never finish on their own.
    pub fn manual() -> Self {
        Self {
            run_time: None,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Timed runs end in failure.
    pub fn with_failing_runs(mut self) -> Self {
        self.fail_runs = true;
        self
    }

    /// The next `count` creates fail with a transient error.
    pub fn with_failing_creates(self, count: u32) -> Self {
        self.failing_creates.store(count, Ordering::SeqCst);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockInner>, SubstrateError> {
        self.inner
            .lock()
            .map_err(|_| SubstrateError::Unavailable("mock state poisoned".into()))
    }

    /// Marks a running workload as succeeded.
    pub fn complete(&self, name: &str) -> Result<(), SubstrateError> {
        self.finish(name, WorkloadPhase::Succeeded, None)
    }

    /// Marks a running workload as failed.
    pub fn fail(&self, name: &str, reason: &str) -> Result<(), SubstrateError> {
        self.finish(name, WorkloadPhase::Failed, Some(reason.to_string()))
    }

    fn finish(
        &self,
        name: &str,
        phase: WorkloadPhase,
        reason: Option<String>,
    ) -> Result<(), SubstrateError> {
        let inner = self.lock()?;
        let workload = inner
            .workloads
            .get(name)
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?;
        workload.state.send_replace(MockState { phase, reason });
        Ok(())
    }

    /// Names passed to successful creates, in order.
    pub fn created(&self) -> Vec<String> {
        self.lock().map(|i| i.created.clone()).unwrap_or_default()
    }

    /// The spec a workload was created with.
    pub fn spec(&self, name: &str) -> Option<WorkloadSpec> {
        self.lock()
            .ok()
            .and_then(|i| i.workloads.get(name).map(|w| w.spec.clone()))
    }

    pub fn phase(&self, name: &str) -> Option<WorkloadPhase> {
        self.lock()
            .ok()
            .and_then(|i| i.workloads.get(name).map(|w| w.state.borrow().phase))
    }
}

#[async_trait]
impl ExecutionSubstrate for MockSubstrate {
    async fn create(&self, spec: &WorkloadSpec) -> Result<(), SubstrateError> {
        let refused = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SubstrateError::Unavailable(
                "mock substrate refused create".into(),
            ));
        }

        let generation = {
            let mut inner = self.lock()?;
            if let Some(existing) = inner.workloads.get(&spec.name) {
                if !existing.state.borrow().phase.is_finished() {
                    return Err(SubstrateError::AlreadyExists(spec.name.clone()));
                }
            }
            let generation = inner.next_generation;
            inner.next_generation += 1;
            let (state, _) = watch::channel(MockState {
                phase: WorkloadPhase::Running,
                reason: None,
            });
            inner.workloads.insert(
                spec.name.clone(),
                MockWorkload {
                    generation,
                    spec: spec.clone(),
                    state,
                },
            );
            inner.created.push(spec.name.clone());
            generation
        };

        info!(workload = %spec.name, image = %spec.image, "[MOCK] Workload started");

        if let Some(run_time) = self.run_time {
            let inner = Arc::clone(&self.inner);
            let name = spec.name.clone();
            let (phase, reason) = if self.fail_runs {
                (WorkloadPhase::Failed, Some("mock run failed".to_string()))
            } else {
                (WorkloadPhase::Succeeded, None)
            };
            tokio::spawn(async move {
                tokio::time::sleep(run_time).await;
                if let Ok(inner) = inner.lock() {
                    if let Some(w) = inner.workloads.get(&name) {
                        if w.generation == generation {
                            debug!(workload = %name, ?phase, "[MOCK] Workload finished");
                            w.state.send_replace(MockState { phase, reason });
                        }
                    }
                }
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkloadInfo>, SubstrateError> {
        let inner = self.lock()?;
        let mut infos: Vec<_> = inner
            .workloads
            .iter()
            .map(|(name, w)| WorkloadInfo {
                name: name.clone(),
                phase: w.state.borrow().phase,
                dispatch: w.spec.dispatch,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn delete(&self, name: &str) -> Result<(), SubstrateError> {
        let removed = self.lock()?.workloads.remove(name);
        match removed {
            Some(_) => {
                info!(workload = %name, "[MOCK] Workload deleted");
                Ok(())
            }
            None => Err(SubstrateError::NotFound(name.to_string())),
        }
    }

    async fn watch(&self, name: &str) -> Result<mpsc::Receiver<WorkloadStatus>, SubstrateError> {
        let mut state = {
            let inner = self.lock()?;
            inner
                .workloads
                .get(name)
                .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?
                .state
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut last: Option<WorkloadStatus> = None;
            loop {
                let current = state.borrow_and_update().status();
                if let Some(status) = current {
                    if last.as_ref() != Some(&status) {
                        let terminal = status.is_terminal();
                        if tx.send(status.clone()).await.is_err() || terminal {
                            return;
                        }
                        last = Some(status);
                    }
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
