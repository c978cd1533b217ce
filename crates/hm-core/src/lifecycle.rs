//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Per-service lifecycle state machine driving hooks and auxiliary containers."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hm_spec::{HookSlot, PostContainerSpec, ServiceSpec};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ContainerBackend};
use crate::errors::{HookFailure, LifecycleError, OrchestratorError};
use crate::hooks::{HookExecutor, HookResult};

/// Lifecycle phases in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    PreStart,
    Start,
    PostStart,
    Running,
    PreStop,
    Stop,
    PostStop,
    Stopped,
}

impl Phase {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreStart => "pre-start",
            Phase::Start => "start",
            Phase::PostStart => "post-start",
            Phase::Running => "running",
            Phase::PreStop => "pre-stop",
            Phase::Stop => "stop",
            Phase::PostStop => "post-stop",
            Phase::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Stopped)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const STATUS_STARTING: &str = "Starting";
pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_STOPPING: &str = "Stopping";
pub const STATUS_STOPPED: &str = "Stopped";
pub const STATUS_ERROR: &str = "Error";

/// Observable state of one service. Callers only ever receive clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    pub phase: Phase,
    pub status: String,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub init_completed: bool,
    pub post_completed: bool,
}

impl ServiceState {
    fn starting(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: Phase::PreStart,
            status: STATUS_STARTING.to_string(),
            last_error: None,
            started_at: Some(Utc::now()),
            stopped_at: None,
            init_completed: false,
            post_completed: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == STATUS_ERROR
    }
}

/// Non-fatal problems observed while completing a start.
#[derive(Debug, Default)]
pub struct StartReport {
    pub service: String,
    pub post_container_failures: Vec<OrchestratorError>,
}

/// Outcome of a teardown. Teardown never fails on hook or container errors;
/// they are logged and listed here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub service: String,
    /// The service was already stopped and nothing ran.
    pub skipped: bool,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives services through [`Phase`] and owns every [`ServiceState`].
pub struct LifecycleManager {
    hooks: HookExecutor,
    backend: Arc<dyn ContainerBackend>,
    states: Mutex<HashMap<String, ServiceState>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("hooks", &self.hooks)
            .field("services", &self.states.lock().len())
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(hooks: HookExecutor, backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            hooks,
            backend,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn hooks(&self) -> &HookExecutor {
        &self.hooks
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.states.lock().get(name).cloned()
    }

    /// Copy of every tracked state.
    pub fn snapshot(&self) -> HashMap<String, ServiceState> {
        self.states.lock().clone()
    }

    /// Start sequence up to the container boundary: register, run init
    /// containers, run `pre_start` hooks, then enter [`Phase::Start`].
    pub async fn begin_start(
        &self,
        name: &str,
        spec: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        self.register(name)?;
        info!(service = name, "starting service");

        for init in &spec.init_containers {
            info!(service = name, container = %init.name, "running init container");
            if token.is_cancelled() {
                return Err(self.fail(name, OrchestratorError::Cancelled));
            }
            match self.backend.run_init_container(name, init, token).await {
                Err(BackendError::Cancelled) => {
                    return Err(self.fail(name, OrchestratorError::Cancelled))
                }
                Err(source) => {
                    return Err(self.fail(
                        name,
                        OrchestratorError::InitContainer {
                            service: name.to_string(),
                            container: init.name.clone(),
                            source,
                        },
                    ))
                }
                Ok(()) => {
                    debug!(service = name, container = %init.name, "init container completed");
                }
            }
        }
        self.update(name, |state| state.init_completed = true);

        self.run_start_hooks(name, spec, HookSlot::PreStart, token)
            .await?;
        self.advance(name, Phase::Start)?;
        Ok(())
    }

    /// Start sequence after the main container is up: `post_start` hooks, then
    /// success-path post containers, then [`Phase::Running`].
    pub async fn complete_start(
        &self,
        name: &str,
        spec: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<StartReport, OrchestratorError> {
        self.advance(name, Phase::PostStart)?;
        self.run_start_hooks(name, spec, HookSlot::PostStart, token)
            .await?;

        let mut report = StartReport {
            service: name.to_string(),
            ..StartReport::default()
        };
        for post in spec.post_containers.iter().filter(|post| post.on_success) {
            match self.run_post_container(name, post, token).await {
                Ok(()) => {}
                Err(OrchestratorError::Cancelled) => {
                    return Err(self.fail(name, OrchestratorError::Cancelled))
                }
                Err(err) => {
                    warn!(service = name, container = %post.name, error = %err, "post container failed");
                    report.post_container_failures.push(err);
                }
            }
        }
        let all_succeeded = report.post_container_failures.is_empty();

        self.advance(name, Phase::Running)?;
        self.update(name, |state| {
            state.post_completed = all_succeeded;
            state.status = STATUS_RUNNING.to_string();
        });
        info!(service = name, "service running");
        Ok(report)
    }

    /// Both halves of the start sequence without a container in between.
    pub async fn start_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<StartReport, OrchestratorError> {
        self.begin_start(name, spec, token).await?;
        self.complete_start(name, spec, token).await
    }

    /// Teardown sequence. Hook and post container failures are logged and
    /// reported, never returned. A service already stopped is left untouched.
    pub async fn stop_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<TeardownReport, LifecycleError> {
        let mut report = TeardownReport {
            service: name.to_string(),
            ..TeardownReport::default()
        };
        let current = self
            .service_state(name)
            .ok_or_else(|| LifecycleError::UnknownService(name.to_string()))?;
        if current.phase.is_terminal() {
            debug!(service = name, "service already stopped");
            report.skipped = true;
            return Ok(report);
        }

        info!(service = name, "stopping service");
        self.advance(name, Phase::PreStop)?;
        self.update(name, |state| state.status = STATUS_STOPPING.to_string());
        if let Err(failure) = self
            .hooks
            .execute_hooks(spec.hooks_for(HookSlot::PreStop), token)
            .await
        {
            warn!(service = name, error = %failure, "pre_stop hooks failed");
            report.failures.push(failure.to_string());
        }

        self.advance(name, Phase::Stop)?;
        self.advance(name, Phase::PostStop)?;
        if let Err(failure) = self
            .hooks
            .execute_hooks(spec.hooks_for(HookSlot::PostStop), token)
            .await
        {
            warn!(service = name, error = %failure, "post_stop hooks failed");
            report.failures.push(failure.to_string());
        }

        for post in spec.post_containers.iter().filter(|post| post.on_failure) {
            if let Err(err) = self.run_post_container(name, post, token).await {
                warn!(service = name, container = %post.name, error = %err, "teardown post container failed");
                report.failures.push(err.to_string());
            }
        }

        self.advance(name, Phase::Stopped)?;
        self.update(name, |state| {
            state.status = STATUS_STOPPED.to_string();
            state.stopped_at = Some(Utc::now());
        });
        info!(service = name, failures = report.failures.len(), "service stopped");
        Ok(report)
    }

    /// Run one hook slot for `spec` once per hook, recording each outcome.
    pub async fn run_hook_slot(
        &self,
        spec: &ServiceSpec,
        slot: HookSlot,
        token: &CancellationToken,
    ) -> Vec<HookResult> {
        self.hooks
            .execute_hooks_with_results(spec.hooks_for(slot), token)
            .await
    }

    /// Record a failure on `name` and hand the error back.
    pub(crate) fn fail(&self, name: &str, err: OrchestratorError) -> OrchestratorError {
        let message = err.to_string();
        self.update(name, |state| {
            state.status = STATUS_ERROR.to_string();
            state.last_error = Some(message);
        });
        warn!(service = name, error = %err, "service start failed");
        err
    }

    fn register(&self, name: &str) -> Result<(), LifecycleError> {
        let mut states = self.states.lock();
        match states.get_mut(name) {
            Some(existing) if !existing.phase.is_terminal() && !existing.is_failed() => {
                Err(LifecycleError::AlreadyActive {
                    service: name.to_string(),
                    phase: existing.phase,
                })
            }
            Some(existing) => {
                *existing = ServiceState::starting(name);
                Ok(())
            }
            None => {
                states.insert(name.to_string(), ServiceState::starting(name));
                Ok(())
            }
        }
    }

    fn advance(&self, name: &str, to: Phase) -> Result<(), LifecycleError> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownService(name.to_string()))?;
        if to <= state.phase {
            return Err(LifecycleError::InvalidTransition {
                service: name.to_string(),
                from: state.phase,
                to,
            });
        }
        debug!(service = name, from = %state.phase, to = %to, "phase transition");
        state.phase = to;
        Ok(())
    }

    fn update<F>(&self, name: &str, apply: F)
    where
        F: FnOnce(&mut ServiceState),
    {
        if let Some(state) = self.states.lock().get_mut(name) {
            apply(state);
        }
    }

    async fn run_start_hooks(
        &self,
        name: &str,
        spec: &ServiceSpec,
        slot: HookSlot,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let hooks = spec.hooks_for(slot);
        if hooks.is_empty() {
            return Ok(());
        }
        info!(service = name, slot = %slot, count = hooks.len(), "running hooks");
        self.hooks
            .execute_hooks(hooks, token)
            .await
            .map_err(|failure| self.fail(name, hook_error(name, failure)))
    }

    /// Honour `wait_for`, then run the container. The delay races `token`; the
    /// backend observes it while the container runs so it can clean up.
    async fn run_post_container(
        &self,
        name: &str,
        post: &PostContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if let Some(delay) = post.wait_for {
            debug!(service = name, container = %post.name, delay_ms = delay.as_millis() as u64, "waiting before post container");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        info!(service = name, container = %post.name, "running post container");
        match self.backend.run_post_container(name, post, token).await {
            Ok(()) => Ok(()),
            Err(BackendError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(source) => Err(OrchestratorError::PostContainer {
                service: name.to_string(),
                container: post.name.clone(),
                source,
            }),
        }
    }
}

fn hook_error(service: &str, failure: HookFailure) -> OrchestratorError {
    if failure.is_cancelled() {
        OrchestratorError::Cancelled
    } else {
        OrchestratorError::Hook {
            service: service.to_string(),
            source: failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_strictly_ordered() {
        let order = [
            Phase::PreStart,
            Phase::Start,
            Phase::PostStart,
            Phase::Running,
            Phase::PreStop,
            Phase::Stop,
            Phase::PostStop,
            Phase::Stopped,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].ordinal() + 1, pair[1].ordinal());
        }
        assert!(Phase::Stopped.is_terminal());
        assert_eq!(Phase::PostStart.to_string(), "post-start");
    }
}
