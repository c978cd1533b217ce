//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Fleet orchestration with dependency ordering and startup rollback."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hm_common::EngineConfig;
use hm_spec::{ComposeSpec, HookSlot, ServiceSpec};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, ContainerBackend, ContainerId};
use crate::deps;
use crate::errors::OrchestratorError;
use crate::hooks::{HookExecutor, HookResult, HookSettings};
use crate::lifecycle::{LifecycleManager, ServiceState};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ROLLBACK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub hooks: HookSettings,
    /// Grace period given to containers during `down`.
    pub stop_timeout: Duration,
    /// Grace period given to containers while unwinding a failed `up`.
    pub rollback_stop_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hooks: HookSettings::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            rollback_stop_timeout: DEFAULT_ROLLBACK_STOP_TIMEOUT,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            hooks: HookSettings {
                http_timeout: config.http_timeout,
                retry_base_delay: config.retry_base_delay,
            },
            stop_timeout: config.stop_timeout,
            rollback_stop_timeout: config.rollback_stop_timeout,
        }
    }
}

/// A swallowed failure during rollback or `down`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub operation: &'static str,
    pub error: String,
}

/// What happened while unwinding a failed `up`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Service whose failure triggered the rollback.
    pub failed_service: Option<String>,
    /// Services torn down, in the order they were processed.
    pub rolled_back: Vec<String>,
    pub failures: Vec<ServiceFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownReport {
    pub stopped: Vec<String>,
    /// Services that were never started by this orchestrator.
    pub skipped: Vec<String>,
    pub failures: Vec<ServiceFailure>,
}

impl DownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Brings a [`ComposeSpec`] up in dependency order and tears it down in
/// reverse. A failed `up` rolls back every service it started before
/// returning the original error.
pub struct Orchestrator {
    backend: Arc<dyn ContainerBackend>,
    lifecycle: LifecycleManager,
    settings: EngineSettings,
    running: Mutex<IndexMap<String, ContainerId>>,
    last_rollback: Mutex<Option<RollbackReport>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("running", &self.running.lock().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        settings: EngineSettings,
    ) -> Result<Self, OrchestratorError> {
        let hooks = HookExecutor::new(settings.hooks, Arc::clone(&backend))
            .map_err(OrchestratorError::HttpClient)?;
        Ok(Self {
            lifecycle: LifecycleManager::new(hooks, Arc::clone(&backend)),
            backend,
            settings,
            running: Mutex::new(IndexMap::new()),
            last_rollback: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Start every service in dependency order.
    ///
    /// Structural problems are reported before anything runs. On the first
    /// startup failure the services started by this call are rolled back in
    /// reverse start order and the originating error is returned; rollback
    /// problems only land in [`Orchestrator::last_rollback`].
    pub async fn up(
        &self,
        spec: &ComposeSpec,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let order = deps::start_order(&spec.services)?;
        info!(
            services = order.len(),
            backend = self.backend.name(),
            "bringing services up"
        );

        let mut started: Vec<String> = Vec::with_capacity(order.len());
        for name in &order {
            let Some(service) = spec.service(name) else {
                continue;
            };
            let outcome = if token.is_cancelled() {
                Err(OrchestratorError::Cancelled)
            } else {
                self.bring_up(name, service, token).await
            };
            if let Err(err) = outcome {
                error!(service = %name, error = %err, "startup failed, rolling back");
                let report = self.rollback(spec, &started, name).await;
                if !report.failures.is_empty() {
                    warn!(
                        failures = report.failures.len(),
                        "rollback completed with failures"
                    );
                }
                *self.last_rollback.lock() = Some(report);
                return Err(err);
            }
            started.push(name.clone());
        }

        info!(services = started.len(), "all services running");
        Ok(())
    }

    /// Tear every started service down in reverse dependency order. Individual
    /// failures are logged and collected; the loop always runs to the end.
    pub async fn down(
        &self,
        spec: &ComposeSpec,
        token: &CancellationToken,
    ) -> Result<DownReport, OrchestratorError> {
        let order = deps::stop_order(&spec.services)?;
        info!(services = order.len(), "bringing services down");
        let mut report = DownReport::default();

        for name in &order {
            let container = self.running.lock().get(name).cloned();
            let (Some(service), Some(container)) = (spec.service(name), container) else {
                debug!(service = %name, "service was not started, skipping");
                report.skipped.push(name.clone());
                continue;
            };

            match self.lifecycle.stop_service(name, service, token).await {
                Ok(teardown) => {
                    report
                        .failures
                        .extend(teardown.failures.into_iter().map(|error| ServiceFailure {
                            service: name.clone(),
                            operation: "teardown",
                            error,
                        }));
                }
                Err(err) => {
                    warn!(service = %name, error = %err, "lifecycle teardown failed");
                    report.failures.push(ServiceFailure {
                        service: name.clone(),
                        operation: "teardown",
                        error: err.to_string(),
                    });
                }
            }

            self.stop_and_remove(name, &container, self.settings.stop_timeout, &mut report.failures)
                .await;
            self.running.lock().shift_remove(name);
            report.stopped.push(name.clone());
        }

        info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "services down"
        );
        Ok(report)
    }

    /// Run one hook slot of `service` once per hook and report each outcome.
    pub async fn run_hooks(
        &self,
        service: &ServiceSpec,
        slot: HookSlot,
        token: &CancellationToken,
    ) -> Vec<HookResult> {
        self.lifecycle.run_hook_slot(service, slot, token).await
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.lifecycle.service_state(name)
    }

    pub fn snapshot(&self) -> HashMap<String, ServiceState> {
        self.lifecycle.snapshot()
    }

    /// Containers created by this orchestrator and not yet pruned by `down`.
    /// Entries survive a rollback or a failed `complete_start` cleanup, so an
    /// entry does not mean the container still exists.
    pub fn running_containers(&self) -> IndexMap<String, ContainerId> {
        self.running.lock().clone()
    }

    pub fn last_rollback(&self) -> Option<RollbackReport> {
        self.last_rollback.lock().clone()
    }

    pub async fn close(&self) -> Result<(), BackendError> {
        debug!(backend = self.backend.name(), "closing backend");
        self.backend.close().await
    }

    async fn bring_up(
        &self,
        name: &str,
        service: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        self.lifecycle.begin_start(name, service, token).await?;

        let container = match self.backend.create_service(name, service).await {
            Ok(container) => container,
            Err(source) => {
                return Err(self.lifecycle.fail(
                    name,
                    OrchestratorError::Backend {
                        operation: "create",
                        service: name.to_string(),
                        source,
                    },
                ))
            }
        };
        debug!(service = name, container = %container, "container created");

        if let Err(source) = self.backend.start(&container).await {
            if let Err(err) = self.backend.remove(&container).await {
                warn!(service = name, container = %container, error = %err, "failed to remove container after start failure");
            }
            return Err(self.lifecycle.fail(
                name,
                OrchestratorError::Backend {
                    operation: "start",
                    service: name.to_string(),
                    source,
                },
            ));
        }
        self.running
            .lock()
            .insert(name.to_string(), container.clone());
        info!(service = name, container = %container, "container started");

        match self.lifecycle.complete_start(name, service, token).await {
            Ok(report) => {
                if !report.post_container_failures.is_empty() {
                    warn!(
                        service = name,
                        failures = report.post_container_failures.len(),
                        "service running with failed post containers"
                    );
                }
                Ok(())
            }
            Err(err) => {
                let mut ignored = Vec::new();
                self.stop_and_remove(
                    name,
                    &container,
                    self.settings.rollback_stop_timeout,
                    &mut ignored,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn rollback(
        &self,
        spec: &ComposeSpec,
        started: &[String],
        failed_service: &str,
    ) -> RollbackReport {
        let mut report = RollbackReport {
            failed_service: Some(failed_service.to_string()),
            ..RollbackReport::default()
        };
        // The caller's token may be the reason we are here.
        let token = CancellationToken::new();

        for name in started.iter().rev() {
            info!(service = %name, "rolling back service");
            let container = self.running.lock().get(name).cloned();
            if let Some(container) = container {
                self.stop_and_remove(
                    name,
                    &container,
                    self.settings.rollback_stop_timeout,
                    &mut report.failures,
                )
                .await;
            }
            if let Some(service) = spec.service(name) {
                match self.lifecycle.stop_service(name, service, &token).await {
                    Ok(teardown) => {
                        report.failures.extend(teardown.failures.into_iter().map(|error| {
                            ServiceFailure {
                                service: name.clone(),
                                operation: "teardown",
                                error,
                            }
                        }));
                    }
                    Err(err) => {
                        warn!(service = %name, error = %err, "rollback teardown failed");
                        report.failures.push(ServiceFailure {
                            service: name.clone(),
                            operation: "teardown",
                            error: err.to_string(),
                        });
                    }
                }
            }
            report.rolled_back.push(name.clone());
        }
        report
    }

    async fn stop_and_remove(
        &self,
        name: &str,
        container: &ContainerId,
        grace: Duration,
        failures: &mut Vec<ServiceFailure>,
    ) {
        let timeout_secs = u32::try_from(grace.as_secs()).unwrap_or(u32::MAX);
        if let Err(err) = self.backend.stop(container, timeout_secs).await {
            warn!(service = name, container = %container, error = %err, "failed to stop container");
            failures.push(ServiceFailure {
                service: name.to_string(),
                operation: "stop",
                error: err.to_string(),
            });
        }
        if let Err(err) = self.backend.remove(container).await {
            warn!(service = name, container = %container, error = %err, "failed to remove container");
            failures.push(ServiceFailure {
                service: name.to_string(),
                operation: "remove",
                error: err.to_string(),
            });
        }
    }
}
