//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "tests"
//! hm_type: "source"
//! hm_scope: "test"
//! hm_description: "Scripted in-memory container backend shared by the engine test suites."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hm_core::{BackendError, CancellationToken, ContainerBackend, ContainerId};
use hm_spec::{InitContainerSpec, PostContainerSpec, ServiceSpec};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Backend that records every call as `op:target` and fails on demand.
///
/// Keys passed to [`ScriptedBackend::fail`] use the same shape as the recorded
/// calls: `init:<service>:<name>`, `create:<service>`, `start:<service>`,
/// `stop:<service>`, `remove:<service>`, `post:<service>:<name>`. A delayed
/// init or post container interrupted by cancellation is recorded as
/// `cleanup:<key>` instead.
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
    exec_failures_remaining: AtomicU32,
    exec_calls: Mutex<Vec<Instant>>,
    post_runs: Mutex<Vec<(String, Instant)>>,
    init_delay: Mutex<Option<Duration>>,
    post_delay: Mutex<Option<Duration>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, key: &str) {
        self.failures.lock().insert(key.to_string());
    }

    /// Make the next `count` exec calls fail.
    pub fn fail_exec_times(&self, count: u32) {
        self.exec_failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Make every init container take `delay` to complete.
    pub fn delay_init(&self, delay: Duration) {
        *self.init_delay.lock() = Some(delay);
    }

    /// Make every post container take `delay` to complete.
    pub fn delay_post(&self, delay: Duration) {
        *self.post_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn exec_instants(&self) -> Vec<Instant> {
        self.exec_calls.lock().clone()
    }

    pub fn post_runs(&self) -> Vec<(String, Instant)> {
        self.post_runs.lock().clone()
    }

    async fn run_for(
        &self,
        delay: Option<Duration>,
        call: &str,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        let Some(delay) = delay else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.calls.lock().push(format!("cleanup:{call}"));
                Err(BackendError::Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn record(&self, call: String) -> Result<(), BackendError> {
        let failing = self.failures.lock().contains(&call);
        self.calls.lock().push(call.clone());
        if failing {
            Err(BackendError::NonZeroExit {
                container: call,
                code: 1,
                logs: "scripted failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

fn service_of(id: &ContainerId) -> &str {
    id.as_str().strip_prefix("ctr-").unwrap_or(id.as_str())
}

#[async_trait]
impl ContainerBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_service(
        &self,
        service: &str,
        _spec: &ServiceSpec,
    ) -> Result<ContainerId, BackendError> {
        self.record(format!("create:{service}"))?;
        Ok(ContainerId::new(format!("ctr-{service}")))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.record(format!("start:{}", service_of(id)))
    }

    async fn stop(&self, id: &ContainerId, _timeout_secs: u32) -> Result<(), BackendError> {
        self.record(format!("stop:{}", service_of(id)))
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.record(format!("remove:{}", service_of(id)))
    }

    async fn run_init_container(
        &self,
        service: &str,
        spec: &InitContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        let call = format!("init:{service}:{}", spec.name);
        let delay = *self.init_delay.lock();
        self.run_for(delay, &call, token).await?;
        self.record(call)
    }

    async fn run_post_container(
        &self,
        service: &str,
        spec: &PostContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        let call = format!("post:{service}:{}", spec.name);
        self.post_runs.lock().push((call.clone(), Instant::now()));
        let delay = *self.post_delay.lock();
        self.run_for(delay, &call, token).await?;
        self.record(call)
    }

    async fn exec(&self, container: &str, _command: &[String]) -> Result<(), BackendError> {
        self.exec_calls.lock().push(Instant::now());
        self.calls.lock().push(format!("exec:{container}"));
        let remaining = self.exec_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.exec_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::NonZeroExit {
                container: container.to_string(),
                code: 2,
                logs: String::new(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.calls.lock().push("close".to_string());
        Ok(())
    }
}
