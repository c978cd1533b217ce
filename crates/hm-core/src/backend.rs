//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Container backend abstraction consumed by the orchestration engine."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::fmt;

use async_trait::async_trait;
use hm_spec::{InitContainerSpec, PostContainerSpec, ServiceSpec};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Opaque identifier issued by a backend for a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ContainerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Errors surfaced by a [`ContainerBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The runtime rejected or failed an API call.
    #[error("{operation} failed: {source}")]
    Runtime {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A run-to-completion container exited unsuccessfully.
    #[error("container {container} exited with code {code}{}", format_logs(.logs))]
    NonZeroExit {
        container: String,
        code: i64,
        logs: String,
    },
    /// A run-to-completion container was interrupted and has been removed.
    #[error("container run cancelled")]
    Cancelled,
    #[error("container {0} not found")]
    NotFound(String),
    /// The runtime could not be reached at all.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("invalid container request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn runtime<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            operation,
            source: Box::new(source),
        }
    }
}

fn format_logs(logs: &str) -> String {
    let trimmed = logs.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; logs: {trimmed}")
    }
}

/// Narrow container interface the engine drives. Implementations must be safe
/// to share across tasks; the engine never holds a backend lock across calls.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Short identifier used in logs (`docker`, `stub`, ...).
    fn name(&self) -> &str;

    /// Create (but do not start) the main container for `service`.
    async fn create_service(
        &self,
        service: &str,
        spec: &ServiceSpec,
    ) -> Result<ContainerId, BackendError>;

    async fn start(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// Stop a container, allowing it `timeout_secs` to exit gracefully.
    async fn stop(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), BackendError>;

    async fn remove(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// Run an init container to completion. A non-zero exit is an error.
    ///
    /// When `token` fires first the container must be removed before
    /// returning [`BackendError::Cancelled`].
    async fn run_init_container(
        &self,
        service: &str,
        spec: &InitContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError>;

    /// Run a post container to completion. Any `wait_for` delay has already
    /// elapsed by the time this is called. Cancellation follows
    /// [`ContainerBackend::run_init_container`].
    async fn run_post_container(
        &self,
        service: &str,
        spec: &PostContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError>;

    /// Execute `command` inside a running container identified by name or id.
    async fn exec(&self, container: &str, command: &[String]) -> Result<(), BackendError>;

    /// Release client resources.
    async fn close(&self) -> Result<(), BackendError>;
}
