//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Error taxonomy for the orchestration engine."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use hm_spec::HookKind;
use thiserror::Error;

use crate::backend::BackendError;
use crate::lifecycle::Phase;

/// Malformed dependency graph. Raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("service {service} depends on undefined service {dependency}")]
    MissingDependency { service: String, dependency: String },
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Why a single hook invocation failed.
#[derive(Debug, Error)]
pub enum HookCause {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process exited with {0}")]
    Exit(std::process::ExitStatus),
    #[error("HTTP request returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("exec failed: {0}")]
    Backend(#[from] BackendError),
    #[error("invalid hook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A hook that ultimately failed, with its name and kind attached.
#[derive(Debug, Error)]
#[error("hook {hook} ({kind}) failed: {cause}")]
pub struct HookFailure {
    pub hook: String,
    pub kind: HookKind,
    #[source]
    pub cause: HookCause,
}

impl HookFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, HookCause::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("service {0} has no lifecycle state")]
    UnknownService(String),
    #[error("service {service} is already active in phase {phase}")]
    AlreadyActive { service: String, phase: Phase },
    #[error("service {service}: invalid transition from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: Phase,
        to: Phase,
    },
}

/// Top-level error returned from startup and shutdown operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("service {service}: init container {container} failed: {source}")]
    InitContainer {
        service: String,
        container: String,
        #[source]
        source: BackendError,
    },
    #[error("service {service}: {source}")]
    Hook {
        service: String,
        #[source]
        source: HookFailure,
    },
    #[error("service {service}: post container {container} failed: {source}")]
    PostContainer {
        service: String,
        container: String,
        #[source]
        source: BackendError,
    },
    #[error("service {service}: {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        service: String,
        #[source]
        source: BackendError,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl OrchestratorError {
    /// Service the error is attributed to, when there is one.
    pub fn service(&self) -> Option<&str> {
        match self {
            OrchestratorError::InitContainer { service, .. }
            | OrchestratorError::Hook { service, .. }
            | OrchestratorError::PostContainer { service, .. }
            | OrchestratorError::Backend { service, .. } => Some(service),
            OrchestratorError::Structural(StructuralError::MissingDependency { service, .. }) => {
                Some(service)
            }
            OrchestratorError::Lifecycle(LifecycleError::UnknownService(service))
            | OrchestratorError::Lifecycle(LifecycleError::AlreadyActive { service, .. })
            | OrchestratorError::Lifecycle(LifecycleError::InvalidTransition { service, .. }) => {
                Some(service)
            }
            OrchestratorError::Structural(StructuralError::Cycle { .. })
            | OrchestratorError::Cancelled
            | OrchestratorError::HttpClient(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            OrchestratorError::Cancelled => true,
            OrchestratorError::Hook { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
