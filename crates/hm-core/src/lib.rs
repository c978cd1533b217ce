//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Orchestration engine entrypoint."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! The Harbormaster orchestration engine.
//!
//! [`Orchestrator`] sequences a [`hm_spec::ComposeSpec`] using the
//! [`deps`] resolver, drives each service through the [`lifecycle`] state
//! machine (which invokes [`hooks`] and auxiliary containers), and delegates
//! all container work to a [`ContainerBackend`].

pub mod backend;
pub mod deps;
pub mod errors;
pub mod hooks;
pub mod lifecycle;
pub mod orchestrator;

pub use backend::{BackendError, ContainerBackend, ContainerId};
pub use deps::{start_order, stop_order};
pub use errors::{HookCause, HookFailure, LifecycleError, OrchestratorError, StructuralError};
pub use hooks::{HookExecutor, HookResult, HookSettings};
pub use lifecycle::{LifecycleManager, Phase, ServiceState, StartReport, TeardownReport};
pub use orchestrator::{
    DownReport, EngineSettings, Orchestrator, RollbackReport, ServiceFailure,
};
pub use tokio_util::sync::CancellationToken;
