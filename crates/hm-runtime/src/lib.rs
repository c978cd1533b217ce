//! ---
//! hm_section: "04-container-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Container backend implementations and backend selection."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Concrete [`ContainerBackend`] implementations for the Harbormaster engine.

use std::sync::Arc;

use hm_common::BackendKind;
use hm_core::{BackendError, ContainerBackend};
use tracing::warn;

pub mod docker;
pub mod stub;

pub use docker::DockerBackend;
pub use stub::StubBackend;

/// Resolve a backend for the requested kind. `Auto` tries Docker and falls
/// back to [`StubBackend`] when the daemon cannot be reached.
pub async fn connect(kind: BackendKind) -> Result<Arc<dyn ContainerBackend>, BackendError> {
    match kind {
        BackendKind::Stub => Ok(Arc::new(StubBackend::new())),
        BackendKind::Docker => Ok(Arc::new(DockerBackend::connect().await?)),
        BackendKind::Auto => match DockerBackend::connect().await {
            Ok(docker) => Ok(Arc::new(docker)),
            Err(err) => {
                warn!(error = %err, "docker unavailable, falling back to stub backend");
                Ok(Arc::new(StubBackend::new()))
            }
        },
    }
}
