//! ---
//! hm_section: "04-container-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "No-op backend used for dry runs and environments without Docker."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use async_trait::async_trait;
use hm_core::{BackendError, CancellationToken, ContainerBackend, ContainerId};
use hm_spec::{InitContainerSpec, PostContainerSpec, ServiceSpec};
use tracing::info;

/// Backend that logs every operation and reports success without touching a
/// container runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn container_id(service: &str) -> ContainerId {
        ContainerId::new(format!("stub-container-{service}"))
    }
}

#[async_trait]
impl ContainerBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn create_service(
        &self,
        service: &str,
        spec: &ServiceSpec,
    ) -> Result<ContainerId, BackendError> {
        info!(
            service,
            image = spec.image.as_deref().unwrap_or("<build>"),
            "[stub] would create service container"
        );
        Ok(Self::container_id(service))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), BackendError> {
        info!(container = %id, "[stub] would start container");
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), BackendError> {
        info!(container = %id, timeout_secs, "[stub] would stop container");
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), BackendError> {
        info!(container = %id, "[stub] would remove container");
        Ok(())
    }

    async fn run_init_container(
        &self,
        service: &str,
        spec: &InitContainerSpec,
        _token: &CancellationToken,
    ) -> Result<(), BackendError> {
        info!(service, init = %spec.name, image = %spec.image, "[stub] would run init container");
        Ok(())
    }

    async fn run_post_container(
        &self,
        service: &str,
        spec: &PostContainerSpec,
        _token: &CancellationToken,
    ) -> Result<(), BackendError> {
        info!(service, post = %spec.name, image = %spec.image, "[stub] would run post container");
        Ok(())
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<(), BackendError> {
        info!(container, command = %command.join(" "), "[stub] would exec in container");
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
