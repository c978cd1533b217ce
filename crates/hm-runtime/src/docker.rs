//! ---
//! hm_section: "04-container-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Docker Engine backend built on bollard."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! [`ContainerBackend`] implementation that talks to a local Docker daemon.
//!
//! Main service containers are named `<service>_1`. Init and post containers
//! get a unix-timestamp suffix, run to completion, and are force-removed
//! whatever their outcome, cancellation included.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use hm_core::{BackendError, CancellationToken, ContainerBackend, ContainerId};
use hm_spec::{InitContainerSpec, PostContainerSpec, ServiceSpec};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

/// Upper bound on the initial daemon ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub const LABEL_SERVICE: &str = "io.harbormaster.service";
pub const LABEL_ROLE: &str = "io.harbormaster.role";

/// Lines of output captured from a failed auxiliary container.
const LOG_TAIL: &str = "100";

type PortConfig = (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
);

#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket)
    /// and make sure the daemon answers.
    pub async fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        match tokio::time::timeout(PING_TIMEOUT, docker.ping()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                return Err(BackendError::Unavailable(format!("ping failed: {err}")));
            }
            Err(_) => {
                return Err(BackendError::Unavailable(format!(
                    "daemon did not answer within {}s",
                    PING_TIMEOUT.as_secs()
                )));
            }
        }

        info!("connected to docker daemon");
        Ok(Self { docker })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|err| BackendError::runtime("pull image", err))?;
            if let Some(status) = progress.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    /// Create, start, and wait on a one-shot container, then force-remove it.
    /// A cancelled `token` stops the wait and removes the container.
    #[allow(clippy::too_many_arguments)]
    async fn run_to_completion(
        &self,
        name: String,
        image: &str,
        command: &[String],
        env: Vec<String>,
        volumes: &[String],
        labels: HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BackendError::Cancelled),
            pulled = self.ensure_image(image) => pulled?,
        }

        let config = Config {
            image: Some(image.to_string()),
            cmd: non_empty(command),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: non_empty(volumes),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| BackendError::runtime("create container", err))?;
        let id = created.id;

        if let Err(err) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&id).await;
            return Err(BackendError::runtime("start container", err));
        }

        let exit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            exit = self.wait_for_exit(&id) => Some(exit),
        };
        let Some(exit) = exit else {
            info!(container = %name, "cancelled; removing container");
            self.force_remove(&id).await;
            return Err(BackendError::Cancelled);
        };

        let result = match exit {
            Ok(0) => {
                debug!(container = %name, "container exited cleanly");
                Ok(())
            }
            Ok(code) => {
                let logs = self.collect_logs(&id).await;
                Err(BackendError::NonZeroExit {
                    container: name,
                    code,
                    logs,
                })
            }
            Err(err) => Err(err),
        };

        self.force_remove(&id).await;
        result
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i64, BackendError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let mut code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => code = response.status_code,
                Err(DockerError::DockerContainerWaitError { code: exit, .. }) => return Ok(exit),
                Err(err) => return Err(BackendError::runtime("wait container", err)),
            }
        }
        Ok(code)
    }

    async fn collect_logs(&self, id: &str) -> String {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: LOG_TAIL.to_string(),
                ..Default::default()
            }),
        );
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.push_str(&output.to_string()),
                Err(err) => {
                    debug!(container = id, error = %err, "log collection interrupted");
                    break;
                }
            }
        }
        logs
    }

    async fn force_remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(err) = self.docker.remove_container(id, Some(options)).await {
            if !is_status(&err, &[404]) {
                warn!(container = id, error = %err, "failed to remove auxiliary container");
            }
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_service(
        &self,
        service: &str,
        spec: &ServiceSpec,
    ) -> Result<ContainerId, BackendError> {
        let image = spec.image.as_deref().ok_or_else(|| {
            BackendError::InvalidRequest(format!(
                "service {service} has no image and building images is not supported"
            ))
        })?;
        self.ensure_image(image).await?;

        let (exposed_ports, port_bindings) = port_config(&spec.ports)?;
        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        labels.insert(LABEL_SERVICE.to_string(), service.to_string());
        labels.insert(LABEL_ROLE.to_string(), "service".to_string());

        let config = Config {
            image: Some(image.to_string()),
            cmd: non_empty(&spec.command),
            entrypoint: non_empty(&spec.entrypoint),
            env: Some(service_environment(spec)?),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: non_empty(&spec.volumes),
                port_bindings: Some(port_bindings),
                restart_policy: restart_policy(spec.restart.as_deref()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("{service}_1");
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| BackendError::runtime("create container", err))?;
        for warning in response.warnings {
            warn!(service, warning = %warning, "docker create warning");
        }
        info!(service, container = %name, id = %response.id, "container created");
        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| BackendError::runtime("start container", err))
    }

    async fn stop(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), BackendError> {
        let options = StopContainerOptions {
            t: i64::from(timeout_secs),
        };
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_status(&err, &[304, 404]) => {
                debug!(container = %id, "container already stopped or gone");
                Ok(())
            }
            Err(err) => Err(BackendError::runtime("stop container", err)),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), BackendError> {
        match self.docker.remove_container(id.as_str(), None).await {
            Ok(()) => Ok(()),
            Err(err) if is_status(&err, &[404]) => {
                debug!(container = %id, "container already removed");
                Ok(())
            }
            Err(err) => Err(BackendError::runtime("remove container", err)),
        }
    }

    async fn run_init_container(
        &self,
        service: &str,
        spec: &InitContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        let name = format!("{service}_init_{}_{}", spec.name, unix_now());
        info!(service, init = %spec.name, container = %name, "running init container");
        self.run_to_completion(
            name,
            &spec.image,
            &spec.command,
            env_pairs(&spec.environment),
            &spec.volumes,
            role_labels(service, "init"),
            token,
        )
        .await
    }

    async fn run_post_container(
        &self,
        service: &str,
        spec: &PostContainerSpec,
        token: &CancellationToken,
    ) -> Result<(), BackendError> {
        let name = format!("{service}_post_{}_{}", spec.name, unix_now());
        info!(service, post = %spec.name, container = %name, "running post container");
        self.run_to_completion(
            name,
            &spec.image,
            &spec.command,
            env_pairs(&spec.environment),
            &spec.volumes,
            role_labels(service, "post"),
            token,
        )
        .await
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<(), BackendError> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| match err {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => BackendError::NotFound(container.to_string()),
                other => BackendError::runtime("create exec", other),
            })?;

        let mut logs = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|err| BackendError::runtime("start exec", err))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|err| BackendError::runtime("exec output", err))?;
                    logs.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|err| BackendError::runtime("inspect exec", err))?;
        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(BackendError::NonZeroExit {
                container: container.to_string(),
                code,
                logs,
            }),
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        debug!("docker client released");
        Ok(())
    }
}

fn is_status(err: &DockerError, codes: &[u16]) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn role_labels(service: &str, role: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_SERVICE.to_string(), service.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
    ])
}

fn env_pairs(vars: &IndexMap<String, String>) -> Vec<String> {
    vars.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// `env_file` entries are applied in order, then `environment` overrides them.
pub(crate) fn service_environment(spec: &ServiceSpec) -> Result<Vec<String>, BackendError> {
    let mut vars = IndexMap::new();
    for path in &spec.env_file {
        let file_vars = hm_spec::env::read_env_file(path)
            .map_err(|err| BackendError::InvalidRequest(err.to_string()))?;
        vars.extend(file_vars);
    }
    vars.extend(
        spec.environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    Ok(env_pairs(&vars))
}

/// Translate compose port strings (`8080:80`, `127.0.0.1:8080:80/udp`, `9000`)
/// into Docker's exposed-port set and binding map.
pub(crate) fn port_config(ports: &[String]) -> Result<PortConfig, BackendError> {
    let mut exposed = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

    for entry in ports {
        let (mapping, protocol) = match entry.rsplit_once('/') {
            Some((mapping, protocol)) => (mapping, protocol),
            None => (entry.as_str(), "tcp"),
        };
        let parts: Vec<&str> = mapping.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, *container),
            [host, container] => (None, Some(*host), *container),
            [ip, host, container] => (Some(*ip), Some(*host), *container),
            _ => {
                return Err(BackendError::InvalidRequest(format!(
                    "invalid port mapping '{entry}'"
                )))
            }
        };
        if container_port.is_empty() || container_port.parse::<u16>().is_err() {
            return Err(BackendError::InvalidRequest(format!(
                "invalid container port in '{entry}'"
            )));
        }

        let key = format!("{container_port}/{protocol}");
        exposed.insert(key.clone(), HashMap::new());
        if let Some(host_port) = host_port {
            bindings.entry(key).or_default().get_or_insert_with(Vec::new).push(PortBinding {
                host_ip: host_ip.map(str::to_string),
                host_port: Some(host_port.to_string()),
            });
        }
    }

    Ok((exposed, bindings))
}

pub(crate) fn restart_policy(restart: Option<&str>) -> Option<RestartPolicy> {
    let restart = restart?;
    let (name, retries) = match restart.split_once(':') {
        Some((name, count)) => (name, count.parse::<i64>().ok()),
        None => (restart, None),
    };
    let name = match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        other => {
            warn!(policy = other, "ignoring unknown restart policy");
            return None;
        }
    };
    Some(RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    })
}
