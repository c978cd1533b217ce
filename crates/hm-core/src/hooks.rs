//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Typed lifecycle hook execution with timeouts, retries, and cancellation."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Hook execution engine.
//!
//! Each [`Hook`] carries one [`HookAction`]: a process spawned directly, an
//! inline shell script, an HTTP call, or a command executed inside a running
//! container through the [`ContainerBackend`]. Every invocation races the
//! caller's [`CancellationToken`] and, when the hook declares one, its own
//! timeout.

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hm_spec::{ExecSpec, Hook, HookAction, HookKind, HttpRequestSpec};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ContainerBackend;
use crate::errors::{HookCause, HookFailure};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Engine-wide hook knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSettings {
    /// Fixed timeout of the shared HTTP client.
    pub http_timeout: Duration,
    /// The k-th retry of a hook waits `k * retry_base_delay`.
    pub retry_base_delay: Duration,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

/// Outcome of one hook invocation, recorded by
/// [`HookExecutor::execute_hooks_with_results`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub hook: String,
    pub kind: HookKind,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
}

impl HookResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct HookExecutor {
    client: reqwest::Client,
    backend: Arc<dyn ContainerBackend>,
    settings: HookSettings,
}

impl std::fmt::Debug for HookExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookExecutor")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl HookExecutor {
    pub fn new(
        settings: HookSettings,
        backend: Arc<dyn ContainerBackend>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;
        Ok(Self {
            client,
            backend,
            settings,
        })
    }

    pub fn settings(&self) -> HookSettings {
        self.settings
    }

    /// Run `hooks` in order with retries. The first hook that still fails once
    /// its retries are exhausted aborts the list.
    pub async fn execute_hooks(
        &self,
        hooks: &[Hook],
        token: &CancellationToken,
    ) -> Result<(), HookFailure> {
        for hook in hooks {
            self.execute_with_retry(hook, token).await?;
        }
        Ok(())
    }

    /// Run `hook`, re-attempting up to `hook.retries` additional times. The
    /// delay before the k-th retry is `k * retry_base_delay` and is abandoned
    /// as soon as `token` is cancelled.
    pub async fn execute_with_retry(
        &self,
        hook: &Hook,
        token: &CancellationToken,
    ) -> Result<(), HookFailure> {
        let mut retry = 0u32;
        loop {
            match self.execute_hook(hook, token).await {
                Ok(()) => {
                    if retry > 0 {
                        info!(hook = %hook.name, attempts = retry + 1, "hook succeeded after retry");
                    }
                    return Ok(());
                }
                Err(failure) if failure.is_cancelled() || retry >= hook.retries => {
                    return Err(failure);
                }
                Err(failure) => {
                    retry += 1;
                    let delay = self.settings.retry_base_delay.saturating_mul(retry);
                    warn!(
                        target: "harbormaster::hooks",
                        hook = %hook.name,
                        retry,
                        max_retries = hook.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.cause,
                        "hook failed, retrying",
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(failure_for(hook, HookCause::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One invocation of `hook`, bounded by its timeout and by `token`.
    pub async fn execute_hook(
        &self,
        hook: &Hook,
        token: &CancellationToken,
    ) -> Result<(), HookFailure> {
        debug!(hook = %hook.name, kind = %hook.kind(), "executing hook");
        let run = async {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(HookCause::Cancelled),
                outcome = self.dispatch(&hook.action) => outcome,
            }
        };
        let outcome = match hook.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HookCause::Timeout(limit)),
            },
            None => run.await,
        };
        outcome.map_err(|cause| failure_for(hook, cause))
    }

    /// Run each hook exactly once and record the outcome. Execution stops after
    /// a failure only when the failing hook declares no retries.
    pub async fn execute_hooks_with_results(
        &self,
        hooks: &[Hook],
        token: &CancellationToken,
    ) -> Vec<HookResult> {
        let mut results = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let started_at = Utc::now();
            let outcome = self.execute_hook(hook, token).await;
            let finished_at = Utc::now();
            let stop = outcome.is_err() && hook.retries == 0;
            results.push(HookResult {
                hook: hook.name.clone(),
                kind: hook.kind(),
                success: outcome.is_ok(),
                error: outcome.err().map(|failure| failure.cause.to_string()),
                started_at,
                finished_at,
                attempts: 1,
            });
            if stop {
                break;
            }
        }
        results
    }

    async fn dispatch(&self, action: &HookAction) -> Result<(), HookCause> {
        match action {
            HookAction::Command { argv } => run_command(argv).await,
            HookAction::Script { body } => run_script(body).await,
            HookAction::Http(request) => self.send_http(request).await,
            HookAction::Exec(exec) => self.exec_in_container(exec).await,
        }
    }

    async fn send_http(&self, request: &HttpRequestSpec) -> Result<(), HookCause> {
        let method = reqwest::Method::from_bytes(
            request.effective_method().to_ascii_uppercase().as_bytes(),
        )
        .map_err(|err| HookCause::InvalidPayload(format!("invalid HTTP method: {err}")))?;

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(HookCause::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        debug!(url = %request.url, status = status.as_u16(), "http hook completed");
        Ok(())
    }

    async fn exec_in_container(&self, exec: &ExecSpec) -> Result<(), HookCause> {
        if exec.container.trim().is_empty() || exec.command.is_empty() {
            return Err(HookCause::InvalidPayload(
                "exec hook requires a container and a command".to_string(),
            ));
        }
        self.backend.exec(&exec.container, &exec.command).await?;
        Ok(())
    }
}

fn failure_for(hook: &Hook, cause: HookCause) -> HookFailure {
    HookFailure {
        hook: hook.name.clone(),
        kind: hook.kind(),
        cause,
    }
}

async fn run_command(argv: &[String]) -> Result<(), HookCause> {
    let Some((program, args)) = argv.split_first() else {
        return Err(HookCause::InvalidPayload("command hook has an empty argv".to_string()));
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(HookCause::Spawn)?;
    if status.success() {
        Ok(())
    } else {
        Err(HookCause::Exit(status))
    }
}

async fn run_script(body: &str) -> Result<(), HookCause> {
    let mut file = tempfile::Builder::new()
        .prefix("hook-script-")
        .suffix(".sh")
        .tempfile()?;
    writeln!(file, "#!/bin/sh")?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }
    // Close the handle before exec; a writable fd on the script yields ETXTBSY.
    let path = file.into_temp_path();

    let status = Command::new(&*path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(HookCause::Spawn)?;
    drop(path);
    if status.success() {
        Ok(())
    } else {
        Err(HookCause::Exit(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_exit_status_decides_outcome() {
        assert!(run_command(&["true".to_string()]).await.is_ok());
        assert!(matches!(
            run_command(&["false".to_string()]).await,
            Err(HookCause::Exit(_))
        ));
        assert!(matches!(
            run_command(&["/definitely/not/a/binary".to_string()]).await,
            Err(HookCause::Spawn(_))
        ));
        assert!(matches!(
            run_command(&[]).await,
            Err(HookCause::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn script_runs_under_sh_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let body = format!("echo ok > '{}'\n", marker.display());
        run_script(&body).await.unwrap();
        assert!(marker.exists());

        assert!(matches!(
            run_script("exit 4\n").await,
            Err(HookCause::Exit(status)) if status.code() == Some(4)
        ));
    }
}
