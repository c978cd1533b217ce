//! ---
//! hm_section: "05-command-line"
//! hm_subsection: "binary"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Subcommand implementations for the harbormaster command line."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use anyhow::{anyhow, bail, Context, Result};
use hm_common::AppConfig;
use hm_core::{
    CancellationToken, DownReport, EngineSettings, HookResult, Orchestrator, RollbackReport,
};
use hm_spec::{ComposeSpec, HookSlot, ServiceSpec};
use tracing::{info, warn};

use crate::shutdown::cancel_on_signal;

async fn orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let backend = hm_runtime::connect(config.backend.kind)
        .await
        .context("failed to connect to container backend")?;
    let orchestrator = Orchestrator::new(backend, EngineSettings::from(&config.engine))?;
    info!(backend = orchestrator.backend_name(), "container backend ready");
    Ok(orchestrator)
}

pub async fn up(config: &AppConfig, spec: &ComposeSpec, detach: bool) -> Result<()> {
    let orchestrator = orchestrator(config).await?;
    let token = CancellationToken::new();
    let watcher = cancel_on_signal(token.clone());

    if let Err(err) = orchestrator.up(spec, &token).await {
        watcher.abort();
        if let Some(report) = orchestrator.last_rollback() {
            render_rollback(&report);
        }
        close(&orchestrator).await;
        return Err(err).context("failed to start services");
    }

    render_states(&orchestrator, spec);
    if detach {
        watcher.abort();
        info!("running in detached mode");
        close(&orchestrator).await;
        return Ok(());
    }

    info!("services running; waiting for shutdown signal");
    token.cancelled().await;
    info!("shutting down services");
    let report = orchestrator.down(spec, &CancellationToken::new()).await?;
    render_down(&report);
    close(&orchestrator).await;
    Ok(())
}

/// Only services started by this process are tracked, so a standalone `down`
/// tears down whatever this invocation knows about and reports the rest as
/// skipped.
pub async fn down(config: &AppConfig, spec: &ComposeSpec) -> Result<()> {
    let orchestrator = orchestrator(config).await?;
    let report = orchestrator.down(spec, &CancellationToken::new()).await?;
    render_down(&report);
    close(&orchestrator).await;
    if !report.is_clean() {
        bail!("{} teardown step(s) failed", report.failures.len());
    }
    Ok(())
}

pub fn print_config(spec: &ComposeSpec) -> Result<()> {
    print!("{}", spec.to_yaml()?);
    Ok(())
}

pub fn validate(spec: &ComposeSpec) -> Result<()> {
    println!("compose file is valid ({} services)", spec.services.len());
    for (name, service) in &spec.services {
        println!("service {name}");
        let dependencies: Vec<&str> = service.dependency_names().collect();
        if !dependencies.is_empty() {
            println!("  depends on: {}", dependencies.join(", "));
        }
        if !service.init_containers.is_empty() {
            println!("  {} init container(s)", service.init_containers.len());
        }
        if !service.post_containers.is_empty() {
            println!("  {} post container(s)", service.post_containers.len());
        }
        let hooks = service.hooks.as_ref().map_or(0, |hooks| hooks.total());
        if hooks > 0 {
            println!("  {hooks} hook(s) configured");
        }
    }
    Ok(())
}

pub async fn hooks(
    config: &AppConfig,
    spec: &ComposeSpec,
    slot: HookSlot,
    services: &[String],
) -> Result<()> {
    let selected: Vec<&ServiceSpec> = if services.is_empty() {
        spec.services.values().collect()
    } else {
        services
            .iter()
            .map(|name| {
                spec.service(name)
                    .ok_or_else(|| anyhow!("unknown service '{name}'"))
            })
            .collect::<Result<_>>()?
    };

    let orchestrator = orchestrator(config).await?;
    let token = CancellationToken::new();
    let watcher = cancel_on_signal(token.clone());

    println!(
        "{:<16} {:<20} {:<8} {:<8} {:>10}  ERROR",
        "SERVICE", "HOOK", "TYPE", "RESULT", "DURATION"
    );
    let mut failed = 0usize;
    for service in selected {
        let results = orchestrator.run_hooks(service, slot, &token).await;
        if results.is_empty() {
            info!(service = %service.name, slot = %slot, "no hooks configured");
        }
        for result in &results {
            if !result.success {
                failed += 1;
            }
            println!("{}", hook_row(&service.name, result));
        }
    }

    watcher.abort();
    close(&orchestrator).await;
    if failed > 0 {
        bail!("{failed} {slot} hook(s) failed");
    }
    Ok(())
}

fn hook_row(service: &str, result: &HookResult) -> String {
    format!(
        "{:<16} {:<20} {:<8} {:<8} {:>8}ms  {}",
        service,
        result.hook,
        result.kind.as_str(),
        if result.success { "ok" } else { "failed" },
        result.duration().num_milliseconds(),
        result.error.as_deref().unwrap_or("-"),
    )
}

fn render_states(orchestrator: &Orchestrator, spec: &ComposeSpec) {
    for name in spec.services.keys() {
        if let Some(state) = orchestrator.service_state(name) {
            println!("{:<16} {:<10} {}", name, state.phase.as_str(), state.status);
        }
    }
}

fn render_rollback(report: &RollbackReport) {
    if !report.rolled_back.is_empty() {
        info!(services = ?report.rolled_back, "rolled back started services");
    }
    for failure in &report.failures {
        warn!(
            service = %failure.service,
            operation = failure.operation,
            error = %failure.error,
            "rollback step failed"
        );
    }
}

fn render_down(report: &DownReport) {
    for failure in &report.failures {
        warn!(
            service = %failure.service,
            operation = failure.operation,
            error = %failure.error,
            "teardown step failed"
        );
    }
    println!(
        "stopped {} service(s), skipped {}",
        report.stopped.len(),
        report.skipped.len()
    );
}

async fn close(orchestrator: &Orchestrator) {
    if let Err(err) = orchestrator.close().await {
        warn!(error = %err, "failed to close container backend");
    }
}
