//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "tests"
//! hm_type: "source"
//! hm_scope: "test"
//! hm_description: "Lifecycle state machine sequencing, failure marking, and teardown idempotence."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
mod support;

use std::sync::Arc;
use std::time::Duration;

use hm_core::{
    CancellationToken, HookExecutor, HookSettings, LifecycleError, LifecycleManager,
    OrchestratorError, Phase,
};
use hm_spec::{Hook, HookSlot, InitContainerSpec, PostContainerSpec, ServiceSpec};
use support::ScriptedBackend;
use tokio::time::Instant;

fn manager(backend: &Arc<ScriptedBackend>) -> LifecycleManager {
    let hooks = HookExecutor::new(HookSettings::default(), backend.clone()).expect("http client");
    LifecycleManager::new(hooks, backend.clone())
}

fn web() -> ServiceSpec {
    ServiceSpec::new("web", "nginx:alpine")
        .with_init_container(InitContainerSpec::new("migrate", "migrate:latest"))
        .with_init_container(InitContainerSpec::new("seed", "seed:latest"))
        .with_post_container(PostContainerSpec::new("warm", "curl:latest").on_success())
        .with_post_container(PostContainerSpec::new("notify", "curl:latest").on_failure())
        .with_hook(HookSlot::PreStart, Hook::exec("pre", "pre-start-hook", ["true"]))
        .with_hook(HookSlot::PostStart, Hook::exec("post", "post-start-hook", ["true"]))
        .with_hook(HookSlot::PreStop, Hook::exec("drain", "pre-stop-hook", ["true"]))
        .with_hook(HookSlot::PostStop, Hook::exec("cleanup", "post-stop-hook", ["true"]))
}

#[tokio::test]
async fn start_sequence_runs_in_phase_order() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();

    lifecycle.start_service("web", &web(), &token).await.unwrap();

    assert_eq!(
        backend.calls(),
        vec![
            "init:web:migrate",
            "init:web:seed",
            "exec:pre-start-hook",
            "exec:post-start-hook",
            "post:web:warm",
        ]
    );
    let state = lifecycle.service_state("web").unwrap();
    assert_eq!(state.phase, Phase::Running);
    assert_eq!(state.status, "Running");
    assert!(state.init_completed);
    assert!(state.post_completed);
    assert!(state.started_at.is_some());
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn begin_start_stops_at_container_boundary() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();

    lifecycle.begin_start("web", &web(), &token).await.unwrap();
    assert_eq!(lifecycle.service_state("web").unwrap().phase, Phase::Start);
    assert!(backend.calls_with_prefix("exec:post-start-hook").is_empty());

    lifecycle.complete_start("web", &web(), &token).await.unwrap();
    assert_eq!(lifecycle.service_state("web").unwrap().phase, Phase::Running);
}

#[tokio::test]
async fn init_failure_marks_error_and_skips_hooks() {
    let backend = ScriptedBackend::new();
    backend.fail("init:web:migrate");
    let lifecycle = manager(&backend);

    let err = lifecycle
        .start_service("web", &web(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::InitContainer { service, container, .. } if service == "web" && container == "migrate"
    ));
    assert_eq!(backend.calls(), vec!["init:web:migrate"]);

    let state = lifecycle.service_state("web").unwrap();
    assert_eq!(state.phase, Phase::PreStart);
    assert_eq!(state.status, "Error");
    assert!(!state.init_completed);
    assert!(state.last_error.unwrap().contains("migrate"));
}

#[tokio::test]
async fn pre_start_hook_failure_is_attributed() {
    let backend = ScriptedBackend::new();
    backend.fail_exec_times(1);
    let lifecycle = manager(&backend);

    let err = lifecycle
        .start_service("web", &web(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Hook { service, source } => {
            assert_eq!(service, "web");
            assert_eq!(source.hook, "pre");
        }
        other => panic!("unexpected error {other}"),
    }
    let state = lifecycle.service_state("web").unwrap();
    assert_eq!(state.phase, Phase::PreStart);
    assert!(state.init_completed);
}

#[tokio::test]
async fn post_container_failures_are_not_fatal() {
    let backend = ScriptedBackend::new();
    backend.fail("post:web:warm");
    let lifecycle = manager(&backend);

    let report = lifecycle
        .start_service("web", &web(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.post_container_failures.len(), 1);
    let state = lifecycle.service_state("web").unwrap();
    assert_eq!(state.phase, Phase::Running);
    assert!(!state.post_completed);
}

#[tokio::test(start_paused = true)]
async fn post_container_waits_before_running() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let spec = ServiceSpec::new("api", "api:latest").with_post_container(
        PostContainerSpec::new("warm", "curl:latest")
            .on_success()
            .wait_for(Duration::from_secs(2)),
    );

    let started = Instant::now();
    lifecycle
        .start_service("api", &spec, &CancellationToken::new())
        .await
        .unwrap();

    let runs = backend.post_runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].1 - started >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_never_runs_post_container() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let spec = ServiceSpec::new("api", "api:latest").with_post_container(
        PostContainerSpec::new("warm", "curl:latest")
            .on_success()
            .wait_for(Duration::from_secs(2)),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = lifecycle.start_service("api", &spec, &token).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(backend.post_runs().is_empty());
    assert_eq!(lifecycle.service_state("api").unwrap().status, "Error");
}

#[tokio::test(start_paused = true)]
async fn init_container_races_cancellation() {
    let backend = ScriptedBackend::new();
    backend.delay_init(Duration::from_secs(60));
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let err = lifecycle.start_service("web", &web(), &token).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(backend.calls(), vec!["cleanup:init:web:migrate"]);
    assert_eq!(lifecycle.service_state("web").unwrap().status, "Error");
}

#[tokio::test(start_paused = true)]
async fn cancelled_post_container_is_cleaned_up() {
    let backend = ScriptedBackend::new();
    backend.delay_post(Duration::from_secs(60));
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let err = lifecycle.start_service("web", &web(), &token).await.unwrap_err();
    assert!(err.is_cancelled());
    let calls = backend.calls();
    assert_eq!(calls.last().map(String::as_str), Some("cleanup:post:web:warm"));
    assert!(!calls.iter().any(|call| call == "post:web:warm"));
}

#[tokio::test]
async fn teardown_runs_once_and_is_idempotent() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    lifecycle.start_service("web", &web(), &token).await.unwrap();

    let first = lifecycle.stop_service("web", &web(), &token).await.unwrap();
    assert!(!first.skipped);
    assert!(first.is_clean());
    let after_first = backend.calls();
    assert_eq!(
        &after_first[after_first.len() - 3..],
        &["exec:pre-stop-hook", "exec:post-stop-hook", "post:web:notify"]
    );

    let second = lifecycle.stop_service("web", &web(), &token).await.unwrap();
    assert!(second.skipped);
    assert_eq!(backend.calls(), after_first);

    let state = lifecycle.service_state("web").unwrap();
    assert_eq!(state.phase, Phase::Stopped);
    assert_eq!(state.status, "Stopped");
    assert!(state.stopped_at.is_some());
}

#[tokio::test]
async fn teardown_failures_are_reported_not_returned() {
    let backend = ScriptedBackend::new();
    backend.fail("post:web:notify");
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    lifecycle.start_service("web", &web(), &token).await.unwrap();

    backend.fail_exec_times(1);
    let report = lifecycle.stop_service("web", &web(), &token).await.unwrap();
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures[0].contains("drain"));
    assert_eq!(backend.calls_with_prefix("exec:post-stop-hook").len(), 1);
    assert_eq!(lifecycle.service_state("web").unwrap().phase, Phase::Stopped);
}

#[tokio::test]
async fn stopping_unknown_service_is_an_error() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let err = lifecycle
        .stop_service("ghost", &ServiceSpec::new("ghost", "busybox"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, LifecycleError::UnknownService("ghost".into()));
}

#[tokio::test]
async fn active_service_cannot_be_registered_twice() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    let spec = ServiceSpec::new("db", "postgres:16");

    lifecycle.start_service("db", &spec, &token).await.unwrap();
    let err = lifecycle.start_service("db", &spec, &token).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::AlreadyActive { phase: Phase::Running, .. })
    ));

    lifecycle.stop_service("db", &spec, &token).await.unwrap();
    lifecycle.start_service("db", &spec, &token).await.unwrap();
    let state = lifecycle.service_state("db").unwrap();
    assert_eq!(state.phase, Phase::Running);
    assert!(state.stopped_at.is_none());
}

#[tokio::test]
async fn snapshots_are_detached_copies() {
    let backend = ScriptedBackend::new();
    let lifecycle = manager(&backend);
    let token = CancellationToken::new();
    let spec = ServiceSpec::new("db", "postgres:16");
    lifecycle.start_service("db", &spec, &token).await.unwrap();

    let before = lifecycle.snapshot();
    lifecycle.stop_service("db", &spec, &token).await.unwrap();

    assert_eq!(before["db"].phase, Phase::Running);
    assert_eq!(lifecycle.snapshot()["db"].phase, Phase::Stopped);
}
