//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "tests"
//! hm_type: "source"
//! hm_scope: "test"
//! hm_description: "Orchestrator ordering, rollback, and teardown behaviour."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
mod support;

use std::sync::Arc;
use std::time::Duration;

use hm_core::{
    CancellationToken, EngineSettings, Orchestrator, OrchestratorError, Phase, StructuralError,
};
use hm_spec::{ComposeSpec, Hook, HookSlot, InitContainerSpec, PostContainerSpec, ServiceSpec};
use support::ScriptedBackend;

fn orchestrator(backend: &Arc<ScriptedBackend>) -> Orchestrator {
    Orchestrator::new(backend.clone(), EngineSettings::default()).expect("orchestrator")
}

fn compose(services: Vec<ServiceSpec>) -> ComposeSpec {
    services
        .into_iter()
        .fold(ComposeSpec::default(), ComposeSpec::with_service)
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|entry| entry == call)
        .unwrap_or_else(|| panic!("{call} not found in {calls:?}"))
}

fn stack() -> ComposeSpec {
    compose(vec![
        ServiceSpec::new("web", "nginx:alpine").depends_on("api"),
        ServiceSpec::new("api", "api:latest").depends_on("db"),
        ServiceSpec::new("db", "postgres:16"),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn up_starts_services_in_dependency_order() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);

    orchestrator
        .up(&stack(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        backend.calls(),
        vec![
            "create:db",
            "start:db",
            "create:api",
            "start:api",
            "create:web",
            "start:web",
        ]
    );
    let running: Vec<_> = orchestrator.running_containers().keys().cloned().collect();
    assert_eq!(running, vec!["db", "api", "web"]);
    assert!(orchestrator
        .snapshot()
        .values()
        .all(|state| state.phase == Phase::Running));
    assert!(orchestrator.last_rollback().is_none());
}

#[tokio::test]
async fn structural_errors_precede_side_effects() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let token = CancellationToken::new();

    let missing = compose(vec![ServiceSpec::new("web", "nginx").depends_on("ghost")]);
    let err = orchestrator.up(&missing, &token).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Structural(StructuralError::MissingDependency { .. })
    ));

    let cyclic = compose(vec![
        ServiceSpec::new("a", "busybox").depends_on("b"),
        ServiceSpec::new("b", "busybox").depends_on("a"),
    ]);
    let err = orchestrator.up(&cyclic, &token).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Structural(StructuralError::Cycle { .. })
    ));
    assert!(orchestrator.down(&cyclic, &token).await.is_err());

    assert!(backend.calls().is_empty());
    assert!(orchestrator.snapshot().is_empty());
}

#[tokio::test]
async fn lone_init_failure_stops_without_rollback() {
    let backend = ScriptedBackend::new();
    backend.fail("init:alpha:setup");
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("beta", "busybox"),
        ServiceSpec::new("alpha", "busybox")
            .with_init_container(InitContainerSpec::new("setup", "busybox")),
    ]);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::InitContainer { service, .. } if service == "alpha"
    ));
    assert_eq!(backend.calls(), vec!["init:alpha:setup"]);
    assert!(orchestrator.service_state("beta").is_none());

    let rollback = orchestrator.last_rollback().unwrap();
    assert_eq!(rollback.failed_service.as_deref(), Some("alpha"));
    assert!(rollback.rolled_back.is_empty());
    assert!(rollback.failures.is_empty());
}

#[tokio::test]
async fn dependent_init_failure_rolls_back_started_dependency() {
    let backend = ScriptedBackend::new();
    backend.fail("init:b:migrate");
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("a", "postgres:16")
            .with_hook(HookSlot::PreStop, Hook::exec("flush", "a-hook", ["sync"])),
        ServiceSpec::new("b", "api:latest")
            .depends_on("a")
            .with_init_container(InitContainerSpec::new("migrate", "migrate:latest")),
    ]);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::InitContainer { service, container, .. }
            if service == "b" && container == "migrate"
    ));

    let calls = backend.calls();
    let failed = position(&calls, "init:b:migrate");
    assert!(position(&calls, "stop:a") > failed);
    assert!(position(&calls, "remove:a") > position(&calls, "stop:a"));
    assert!(position(&calls, "exec:a-hook") > position(&calls, "remove:a"));

    let a = orchestrator.service_state("a").unwrap();
    assert_eq!(a.phase, Phase::Stopped);
    let b = orchestrator.service_state("b").unwrap();
    assert_eq!(b.status, "Error");
    assert_eq!(
        orchestrator.last_rollback().unwrap().rolled_back,
        vec!["a".to_string()]
    );
}

#[tokio::test]
async fn rollback_runs_in_reverse_start_order() {
    let backend = ScriptedBackend::new();
    backend.fail("create:d");
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("d", "busybox").depends_on("c"),
        ServiceSpec::new("c", "busybox").depends_on("b"),
        ServiceSpec::new("b", "busybox").depends_on("a"),
        ServiceSpec::new("a", "busybox"),
    ]);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Backend { operation: "create", ref service, .. } if service == "d"
    ));

    let stops = backend.calls_with_prefix("stop:");
    assert_eq!(stops, vec!["stop:c", "stop:b", "stop:a"]);
    let rollback = orchestrator.last_rollback().unwrap();
    assert_eq!(rollback.rolled_back, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn rollback_failures_never_replace_the_original_error() {
    let backend = ScriptedBackend::new();
    backend.fail("stop:a");
    backend.fail("init:b:migrate");
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("a", "busybox"),
        ServiceSpec::new("b", "busybox")
            .depends_on("a")
            .with_init_container(InitContainerSpec::new("migrate", "busybox")),
    ]);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.service(), Some("b"));

    let rollback = orchestrator.last_rollback().unwrap();
    assert_eq!(rollback.failures.len(), 1);
    assert_eq!(rollback.failures[0].service, "a");
    assert_eq!(rollback.failures[0].operation, "stop");
    assert!(backend.calls().contains(&"remove:a".to_string()));
}

#[tokio::test]
async fn failed_start_removes_fresh_container() {
    let backend = ScriptedBackend::new();
    backend.fail("start:web");
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![ServiceSpec::new("web", "nginx")]);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Backend { operation: "start", .. }));
    assert_eq!(backend.calls(), vec!["create:web", "start:web", "remove:web"]);
    assert!(orchestrator.running_containers().is_empty());
    assert_eq!(orchestrator.service_state("web").unwrap().status, "Error");
}

#[tokio::test]
async fn post_start_failure_discards_own_container_then_rolls_back() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("db", "postgres:16"),
        ServiceSpec::new("web", "nginx")
            .depends_on("db")
            .with_hook(HookSlot::PostStart, Hook::exec("probe", "web", ["check"])),
    ]);
    backend.fail_exec_times(1);

    let err = orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::Hook { service, source } if service == "web" && source.hook == "probe"
    ));

    let calls = backend.calls();
    assert!(position(&calls, "stop:web") < position(&calls, "stop:db"));
    assert!(calls.contains(&"remove:web".to_string()));
    assert!(calls.contains(&"remove:db".to_string()));
    assert_eq!(orchestrator.last_rollback().unwrap().rolled_back, vec!["db"]);

    let tracked: Vec<_> = orchestrator.running_containers().keys().cloned().collect();
    assert_eq!(tracked, vec!["db", "web"]);
    orchestrator
        .down(&spec, &CancellationToken::new())
        .await
        .unwrap();
    assert!(orchestrator.running_containers().is_empty());
}

#[tokio::test]
async fn down_continues_past_failures() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let token = CancellationToken::new();
    let spec = stack();
    orchestrator.up(&spec, &token).await.unwrap();

    backend.fail("stop:web");
    backend.fail("remove:api");
    let report = orchestrator.down(&spec, &token).await.unwrap();

    assert_eq!(report.stopped, vec!["web", "api", "db"]);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.failures[0].service, "web");
    assert_eq!(report.failures[1].service, "api");
    assert!(!report.is_clean());
    assert_eq!(
        backend.calls_with_prefix("stop:"),
        vec!["stop:web", "stop:api", "stop:db"]
    );
    assert!(orchestrator.running_containers().is_empty());
    assert!(orchestrator
        .snapshot()
        .values()
        .all(|state| state.phase == Phase::Stopped));
}

#[tokio::test]
async fn down_skips_services_never_started() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);

    let report = orchestrator
        .down(&stack(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.stopped.is_empty());
    assert_eq!(report.skipped, vec!["web", "api", "db"]);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn teardown_hooks_run_only_once_across_down_calls() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let token = CancellationToken::new();
    let spec = compose(vec![ServiceSpec::new("db", "postgres:16")
        .with_hook(HookSlot::PreStop, Hook::exec("flush", "db-hook", ["sync"]))]);

    orchestrator.up(&spec, &token).await.unwrap();
    orchestrator.down(&spec, &token).await.unwrap();
    let second = orchestrator.down(&spec, &token).await.unwrap();

    assert_eq!(second.skipped, vec!["db"]);
    assert_eq!(backend.calls_with_prefix("exec:db-hook").len(), 1);
}

#[tokio::test]
async fn cancelled_token_short_circuits_up() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let token = CancellationToken::new();
    token.cancel();

    let err = orchestrator.up(&stack(), &token).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_up_unwinds_with_fresh_token() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    let spec = compose(vec![
        ServiceSpec::new("db", "postgres:16")
            .with_hook(HookSlot::PreStop, Hook::exec("flush", "db-hook", ["sync"])),
        ServiceSpec::new("web", "nginx").depends_on("db").with_post_container(
            PostContainerSpec::new("warm", "curl")
                .on_success()
                .wait_for(Duration::from_secs(30)),
        ),
    ]);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let err = orchestrator.up(&spec, &token).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(backend.post_runs().is_empty());
    assert_eq!(backend.calls_with_prefix("exec:db-hook").len(), 1);
    assert_eq!(
        orchestrator.service_state("db").unwrap().phase,
        Phase::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_can_be_read_while_up_runs() {
    let backend = ScriptedBackend::new();
    let orchestrator = Arc::new(orchestrator(&backend));
    let spec = stack();

    let reader = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let mut observed = 0usize;
            for _ in 0..200 {
                observed = observed.max(orchestrator.snapshot().len());
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    orchestrator
        .up(&spec, &CancellationToken::new())
        .await
        .unwrap();
    let observed = reader.await.unwrap();
    assert!(observed <= 3);
    assert_eq!(orchestrator.snapshot().len(), 3);
}

#[tokio::test]
async fn close_releases_backend() {
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator(&backend);
    orchestrator.close().await.unwrap();
    assert_eq!(backend.calls(), vec!["close"]);
}
