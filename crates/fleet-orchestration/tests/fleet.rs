mod common;

use command_executor::Output;
use common::{FakeTransport, OperatorConfirmer, Op};
use fleet_orchestration::{
    Error, FailureKind, FleetOrchestrator, HostState, HostTarget, PresuppliedConfirmer,
    RemotePlan, TerminalConfirmer, TrustError,
};

fn plan() -> RemotePlan {
    RemotePlan::new(
        "client",
        "/usr/local/bin/snapfleet",
        "/etc/snapfleet/config.yaml",
    )
}

fn hosts(specs: &[&str]) -> Vec<HostTarget> {
    specs.iter().map(|s| s.parse().unwrap()).collect()
}

#[smol_potat::test]
async fn test_one_failing_host_does_not_stop_the_fleet() {
    let transport = FakeTransport::new()
        .known("a")
        .known("b")
        .known("c")
        .fail(
            "b",
            Op::Sync,
            Output::failed(
                23,
                "rsync: write failed on \"/tmp/snapfleet.b/snapfleet\": No space left on device (28)",
            ),
        );
    let orchestrator =
        FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan());

    let report = orchestrator
        .run(&hosts(&["pi@a", "pi@b", "pi@c"]))
        .await
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.result("pi@a").unwrap().status, HostState::Done);
    assert_eq!(report.result("pi@c").unwrap().status, HostState::Done);

    let b = report.result("pi@b").unwrap();
    assert!(b.is_failed());
    assert_eq!(b.failed_stage(), Some(&HostState::Syncing));
    assert_eq!(b.kind, None);
    assert!(b.diagnostic.contains("No space left on device"));
    assert_eq!(
        b.history,
        vec![
            HostState::Unverified,
            HostState::HostKeyTrusted,
            HostState::Reachable
        ]
    );

    // b never ran the role; c still ran after b failed
    assert_eq!(
        transport.calls_for("b"),
        vec!["probe b", "stage b", "sync b", "cleanup b"]
    );
    assert_eq!(
        transport.calls_for("c"),
        vec!["probe c", "stage c", "sync c", "role c", "cleanup c"]
    );
    assert_eq!(report.failed(), 1);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.run_id, orchestrator.run_id());
}

#[smol_potat::test]
async fn test_all_hosts_done_exits_zero() {
    let transport = FakeTransport::new().known("a").known("b");
    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan())
        .run(&hosts(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 0);
    for result in &report.results {
        assert_eq!(result.status, HostState::Done);
        assert_eq!(result.history.len(), 6);
        assert!(result.finished_at >= result.started_at);
    }
    let table = report.to_string();
    assert!(table.contains("HOST"));
    assert!(table.contains("2 host(s), 0 failed"));
}

#[smol_potat::test]
async fn test_unconfirmed_key_is_never_recorded() {
    let transport = FakeTransport::new().with_key("new", "SHA256:real");
    let confirmer = PresuppliedConfirmer::new(["SHA256:something-else"]);

    let report = FleetOrchestrator::new(&transport, confirmer, plan())
        .run(&hosts(&["new"]))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.failed_stage(), Some(&HostState::HostKeyTrusted));
    assert_eq!(
        result.hint.as_deref(),
        Some("re-run with --yes-trust SHA256:real")
    );
    assert!(!transport.is_trusted("new"));
    assert_eq!(transport.calls(), vec!["keyscan new"]);
}

#[smol_potat::test]
async fn test_confirmed_key_is_recorded_before_connecting() {
    let transport = FakeTransport::new().with_key("new", "SHA256:real");
    let confirmer = PresuppliedConfirmer::new(["SHA256:real"]);

    let report = FleetOrchestrator::new(&transport, confirmer, plan())
        .run(&hosts(&["new"]))
        .await
        .unwrap();

    assert_eq!(report.results[0].status, HostState::Done);
    assert!(transport.is_trusted("new"));
    assert_eq!(transport.calls()[0], "keyscan new");
}

#[smol_potat::test]
async fn test_establish_trust_error_variants() {
    let transport = FakeTransport::new();
    let err = fleet_orchestration::establish_trust(
        &transport,
        &PresuppliedConfirmer::default(),
        &HostTarget::new("ghost"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TrustError::KeyUnavailable { .. }));
}

#[smol_potat::test]
async fn test_parallel_requires_non_interactive_confirmation() {
    let transport = FakeTransport::new().known("a");
    let err = FleetOrchestrator::new(&transport, TerminalConfirmer, plan())
        .parallel(true)
        .run(&hosts(&["a"]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InteractiveParallel));
    assert!(transport.calls().is_empty());
}

#[smol_potat::test]
async fn test_parallel_keeps_host_order() {
    let transport = FakeTransport::new()
        .known("a")
        .known("b")
        .known("c")
        .fail("a", Op::Role, Output::failed(2, "error: CLIENT__SERVER_HOST is not set"));

    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan())
        .parallel(true)
        .run(&hosts(&["a", "b", "c"]))
        .await
        .unwrap();

    let order: Vec<_> = report.results.iter().map(|r| r.host.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(report.result("a").unwrap().failed_stage(), Some(&HostState::RoleExecuted));
    assert_eq!(report.failed(), 1);
}

#[smol_potat::test]
async fn test_auth_failure_is_classified_when_reachable() {
    let transport = FakeTransport::new().known("b").fail(
        "b",
        Op::Probe,
        Output::failed(255, "pi@b: Permission denied (publickey,password)."),
    );

    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan())
        .run(&hosts(&["pi@b"]))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.failed_stage(), Some(&HostState::Reachable));
    assert_eq!(result.kind, Some(FailureKind::AuthFailed));
    assert_eq!(result.hint.as_deref(), Some("ssh-copy-id pi@b"));
    assert_eq!(transport.calls(), vec!["probe b"]);
}

#[smol_potat::test]
async fn test_role_runs_from_a_private_staging_directory() {
    let transport = FakeTransport::new().known("a");
    let plan = plan().with_overrides("/etc/snapfleet/generated.yaml");

    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan)
        .run(&hosts(&["pi@a"]))
        .await
        .unwrap();

    assert_eq!(report.results[0].status, HostState::Done);
    assert_eq!(transport.synced_to(), vec!["/tmp/snapfleet.a"]);
    assert_eq!(
        transport.commands(),
        vec![
            "true",
            "mktemp -d /tmp/snapfleet.XXXXXXXX",
            "sudo -n /tmp/snapfleet.a/snapfleet client --config /tmp/snapfleet.a/config.yaml \
             --overrides /tmp/snapfleet.a/generated.yaml",
            "rm -rf -- /tmp/snapfleet.a",
        ]
    );
}

#[smol_potat::test]
async fn test_failed_staging_stops_before_copying() {
    let transport = FakeTransport::new().known("a").fail(
        "a",
        Op::Stage,
        Output::failed(1, "mktemp: failed to create directory via template: No such file or directory"),
    );

    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan())
        .run(&hosts(&["a"]))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.failed_stage(), Some(&HostState::Syncing));
    assert_eq!(result.kind, None);
    assert_eq!(transport.calls(), vec!["probe a", "stage a"]);
}

#[smol_potat::test]
async fn test_remote_permission_error_is_not_classified_as_auth() {
    let transport = FakeTransport::new().known("a").fail(
        "a",
        Op::Role,
        Output::failed(
            1,
            "failed to write /etc/snapfleet/server.conf: Permission denied (os error 13)",
        ),
    );

    let report = FleetOrchestrator::new(&transport, PresuppliedConfirmer::default(), plan())
        .run(&hosts(&["pi@a"]))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.failed_stage(), Some(&HostState::RoleExecuted));
    assert_eq!(result.kind, None);
    assert_eq!(
        result.hint.as_deref(),
        Some("ssh pi@a sudo journalctl -n 50 --no-pager")
    );
}

#[smol_potat::test]
async fn test_waits_for_operator_auth_setup_then_retries() {
    let transport = FakeTransport::new().known("b").fail_once(
        "b",
        Op::Probe,
        Output::failed(255, "pi@b: Permission denied (publickey,password)."),
    );
    let operator = OperatorConfirmer::new(true);

    let report = FleetOrchestrator::new(&transport, &operator, plan())
        .run(&hosts(&["pi@b"]))
        .await
        .unwrap();

    assert_eq!(report.results[0].status, HostState::Done);
    assert_eq!(operator.asked(), vec!["ssh-copy-id pi@b"]);
    assert_eq!(
        transport.calls(),
        vec!["probe b", "probe b", "stage b", "sync b", "role b", "cleanup b"]
    );
}

#[smol_potat::test]
async fn test_auth_setup_is_retried_only_once() {
    let transport = FakeTransport::new().known("b").fail(
        "b",
        Op::Probe,
        Output::failed(255, "pi@b: Permission denied (publickey)."),
    );
    let operator = OperatorConfirmer::new(true);

    let report = FleetOrchestrator::new(&transport, &operator, plan())
        .run(&hosts(&["pi@b"]))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.failed_stage(), Some(&HostState::Reachable));
    assert_eq!(result.kind, Some(FailureKind::AuthFailed));
    assert_eq!(operator.asked().len(), 1);
    assert_eq!(transport.calls(), vec!["probe b", "probe b"]);
}

#[smol_potat::test]
async fn test_declined_auth_setup_fails_without_retry() {
    let transport = FakeTransport::new().known("b").fail_once(
        "b",
        Op::Probe,
        Output::failed(255, "pi@b: Permission denied (publickey)."),
    );
    let operator = OperatorConfirmer::new(false);

    let report = FleetOrchestrator::new(&transport, &operator, plan())
        .run(&hosts(&["pi@b"]))
        .await
        .unwrap();

    assert_eq!(
        report.results[0].failed_stage(),
        Some(&HostState::Reachable)
    );
    assert_eq!(operator.asked(), vec!["ssh-copy-id pi@b"]);
    assert_eq!(transport.calls(), vec!["probe b"]);
}
