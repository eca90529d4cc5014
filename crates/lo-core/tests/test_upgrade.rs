mod common;

use lo_core::models::{ChainStatus, NodeOutcome, NodeStatus, OperationOutcome};
use lo_core::services::fake::FakeExecutor;
use lo_core::services::remote::{CommandKind, RemoteCommand};

#[tokio::test]
async fn second_of_four_failing_halts_the_rollout() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request(
            "chain1",
            &["10.0.0.1:2 agencyA 1", "10.0.0.2:2 agencyB 1"],
        ))
        .await
        .unwrap();
    // Rollout order is host then slot, so the second node is slot 1 on the first host.
    fake.fail_command("10.0.0.1", CommandKind::Upgrade, Some("chain1-node1"));

    let report = manager.upgrade_chain("chain1", "v3.0.0").await.unwrap();
    assert_eq!(report.outcome(), OperationOutcome::Halted);
    let outcomes: Vec<_> = report.results.iter().map(|r| &r.outcome).collect();
    assert_eq!(outcomes[0], &NodeOutcome::Succeeded);
    assert!(matches!(outcomes[1], NodeOutcome::Failed { kind, .. } if kind == "RemoteExecError"));
    assert_eq!(outcomes[2], &NodeOutcome::NotAttempted);
    assert_eq!(outcomes[3], &NodeOutcome::NotAttempted);
    assert_eq!(fake.commands_of(CommandKind::Upgrade).len(), 2);

    let detail = manager.get_chain("chain1").await.unwrap();
    assert_eq!(detail.chain.status, ChainStatus::Upgrading);
    assert_eq!(detail.chain.version, "v2.9.0");
    assert_eq!(detail.chain.upgrade_target.as_deref(), Some("v3.0.0"));
    assert_eq!(manager.progress("chain1"), 100);

    let failed = &detail.nodes[1];
    assert_eq!(failed.status, NodeStatus::Stopped);
    assert_eq!(failed.version, "v2.9.0");
    assert_eq!(detail.nodes[0].version, "v3.0.0");
    assert!(detail.nodes[2..].iter().all(|n| n.version == "v2.9.0" && n.status == NodeStatus::Running));
}

#[tokio::test]
async fn rollout_is_sequential_and_restarts_each_node() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request(
            "chain1",
            &["10.0.0.1:1 agencyA 1", "10.0.0.2:1 agencyB 1"],
        ))
        .await
        .unwrap();
    let before = fake.commands().len();

    manager.upgrade_chain("chain1", "v3.0.0").await.unwrap();

    let kinds: Vec<_> = fake.commands()[before..]
        .iter()
        .map(|(host, c)| (host.clone(), c.kind()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("10.0.0.1".to_string(), CommandKind::Stop),
            ("10.0.0.1".to_string(), CommandKind::Upgrade),
            ("10.0.0.1".to_string(), CommandKind::Start),
            ("10.0.0.2".to_string(), CommandKind::Stop),
            ("10.0.0.2".to_string(), CommandKind::Upgrade),
            ("10.0.0.2".to_string(), CommandKind::Start),
        ]
    );
    let detail = manager.get_chain("chain1").await.unwrap();
    assert_eq!(detail.chain.status, ChainStatus::Running);
    assert_eq!(detail.chain.version, "v3.0.0");
}

#[tokio::test]
async fn failure_on_the_final_node_is_reported_as_halted() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request("chain1", &["10.0.0.1:2 agencyA 1"]))
        .await
        .unwrap();
    fake.fail_command("10.0.0.1", CommandKind::Upgrade, Some("chain1-node1"));

    let report = manager.upgrade_chain("chain1", "v3.0.0").await.unwrap();
    assert!(report.halted);
    assert_eq!(report.not_attempted(), 0);
    assert_eq!(report.outcome(), OperationOutcome::Halted);
    assert_eq!(
        manager.tracker().last_finished("chain1").unwrap().outcome,
        Some(OperationOutcome::Halted)
    );
    let detail = manager.get_chain("chain1").await.unwrap();
    assert_eq!(detail.chain.status, ChainStatus::Upgrading);
}

#[tokio::test]
async fn pending_nodes_are_skipped_and_installed_at_the_new_version() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    fake.fail_command("10.0.0.2", CommandKind::Install, None);
    let manager = common::manager(&fake, dir.path());
    let deployed = manager
        .deploy_chain(common::deploy_request(
            "chain1",
            &["10.0.0.1:1 agencyA 1", "10.0.0.2:1 agencyB 1"],
        ))
        .await
        .unwrap();
    let pending = deployed.failed_nodes().next().unwrap().node_id.clone();
    fake.clear_command_failures();

    let report = manager.upgrade_chain("chain1", "v3.0.0").await.unwrap();
    let upgraded_hosts: Vec<_> = fake
        .commands_of(CommandKind::Upgrade)
        .into_iter()
        .map(|(host, _)| host)
        .collect();
    assert_eq!(upgraded_hosts, vec!["10.0.0.1".to_string()]);
    let skipped = report.results.iter().find(|r| r.node_id == pending).unwrap();
    assert_eq!(skipped.outcome, NodeOutcome::Skipped);

    let node = manager.snapshot().await.node(&pending).unwrap().clone();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.version, "v2.9.0");

    let installed = manager.install_node(&pending).await.unwrap();
    assert_eq!(installed.version, "v3.0.0");
    let (_, last_install) = fake.commands_of(CommandKind::Install).pop().unwrap();
    let RemoteCommand::Install(spec) = last_install else {
        panic!("expected an install command");
    };
    assert_eq!(spec.version, "v3.0.0");
}
