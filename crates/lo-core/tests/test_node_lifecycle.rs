mod common;

use std::collections::BTreeSet;

use lo_core::models::{ChainStatus, NodeStatus};
use lo_core::services::fake::FakeExecutor;
use lo_core::services::remote::CommandKind;
use lo_core::OrchestratorError;

#[tokio::test]
async fn mismatched_expected_status_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request("chain1", &["10.0.0.1:1 agencyA 1"]))
        .await
        .unwrap();
    let node = manager.get_chain("chain1").await.unwrap().nodes[0].clone();
    let starts_before = fake.commands_of(CommandKind::Start).len();

    let err = manager
        .start_node(&node.node_id, NodeStatus::Stopped)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StatusConflict { .. }));
    assert_eq!(err.kind(), "StatusConflict");
    assert_eq!(fake.commands_of(CommandKind::Start).len(), starts_before);

    let reloaded = common::manager(&fake, dir.path());
    reloaded.load_state().await.unwrap();
    let persisted = reloaded.snapshot().await;
    assert_eq!(persisted.node(&node.node_id).unwrap().status, NodeStatus::Running);
}

#[tokio::test]
async fn identities_survive_every_transition() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request("chain1", &["10.0.0.1:2 agencyA 1"]))
        .await
        .unwrap();
    let ids = |t: &lo_core::models::Topology| -> BTreeSet<_> { t.nodes.keys().cloned().collect() };
    let before = ids(&manager.snapshot().await);

    manager.stop_chain("chain1").await.unwrap();
    manager.start_chain("chain1").await.unwrap();
    manager.upgrade_chain("chain1", "v3.0.0").await.unwrap();

    assert_eq!(ids(&manager.snapshot().await), before);
}

#[tokio::test]
async fn chain_deletion_waits_for_every_node() {
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

    let err = manager.delete_chain("chain1").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ChainHasLiveNodes { nodes: 2, .. }));
    assert_eq!(err.kind(), "StatusConflict");
    assert_eq!(
        manager.get_chain("chain1").await.unwrap().chain.status,
        ChainStatus::Running
    );
    assert!(fake.commands_of(CommandKind::RemoveChainDir).is_empty());
    assert!(fake.commands_of(CommandKind::Remove).is_empty());

    manager.stop_chain("chain1").await.unwrap();
    for node in manager.get_chain("chain1").await.unwrap().nodes {
        manager.delete_node(&node.node_id, false, false).await.unwrap();
    }
    manager.delete_chain("chain1").await.unwrap();

    assert!(matches!(
        manager.get_chain("chain1").await,
        Err(OrchestratorError::ChainNotFound(_))
    ));
    assert_eq!(fake.commands_of(CommandKind::RemoveChainDir).len(), 2);
    assert_eq!(manager.list_hosts().await.len(), 2);
}

#[tokio::test]
async fn host_in_use_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let manager = common::manager(&fake, dir.path());
    manager
        .deploy_chain(common::deploy_request("chain1", &["10.0.0.1:1 agencyA 1"]))
        .await
        .unwrap();
    let host_id = manager.list_hosts().await[0].id;

    let err = manager.remove_host(host_id, false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::HostInUse { nodes: 1, .. }));

    let spare = manager.register_host("10.0.0.9", "agencyC", None).await.unwrap();
    assert!(manager.remove_host(spare, false).await.unwrap().is_empty());
}
