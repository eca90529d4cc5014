use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lo_core::models::{Chain, EncryptType, Host, HostCredential, ImageType};
use lo_core::services::allocator::PortAllocator;
use lo_core::services::executor::{DeploymentExecutor, RetryPolicy};
use lo_core::services::fake::FakeExecutor;
use lo_core::services::node_config::{ConfigGenerator, NodeConfig};

#[tokio::test]
async fn republishing_identical_inputs_uploads_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeExecutor::new();
    let executor = DeploymentExecutor::new(
        Arc::new(fake.clone()),
        RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        Duration::from_secs(5),
        "img".into(),
    );
    let generator = ConfigGenerator::new(dir.path().join("staging"));
    let chain = Chain::new(
        "chain1".into(),
        1,
        EncryptType::Standard,
        "v2.9.0".into(),
        "/opt/fisco".into(),
        "127.0.0.1:5004".into(),
        ImageType::Pull,
    );
    let host = Host::new(
        0,
        "10.0.0.1".into(),
        HostCredential::default(),
        "/opt/fisco".into(),
        "agencyA".into(),
    );
    let allocation = PortAllocator::default().allocate(&host, &[], |_| false).unwrap();
    let groups = BTreeSet::from([1, 2]);

    for _ in 0..2 {
        let artifact = generator.generate(&chain, &allocation, &groups).unwrap();
        generator.publish(&executor, &host, &artifact).await.unwrap();
    }

    let uploads = fake.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0], uploads[1]);
    assert_eq!(uploads[0].remote_dir, "/opt/fisco/chain1/node0");

    let staged = NodeConfig::read(&dir.path().join("staging/chain1/10.0.0.1/node0")).unwrap();
    assert_eq!(staged.node_id, allocation.node_id);
    assert_eq!(staged.ports, allocation.ports);
    assert_eq!(staged.group_ids, groups);
}
