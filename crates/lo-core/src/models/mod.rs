pub mod chain;
pub mod config;
pub mod host;
pub mod node;
pub mod operation;
pub mod response;
pub mod topology;

pub use chain::{Chain, ChainStatus, EncryptType, ImageType};
pub use config::{OrchestratorConfig, PortPlan, RetrySettings, SshSettings};
pub use host::{Host, HostCredential, HostId};
pub use node::{GroupId, Node, NodeId, NodeStatus, PortTriple};
pub use operation::{
    DeploymentOperation, NodeOutcome, NodeResult, OperationKind, OperationOutcome,
    OperationReport,
};
pub use response::ApiResponse;
pub use topology::Topology;
