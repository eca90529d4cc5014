use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("status conflict on {target}: expected {expected}, found {actual}")]
    StatusConflict {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("host '{host}' has no free node slot (max {max_slots})")]
    PortExhausted { host: String, max_slots: u16 },

    #[error("cannot parse node layout at {path}: {reason}")]
    PortParse { path: String, reason: String },

    #[error("writing config to host '{host}' failed: {reason}")]
    RemoteWrite { host: String, reason: String },

    #[error("remote command on host '{host}' failed: {reason}")]
    RemoteExec { host: String, reason: String },

    #[error("no node of chain '{chain}' completed {operation}")]
    DeploymentFailed { chain: String, operation: String },

    #[error("host '{host}' is referenced by {nodes} node(s)")]
    HostInUse { host: String, nodes: usize },

    #[error("chain '{chain}' still has {nodes} live node(s)")]
    ChainHasLiveNodes { chain: String, nodes: usize },

    #[error("chain '{0}' not found")]
    ChainNotFound(String),

    #[error("chain '{0}' already exists")]
    ChainAlreadyExists(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("host '{0}' not found")]
    HostNotFound(String),

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("state persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    pub fn status_conflict(
        target: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::StatusConflict {
            target: target.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Stable result code reported to callers. `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::Validation(_) => 201001,
            Self::StatusConflict { .. } => 201002,
            Self::PortExhausted { .. } => 201003,
            Self::PortParse { .. } => 201004,
            Self::RemoteWrite { .. } => 201005,
            Self::RemoteExec { .. } => 201006,
            Self::DeploymentFailed { .. } => 201007,
            Self::HostInUse { .. } => 201008,
            Self::ChainHasLiveNodes { .. } => 201009,
            Self::ChainNotFound(_) => 201010,
            Self::ChainAlreadyExists(_) => 201011,
            Self::NodeNotFound(_) => 201012,
            Self::HostNotFound(_) => 201013,
            Self::ConfigNotFound(_) | Self::InvalidConfig(_) => 201014,
            Self::Persistence(_) | Self::Io(_) | Self::Json(_) | Self::Yaml(_) => 201015,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::StatusConflict { .. } | Self::ChainHasLiveNodes { .. } => "StatusConflict",
            Self::PortExhausted { .. } => "PortExhausted",
            Self::PortParse { .. } => "PortParseError",
            Self::RemoteWrite { .. } => "RemoteWriteError",
            Self::RemoteExec { .. } => "RemoteExecError",
            Self::DeploymentFailed { .. } => "DeploymentFailed",
            Self::HostInUse { .. } => "HostInUse",
            Self::ChainNotFound(_) | Self::NodeNotFound(_) | Self::HostNotFound(_) => "NotFound",
            Self::ChainAlreadyExists(_) => "ValidationError",
            Self::ConfigNotFound(_) | Self::InvalidConfig(_) => "ConfigError",
            Self::Persistence(_) | Self::Io(_) | Self::Json(_) | Self::Yaml(_) => {
                "PersistenceError"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
