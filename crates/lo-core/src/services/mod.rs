pub mod allocator;
pub mod config_loader;
pub mod executor;
pub mod fake;
pub mod inventory;
pub mod ipconf;
pub mod lifecycle;
pub mod node_config;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod ssh;
pub mod state;
