//! registry-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the server components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connection;
pub mod node;
pub mod peer;
pub mod replication;
pub mod scheduler;
pub mod self_registration;
pub mod server;

// Re-export key types for convenience
pub use config::{Args, ConfigError, ServerConfig};
pub use connection::{HeartbeatConfig, HeartbeatMonitor, Liveness};
pub use node::{NodeHandle, RegistryNode};
pub use peer::{PeerClient, ReconnectConfig, WsPeerClient};
pub use replication::ReplicationCoordinator;
pub use scheduler::EvictionScheduler;
pub use self_registration::SelfRegistration;
pub use server::RegistryServer;
