//! Plugin substrate: isolate supervision with circuit-breaker restarts and
//! zero-downtime reload, a permissioned context bridge for host calls, and
//! the M-Service router for timeout-bounded cross-plugin RPC.

pub mod breaker;
pub mod bridge;
pub mod context;
pub mod envelope;
pub mod error;
pub mod isolate;
pub mod registry;
pub mod router;
pub mod spawn;
pub mod substrate;
pub mod vault;

pub use breaker::{BreakerConfig, CircuitBreaker, HealthReport};
pub use bridge::MessageBridge;
pub use context::PluginContextHost;
pub use envelope::{MessageKind, PluginMessage};
pub use error::PluginError;
pub use isolate::{IsolateManager, IsolateOptions, PluginManifest};
pub use registry::{PermissionStore, ServiceRegistration, ServiceRegistry};
pub use router::{RouteRequest, RouteResponse, ServiceRouter, WorkerResolver};
pub use spawn::{TaskWorkerSpawner, WorkerHandle, WorkerSpawner};
pub use substrate::{PluginSubstrate, SubstrateConfig};
pub use vault::ConfigVault;
