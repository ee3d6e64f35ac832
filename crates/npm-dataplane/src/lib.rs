//! NPM DataPlane - node-local network policy orchestration.
//!
//! The dataplane sits between the policy controllers and the host's packet
//! filtering backends. Controllers hand it IP sets and translated network
//! policies; it keeps set references straight, batches set applies and rule
//! commits, and on Windows binds policies to pod endpoints.
//!
//! # Architecture
//!
//! ```text
//! [Controllers] ──> [DataPlane] ──┬──> [IpSetManager]
//!                       │         ├──> [PolicyManager]
//!                       │         └──> [EndpointProvider] (Windows)
//!                       ↓
//!               [UpdatePodQueue] ──> endpoint ACL bindings
//! ```
//!
//! # Key Components
//!
//! - [`dataplane::DataPlane`]: orchestration entry point
//! - [`ipsets::IpSetManager`]: set lifecycle, membership and references
//! - [`policies::PolicyManager`]: rule install, removal and commit
//! - [`endpoint::EndpointProvider`]: Windows endpoint discovery and binding

pub mod audit;
pub mod config;
pub mod dataplane;
pub mod endpoint;
pub mod error;
pub mod ipsets;
pub mod metrics;
pub mod policies;
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, DataPlaneConfig, PlatformConfig};
pub use dataplane::{ApplyContext, DataPlane, PeriodicTasks, QueuedPodUpdate, UpdatePodQueue};
pub use endpoint::{EndpointBinding, EndpointCache, EndpointProvider, StaticEndpointProvider};
pub use error::{DataPlaneError, PolicyStage, Result, StageError};
pub use ipsets::{
    InMemoryIpSetManager, IpSet, IpSetManager, IpSetMetadata, ReferenceType, SetKind, SetType,
    TranslatedIpSet,
};
pub use metrics::DataPlaneMetrics;
pub use policies::{InMemoryPolicyManager, NetworkPolicy, PolicyManager};
pub use types::{PodKey, PodMetadata, PolicyKey};

pub use npm_common::{BatchConfig, SyncMap};
