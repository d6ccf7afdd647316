//! Routing
//!
//! Everything that decides where a request goes and what happened there.
//!
//! ```text
//!                 +-----------+
//! request ------> |  Router   | ----> cache hit? return
//!                 +-----+-----+
//!                       |
//!         +-------------+--------------+
//!         v             v              v
//!   ModelRegistry    Catalog     CircuitTable
//!   (local models)  (remotes)   (per remote)
//!                       |
//!                       v
//!                 UsageTracker
//! ```

pub mod catalog;
pub mod circuit;
pub mod registry;
pub mod router;
pub mod test_utils;
pub mod usage;

pub use catalog::{
    canonical_model, Capability, Catalog, CatalogEntry, ModelPattern, RemoteSettings,
    LOCAL_BACKEND,
};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, CircuitTable};
pub use registry::{resolve_model, LocalModel, ModelRegistry, RegistrySnapshot, TaskHint};
pub use router::{
    BackendHealth, BackendStatus, Candidate, CompletionRequest, CompletionResult, RoutePlan,
    Router, RouterConfig,
};
pub use usage::{BackendUsage, DailyUsage, UsageExport, UsageSnapshot, UsageTracker};
