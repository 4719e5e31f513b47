//! Protocol version gate for hub-facing HTTP routes.

pub mod cache;
pub mod layer;
pub mod rejection;

pub use cache::{CacheStats, CompatibilityCache, DEFAULT_CACHE_CAPACITY};
pub use layer::{
    ClientVersion, GateConfig, GateDecision, VersionGate, VersionGateLayer, VersionGateService,
    SYSTEM_HEADER, UNKNOWN_SYSTEM, VERSION_HEADER,
};
pub use rejection::GateRejection;
