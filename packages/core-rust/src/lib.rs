//! MCP hub core: protocol versions, message envelopes and sibling-system routing names.

pub mod envelope;
pub mod routing;
pub mod version;

pub use envelope::{MessageEnvelope, CONTENT_TYPE_JSON};
pub use routing::{RoutingScheme, SystemId, UnknownSystem};
pub use version::{CompatibilityError, Version, VersionCompatibility, VersionError};

