//! Sibling-system identities and the bus naming scheme derived from them.
//!
//! One logical exchange carries all traffic. Outbound routing keys take the
//! form `<prefix>.to.<target>`, inbound queues `<prefix>.<source>.queue`, and a
//! single dead-letter queue `<prefix>.dead-letter.queue` collects failures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sibling systems the hub talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemId {
    /// Electronic document management.
    Edms,
    /// Manufacturing execution.
    Mes,
    /// Laboratory information management.
    Lims,
    Erp,
    Training,
    Equipment,
}

impl SystemId {
    /// Every sibling system, in queue-declaration order.
    pub const ALL: [SystemId; 6] = [
        SystemId::Edms,
        SystemId::Mes,
        SystemId::Lims,
        SystemId::Erp,
        SystemId::Training,
        SystemId::Equipment,
    ];

    /// Lowercase wire name used in routing keys and queue names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SystemId::Edms => "edms",
            SystemId::Mes => "mes",
            SystemId::Lims => "lims",
            SystemId::Erp => "erp",
            SystemId::Training => "training",
            SystemId::Equipment => "equipment",
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a system name outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown system: {0}")]
pub struct UnknownSystem(pub String);

impl FromStr for SystemId {
    type Err = UnknownSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SystemId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownSystem(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// RoutingScheme
// ---------------------------------------------------------------------------

/// Derives routing keys and queue names from a node prefix.
///
/// Keys are deterministic: one outbound key per target and one inbound queue
/// per source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingScheme {
    prefix: String,
}

impl RoutingScheme {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Routing key for messages this node sends to `target`.
    #[must_use]
    pub fn outbound_key(&self, target: &str) -> String {
        format!("{}.to.{}", self.prefix, target)
    }

    /// Routing key a sibling uses when sending to this node.
    #[must_use]
    pub fn inbound_key(&self, source: &str) -> String {
        format!("{}.to.{}", source, self.prefix)
    }

    /// Queue this node consumes for messages from `source`.
    #[must_use]
    pub fn inbound_queue(&self, source: &str) -> String {
        format!("{}.{}.queue", self.prefix, source)
    }

    /// Routing key bound to the dead-letter queue.
    #[must_use]
    pub fn dead_letter_key(&self) -> String {
        format!("{}.dead-letter", self.prefix)
    }

    #[must_use]
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead-letter.queue", self.prefix)
    }

    /// Recovers the source system from one of this scheme's inbound queue names.
    #[must_use]
    pub fn source_of_queue<'a>(&self, queue: &'a str) -> Option<&'a str> {
        queue
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('.')?
            .strip_suffix(".queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ids_round_trip_through_strings() {
        for id in SystemId::ALL {
            assert_eq!(id.as_str().parse::<SystemId>().unwrap(), id);
        }
        assert_eq!("MES".parse::<SystemId>().unwrap(), SystemId::Mes);
        assert!("crm".parse::<SystemId>().is_err());
    }

    #[test]
    fn keys_follow_naming_scheme() {
        let scheme = RoutingScheme::new("qms");
        assert_eq!(scheme.outbound_key("mes"), "qms.to.mes");
        assert_eq!(scheme.inbound_key("mes"), "mes.to.qms");
        assert_eq!(scheme.inbound_queue("lims"), "qms.lims.queue");
        assert_eq!(scheme.dead_letter_key(), "qms.dead-letter");
        assert_eq!(scheme.dead_letter_queue(), "qms.dead-letter.queue");
    }

    #[test]
    fn source_of_queue_inverts_inbound_queue() {
        let scheme = RoutingScheme::new("qms");
        assert_eq!(scheme.source_of_queue("qms.erp.queue"), Some("erp"));
        assert_eq!(scheme.source_of_queue("other.erp.queue"), None);
        assert_eq!(scheme.source_of_queue("qms.erp"), None);
    }
}
