//! MCP protocol versions and the compatibility rule between hub nodes.
//!
//! Versions follow the `MAJOR.MINOR.PATCH[-pre][+build]` shape. Ordering and
//! compatibility only look at the numeric triple; pre-release and build
//! metadata are kept for display but never compared.
//!
//! # Compatibility rule
//!
//! A client may talk to this node iff `client.major == current.major` and
//! `client.minor <= current.minor`. An older client can reach a newer,
//! backward-compatible server; a newer client is refused by an older server.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

/// Accepted version grammar, captured into numeric components and metadata.
static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9]+)\.([0-9]+)\.([0-9]+)(?:-([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)?))?(?:\+([A-Za-z0-9_]+))?$",
    )
    .expect("version pattern is a valid regex")
});

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to parse a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version format: '{input}' (expected MAJOR.MINOR.PATCH[-pre][+build])")]
    InvalidFormat { input: String },
}

/// Outcome of a strict compatibility check against the current version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompatibilityError {
    #[error(transparent)]
    InvalidFormat(#[from] VersionError),
    #[error("client version {client} is not compatible with server version {server}")]
    Incompatible { client: Version, server: Version },
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// An immutable `(major, minor, patch)` protocol version.
///
/// Equality and ordering ignore `pre_release` and `build`.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre_release: Option<String>,
    pub build: Option<String>,
}

impl Version {
    /// Builds a plain numeric version with no metadata.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// Parses `MAJOR.MINOR.PATCH[-pre][+build]`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::InvalidFormat`] when the input does not match
    /// the grammar or a numeric component does not fit in a `u64`.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat {
            input: input.to_string(),
        };

        let caps = VERSION_PATTERN.captures(input).ok_or_else(invalid)?;
        let number = |idx: usize| -> Result<u64, VersionError> {
            caps[idx].parse::<u64>().map_err(|_| invalid())
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            pre_release: caps.get(4).map(|m| m.as_str().to_string()),
            build: caps.get(5).map(|m| m.as_str().to_string()),
        })
    }

    /// Three-way comparison returning `-1`, `0` or `1`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> i8 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// VersionCompatibility
// ---------------------------------------------------------------------------

/// Decides whether a caller's protocol version may talk to this node.
#[derive(Debug, Clone)]
pub struct VersionCompatibility {
    current: Version,
    current_str: String,
}

impl VersionCompatibility {
    /// Creates a checker for the given server version.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::InvalidFormat`] if `current` is malformed.
    pub fn new(current: &str) -> Result<Self, VersionError> {
        let parsed = Version::parse(current)?;
        Ok(Self {
            current: parsed,
            current_str: current.to_string(),
        })
    }

    /// The parsed server version.
    #[must_use]
    pub fn current(&self) -> &Version {
        &self.current
    }

    /// The server version exactly as configured.
    #[must_use]
    pub fn current_str(&self) -> &str {
        &self.current_str
    }

    /// Oldest client version this node still accepts (`MAJOR.0.0`).
    #[must_use]
    pub fn minimum_compatible(&self) -> Version {
        Version::new(self.current.major, 0, 0)
    }

    /// Returns `true` if `client` may talk to this node.
    ///
    /// Malformed input is never compatible. The parse error is logged here
    /// and not surfaced; use [`check`](Self::check) when the reason matters.
    #[must_use]
    pub fn is_compatible(&self, client: &str) -> bool {
        match self.check(client) {
            Ok(_) => true,
            Err(CompatibilityError::InvalidFormat(err)) => {
                tracing::warn!(client_version = client, error = %err, "malformed client version");
                false
            }
            Err(CompatibilityError::Incompatible { .. }) => false,
        }
    }

    /// Parses `client` and applies the compatibility rule.
    ///
    /// # Errors
    ///
    /// - [`CompatibilityError::InvalidFormat`] for malformed input.
    /// - [`CompatibilityError::Incompatible`] when the major differs or the
    ///   client's minor is ahead of the server's.
    pub fn check(&self, client: &str) -> Result<Version, CompatibilityError> {
        let client = Version::parse(client)?;
        if client.major == self.current.major && client.minor <= self.current.minor {
            Ok(client)
        } else {
            Err(CompatibilityError::Incompatible {
                client,
                server: self.current.clone(),
            })
        }
    }

    /// Describes how to move a deployment from `from` to `to`.
    ///
    /// Operator guidance only; nothing here is executed.
    #[must_use]
    pub fn upgrade_path(from: &str, to: &str) -> String {
        let (from_v, to_v) = match (Version::parse(from), Version::parse(to)) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(err), _) | (_, Err(err)) => return format!("cannot plan upgrade: {err}"),
        };

        match from_v.cmp(&to_v) {
            Ordering::Equal => format!("{from_v} is already at {to_v}; no upgrade needed"),
            Ordering::Greater => format!(
                "downgrade from {from_v} to {to_v} is not supported; \
                 redeploy {from_v} or roll forward past it"
            ),
            Ordering::Less if from_v.major != to_v.major => {
                let mut steps = Vec::new();
                for major in from_v.major + 1..=to_v.major {
                    steps.push(format!("migrate protocol to {major}.0.0"));
                }
                if to_v.minor > 0 || to_v.patch > 0 {
                    steps.push(format!("apply minor/patch updates up to {to_v}"));
                }
                format!(
                    "major upgrade {from_v} -> {to_v} breaks wire compatibility: {}; \
                     upgrade servers before clients",
                    steps.join(", then ")
                )
            }
            Ordering::Less if from_v.minor != to_v.minor => format!(
                "minor upgrade {from_v} -> {to_v} is backward compatible; \
                 upgrade servers first, clients on {}.{} keep working",
                from_v.major, from_v.minor
            ),
            Ordering::Less => {
                format!("patch upgrade {from_v} -> {to_v}; safe to roll in any order")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_plain_triple() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
        assert!(v.pre_release.is_none());
        assert!(v.build.is_none());
    }

    #[test]
    fn parse_with_pre_release_and_build() {
        let v = Version::parse("2.0.1-rc.1+build42").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 0, 1));
        assert_eq!(v.pre_release.as_deref(), Some("rc.1"));
        assert_eq!(v.build.as_deref(), Some("build42"));
        assert_eq!(v.to_string(), "2.0.1-rc.1+build42");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for input in [
            "not-a-version",
            "",
            "1.2",
            "1.2.3.4",
            "v1.2.3",
            "1.2.x",
            " 1.2.3",
            "1.2.3-",
            "1.2.3-é",
            "1.2.3+ß",
            "١.٢.٣",
        ] {
            let err = Version::parse(input).unwrap_err();
            assert_eq!(
                err,
                VersionError::InvalidFormat {
                    input: input.to_string()
                }
            );
        }
    }

    #[test]
    fn parse_rejects_component_overflow() {
        assert!(Version::parse("99999999999999999999.0.0").is_err());
    }

    #[test]
    fn compare_ignores_metadata() {
        let a = Version::parse("1.2.3-alpha").unwrap();
        let b = Version::parse("1.2.3+sha").unwrap();
        assert_eq!(a.compare(&b), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn compare_orders_lexicographically() {
        let v = |s: &str| Version::parse(s).unwrap();
        assert_eq!(v("1.2.3").compare(&v("1.2.4")), -1);
        assert_eq!(v("1.10.0").compare(&v("1.9.9")), 1);
        assert_eq!(v("2.0.0").compare(&v("1.99.99")), 1);
    }

    #[test]
    fn major_mismatch_is_incompatible() {
        let compat = VersionCompatibility::new("1.5.0").unwrap();
        assert!(!compat.is_compatible("2.0.0"));
        assert!(!compat.is_compatible("0.5.0"));
    }

    #[test]
    fn older_minor_is_compatible_newer_minor_is_not() {
        let compat = VersionCompatibility::new("1.5.0").unwrap();
        assert!(compat.is_compatible("1.3.0"));
        assert!(compat.is_compatible("1.5.9"));
        assert!(!compat.is_compatible("1.6.0"));
    }

    #[test]
    fn malformed_client_is_incompatible_not_an_error() {
        let compat = VersionCompatibility::new("1.5.0").unwrap();
        assert!(!compat.is_compatible("garbage"));
    }

    #[test]
    fn check_reports_reason() {
        let compat = VersionCompatibility::new("1.5.0").unwrap();
        assert!(matches!(
            compat.check("x.y.z"),
            Err(CompatibilityError::InvalidFormat(_))
        ));
        match compat.check("1.6.0") {
            Err(CompatibilityError::Incompatible { client, server }) => {
                assert_eq!(client, Version::new(1, 6, 0));
                assert_eq!(server, Version::new(1, 5, 0));
            }
            other => panic!("expected Incompatible, got {other:?}"),
        }
        assert_eq!(compat.check("1.0.0").unwrap(), Version::new(1, 0, 0));
    }

    #[test]
    fn new_rejects_malformed_server_version() {
        assert!(VersionCompatibility::new("one.two").is_err());
    }

    #[test]
    fn minimum_compatible_is_major_zero_zero() {
        let compat = VersionCompatibility::new("3.4.5").unwrap();
        assert_eq!(compat.minimum_compatible().to_string(), "3.0.0");
    }

    #[test]
    fn upgrade_path_describes_each_case() {
        assert!(VersionCompatibility::upgrade_path("1.0.0", "1.0.0").contains("no upgrade needed"));
        assert!(VersionCompatibility::upgrade_path("1.0.0", "1.0.1").contains("patch upgrade"));
        assert!(VersionCompatibility::upgrade_path("1.0.0", "1.2.0").contains("minor upgrade"));
        let major = VersionCompatibility::upgrade_path("1.4.0", "3.1.0");
        assert!(major.contains("migrate protocol to 2.0.0"));
        assert!(major.contains("migrate protocol to 3.0.0"));
        assert!(VersionCompatibility::upgrade_path("2.0.0", "1.0.0").contains("downgrade"));
        assert!(VersionCompatibility::upgrade_path("bad", "1.0.0").contains("cannot plan"));
    }

    fn version_strategy() -> impl Strategy<Value = Version> {
        (0u64..20, 0u64..20, 0u64..20).prop_map(|(a, b, c)| Version::new(a, b, c))
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
            prop_assert_eq!(a.compare(&b), -b.compare(&a));
            prop_assert!([-1, 0, 1].contains(&a.compare(&b)));
        }

        #[test]
        fn compare_is_transitive(
            a in version_strategy(),
            b in version_strategy(),
            c in version_strategy(),
        ) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn other_major_never_compatible(major in 2u64..50, minor in 0u64..50, patch in 0u64..50) {
            let compat = VersionCompatibility::new("1.5.0").unwrap();
            let client = format!("{major}.{minor}.{patch}");
            prop_assert!(!compat.is_compatible(&client));
        }

        #[test]
        fn display_round_trips(a in version_strategy()) {
            prop_assert_eq!(Version::parse(&a.to_string()).unwrap(), a);
        }
    }
}
