//! Domain value types shared between the resolver and its consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ComposeError, Result};

/// Readiness state a dependency must reach before a dependent may proceed.
///
/// The lower-case spelling of each variant is the condition string the
/// container engine's `wait` command understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceDependencyCondition {
    /// Container configuration exists.
    Configured,
    /// Container has been created.
    Created,
    /// Container has exited.
    Exited,
    /// Container health check passes.
    Healthy,
    /// Container has been initialized.
    Initialized,
    /// Container is paused.
    Paused,
    /// Container is being removed.
    Removing,
    /// Container is running.
    #[default]
    Running,
    /// Container has stopped.
    Stopped,
    /// Container is stopping.
    Stopping,
    /// Container health check fails.
    Unhealthy,
}

impl ServiceDependencyCondition {
    /// Every condition, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Configured,
        Self::Created,
        Self::Exited,
        Self::Healthy,
        Self::Initialized,
        Self::Paused,
        Self::Removing,
        Self::Running,
        Self::Stopped,
        Self::Stopping,
        Self::Unhealthy,
    ];

    /// Returns the engine-level condition string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Created => "created",
            Self::Exited => "exited",
            Self::Healthy => "healthy",
            Self::Initialized => "initialized",
            Self::Paused => "paused",
            Self::Removing => "removing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Stopping => "stopping",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for ServiceDependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceDependencyCondition {
    type Err = ComposeError;

    /// Parses an engine condition or one of the compose-file aliases
    /// (`service_healthy`, `service_started`,
    /// `service_completed_successfully`).
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "service_healthy" => return Ok(Self::Healthy),
            "service_started" => return Ok(Self::Running),
            "service_completed_successfully" => return Ok(Self::Stopped),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .ok_or_else(|| ComposeError::Normalization {
                field: "depends_on.condition".into(),
                message: format!("unknown dependency condition \"{value}\""),
            })
    }
}

impl Serialize for ServiceDependencyCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceDependencyCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An edge in the service dependency graph: the named service must reach
/// `condition` first.
///
/// Equality and hashing cover both fields, so the same service may appear
/// twice in a set with different conditions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceDependency {
    /// Name of the service depended upon.
    pub name: String,
    /// Readiness condition required.
    pub condition: ServiceDependencyCondition,
}

impl ServiceDependency {
    /// Creates a dependency edge.
    #[must_use]
    pub fn new(name: impl Into<String>, condition: ServiceDependencyCondition) -> Self {
        Self {
            name: name.into(),
            condition,
        }
    }
}

impl fmt::Display for ServiceDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.condition)
    }
}

/// Stages of one project resolution, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResolveStage {
    /// Nothing read yet.
    Init,
    /// Source documents (and their includes) parsed.
    DocumentsLoaded,
    /// Variables substituted.
    Interpolated,
    /// Documents folded into one.
    Merged,
    /// Shorthand forms canonicalized.
    Normalized,
    /// `extends` references merged in.
    ExtendsResolved,
    /// Dependency and dependent sets computed.
    DepsBuilt,
    /// Services outside the requested profiles removed.
    ProfilesFiltered,
    /// Build-context references resolved and checked for cycles.
    BuildGraphChecked,
    /// Container records produced.
    ReplicasExpanded,
    /// Resolution finished.
    Done,
}

impl fmt::Display for ResolveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::DocumentsLoaded => "loading documents",
            Self::Interpolated => "interpolating variables",
            Self::Merged => "merging documents",
            Self::Normalized => "normalizing services",
            Self::ExtendsResolved => "resolving extends",
            Self::DepsBuilt => "building dependency graph",
            Self::ProfilesFiltered => "filtering profiles",
            Self::BuildGraphChecked => "checking build graph",
            Self::ReplicasExpanded => "expanding replicas",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// SHA-256 digest used to fingerprint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(String);

impl ConfigHash {
    /// Hashes the given bytes.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
