//! Typed project model.
//!
//! Services are held as raw YAML until normalization, merging, and
//! `extends` resolution are complete; [`ServiceDefinition::from_value`] is
//! the single point where a service becomes a typed value. Keys the model
//! does not name are kept in each struct's `extra` map.

use std::collections::{BTreeMap, BTreeSet};

use convoy_common::error::{ComposeError, Result};
use convoy_common::types::{ConfigHash, ServiceDependency, ServiceDependencyCondition};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Build settings of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Directory or git URL to build from; absolute after resolution.
    pub context: Option<String>,
    /// Dockerfile path relative to the context.
    pub dockerfile: Option<String>,
    /// `KEY=VALUE` build arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// `NAME=VALUE` named build contexts.
    #[serde(default)]
    pub additional_contexts: Vec<String>,
    /// Build stage to stop at.
    pub target: Option<String>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// Services whose images this build consumes, sorted.
    #[serde(skip)]
    pub build_deps: Vec<String>,
}

/// One `depends_on` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    /// Readiness the dependency must reach.
    #[serde(default)]
    pub condition: ServiceDependencyCondition,
    /// Whether a missing dependency is an error.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Restart this service when the dependency is updated.
    #[serde(default)]
    pub restart: bool,
}

const fn default_true() -> bool {
    true
}

/// An `env_file` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFile {
    /// A bare path; the file must exist.
    Path(String),
    /// Long form.
    Detailed {
        /// Path to the file.
        path: String,
        /// Whether a missing file is an error.
        #[serde(default = "default_true")]
        required: bool,
    },
}

/// Per-network service settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNetwork {
    /// Extra DNS names on this network.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Static IPv4 address.
    pub ipv4_address: Option<String>,
    /// Static IPv6 address.
    pub ipv6_address: Option<String>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `deploy` settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploySpec {
    /// `replicated` or `global`.
    pub mode: Option<String>,
    /// Replica count; honored only in `replicated` mode.
    pub replicas: Option<u32>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A healthcheck test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthTest {
    /// Run through the container's shell.
    Shell(String),
    /// `["CMD", ...]`, `["CMD-SHELL", ...]`, or `["NONE"]`.
    Exec(Vec<String>),
}

/// `healthcheck` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Probe command.
    pub test: Option<HealthTest>,
    /// Time between probes.
    pub interval: Option<String>,
    /// Probe timeout.
    pub timeout: Option<String>,
    /// Initialization grace period.
    pub start_period: Option<String>,
    /// Consecutive failures before unhealthy.
    pub retries: Option<u32>,
    /// Disables any image-defined check.
    #[serde(default)]
    pub disable: bool,
}

/// A service's reference to a top-level secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSecret {
    /// Secret name only.
    Name(String),
    /// Long form.
    Detailed {
        /// Top-level secret name.
        source: String,
        /// File name or path inside the container.
        target: Option<String>,
        /// Owner user id.
        #[serde(default, deserialize_with = "de::opt_string")]
        uid: Option<String>,
        /// Owner group id.
        #[serde(default, deserialize_with = "de::opt_string")]
        gid: Option<String>,
        /// File mode.
        mode: Option<u32>,
    },
}

impl ServiceSecret {
    /// Name of the referenced top-level secret.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { source, .. } => source,
        }
    }
}

/// A resource limit: one value for both soft and hard, or a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ulimit {
    /// Same soft and hard limit.
    Single(i64),
    /// Separate limits.
    Pair {
        /// Soft limit.
        soft: i64,
        /// Hard limit.
        hard: i64,
    },
}

/// Kind of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// Host path.
    Bind,
    /// Named or anonymous volume.
    Volume,
    /// In-memory filesystem.
    Tmpfs,
    /// Host paths matched by a glob.
    Glob,
    /// Contents of an image.
    Image,
}

/// Bind-specific mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOptions {
    /// Mount propagation (`rprivate`, `shared`, ...).
    pub propagation: Option<String>,
    /// Create the host path if missing.
    pub create_host_path: Option<bool>,
    /// SELinux relabeling: `z` or `Z`.
    pub selinux: Option<String>,
}

/// Volume-specific mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Do not copy image data into a new volume.
    pub nocopy: Option<bool>,
    /// Sub-path of the volume to mount.
    pub subpath: Option<String>,
}

/// Tmpfs-specific mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpfsOptions {
    /// Size limit, as bytes or with a unit suffix.
    #[serde(default, deserialize_with = "de::opt_string")]
    pub size: Option<String>,
    /// File mode of the mount point.
    pub mode: Option<u32>,
}

/// A mount in canonical long form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Mount kind.
    #[serde(rename = "type")]
    pub kind: MountType,
    /// Host path, volume name, or image; absent for anonymous volumes and
    /// tmpfs.
    pub source: Option<String>,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Consistency requirement (`consistent`, `cached`, `delegated`).
    pub consistency: Option<String>,
    /// Bind options.
    pub bind: Option<BindOptions>,
    /// Volume options.
    pub volume: Option<VolumeOptions>,
    /// Tmpfs options.
    pub tmpfs: Option<TmpfsOptions>,
    /// Runtime name of the volume this mount refers to, once resolved.
    #[serde(skip)]
    pub volume_name: Option<String>,
}

/// A `volumes` entry as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeEntry {
    /// `source:target:options`.
    Short(String),
    /// Long form.
    Long(MountDescriptor),
}

/// `external` on a top-level declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct External {
    /// The object is managed outside the project.
    pub enabled: bool,
    /// Legacy `external: {name: ...}` form.
    pub name: Option<String>,
}

impl<'de> Deserialize<'de> for External {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(Self::default()),
            Value::Bool(enabled) => Ok(Self {
                enabled,
                name: None,
            }),
            Value::Mapping(m) => Ok(Self {
                enabled: true,
                name: m.get("name").and_then(Value::as_str).map(str::to_owned),
            }),
            other => Err(serde::de::Error::custom(format!(
                "external must be a boolean or mapping, got {other:?}"
            ))),
        }
    }
}

/// A top-level volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    /// Explicit runtime name.
    pub name: Option<String>,
    /// Volume driver.
    pub driver: Option<String>,
    /// Driver options.
    #[serde(default, deserialize_with = "de::string_map")]
    pub driver_opts: BTreeMap<String, String>,
    /// Volume labels.
    #[serde(default, deserialize_with = "de::string_map")]
    pub labels: BTreeMap<String, String>,
    /// Managed outside the project.
    #[serde(default)]
    pub external: External,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// Name the engine knows this volume by.
    #[serde(skip)]
    pub runtime_name: String,
}

/// A top-level network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Explicit runtime name.
    pub name: Option<String>,
    /// Network driver.
    pub driver: Option<String>,
    /// Driver options.
    #[serde(default, deserialize_with = "de::string_map")]
    pub driver_opts: BTreeMap<String, String>,
    /// Network labels.
    #[serde(default, deserialize_with = "de::string_map")]
    pub labels: BTreeMap<String, String>,
    /// No external connectivity.
    #[serde(default)]
    pub internal: bool,
    /// Managed outside the project.
    #[serde(default)]
    pub external: External,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// Name the engine knows this network by.
    #[serde(skip)]
    pub runtime_name: String,
}

/// A top-level secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretDefinition {
    /// Explicit runtime name.
    pub name: Option<String>,
    /// Host file holding the secret.
    pub file: Option<String>,
    /// Environment variable holding the secret.
    pub environment: Option<String>,
    /// Managed outside the project.
    #[serde(default)]
    pub external: External,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// Name the engine knows this secret by.
    #[serde(skip)]
    pub runtime_name: String,
}

/// Runtime name of a top-level object: external objects keep their
/// declared name, everything else is scoped to the project.
pub(crate) fn runtime_name(
    project: &str,
    logical: &str,
    explicit: Option<&str>,
    external: &External,
) -> String {
    if let Some(name) = external.name.as_deref().or(explicit) {
        return name.to_owned();
    }
    if external.enabled {
        logical.to_owned()
    } else {
        format!("{project}_{logical}")
    }
}

/// One fully resolved service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name.
    #[serde(skip)]
    pub name: String,
    /// Image to run (or to tag the build result with).
    pub image: Option<String>,
    /// Build settings.
    pub build: Option<BuildSpec>,
    /// Command arguments.
    pub command: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Environment; `None` values are taken from the ambient environment.
    #[serde(default)]
    pub environment: BTreeMap<String, Option<String>>,
    /// Dotenv files for the container.
    #[serde(default)]
    pub env_file: Vec<EnvFile>,
    /// Container labels.
    #[serde(default)]
    pub labels: BTreeMap<String, Option<String>>,
    /// Mounts as written.
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
    /// Published ports in short form.
    #[serde(default, deserialize_with = "de::ports")]
    pub ports: Vec<String>,
    /// Attached networks.
    #[serde(default, deserialize_with = "de::service_networks")]
    pub networks: BTreeMap<String, Option<ServiceNetwork>>,
    /// `host`, `none`, `service:x`, ...
    pub network_mode: Option<String>,
    /// Declared dependencies.
    #[serde(default)]
    pub depends_on: BTreeMap<String, DependsOn>,
    /// Legacy links, `service[:alias]`.
    #[serde(default)]
    pub links: Vec<String>,
    /// Profiles enabling this service.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Replica count.
    pub scale: Option<u32>,
    /// Deployment settings.
    pub deploy: Option<DeploySpec>,
    /// Name for the first container.
    pub container_name: Option<String>,
    /// Health check.
    pub healthcheck: Option<Healthcheck>,
    /// Secrets exposed to the container.
    #[serde(default)]
    pub secrets: Vec<ServiceSecret>,
    /// Security options.
    #[serde(default)]
    pub security_opt: Vec<String>,
    /// Resource limits.
    #[serde(default)]
    pub ulimits: BTreeMap<String, Ulimit>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,

    /// Services this one transitively depends on.
    #[serde(skip)]
    pub deps: BTreeSet<ServiceDependency>,
    /// Services transitively depending on this one.
    #[serde(skip)]
    pub dependents: BTreeSet<ServiceDependency>,
    /// Mounts in canonical form, with volume references resolved.
    #[serde(skip)]
    pub mounts: Vec<MountDescriptor>,
    /// Hash over the service's public configuration.
    #[serde(skip)]
    pub fingerprint: Option<ConfigHash>,
}

impl ServiceDefinition {
    /// Converts a normalized, marker-free service mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Normalization`] naming the service when a
    /// field has the wrong shape.
    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        let value = match value {
            Value::Null => Value::Mapping(serde_yaml::Mapping::new()),
            other => other.clone(),
        };
        let fingerprint = fingerprint(&value)?;
        let mut service: Self =
            serde_yaml::from_value(value).map_err(|e| ComposeError::Normalization {
                field: format!("services.{name}"),
                message: e.to_string(),
            })?;
        service.name = name.to_owned();
        service.fingerprint = Some(fingerprint);
        Ok(service)
    }

    /// Profiles this service belongs to.
    #[must_use]
    pub fn profile_set(&self) -> BTreeSet<&str> {
        self.profiles.iter().map(String::as_str).collect()
    }

    /// `--ulimit` values, `name=soft:hard` or `name=value`.
    #[must_use]
    pub fn ulimit_args(&self) -> Vec<String> {
        self.ulimits
            .iter()
            .map(|(name, limit)| match limit {
                Ulimit::Single(value) => format!("{name}={value}"),
                Ulimit::Pair { soft, hard } => format!("{name}={soft}:{hard}"),
            })
            .collect()
    }

    /// Labels as `KEY=VALUE` (or bare `KEY`) strings.
    #[must_use]
    pub fn label_strings(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|(k, v)| v.as_ref().map_or_else(|| k.clone(), |v| format!("{k}={v}")))
            .collect()
    }
}

/// Canonical JSON form of a YAML value: keys sorted and stringified, tags
/// dropped.
///
/// # Errors
///
/// Returns [`ComposeError::Config`] for a non-finite float.
pub fn canonical_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| ComposeError::Config {
                        message: format!("cannot represent number {n} canonically"),
                    })?
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Sequence(items) => serde_json::Value::Array(
            items.iter().map(canonical_json).collect::<Result<Vec<_>>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let _ = out.insert(yaml_key(k), canonical_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        Value::Tagged(tagged) => canonical_json(&tagged.value)?,
    })
}

fn yaml_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_owned(),
        other => serde_json::to_string(&canonical_json(other).unwrap_or_default())
            .unwrap_or_default(),
    }
}

/// Hash over a service's public fields: top-level keys starting with `_`
/// are excluded, and key order does not matter.
///
/// # Errors
///
/// See [`canonical_json`].
pub fn fingerprint(service: &Value) -> Result<ConfigHash> {
    let mut public = canonical_json(service)?;
    if let serde_json::Value::Object(map) = &mut public {
        map.retain(|k, _| !k.starts_with('_'));
    }
    Ok(ConfigHash::of_bytes(&serde_json::to_vec(&public)?))
}

/// One container to create for a service replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    /// Container name.
    pub name: String,
    /// Service the container runs.
    pub service: String,
    /// 1-based replica number.
    pub num: u32,
    /// Image to run.
    pub image: String,
    /// Pod the container joins, if any.
    pub pod: Option<String>,
    /// Labels, `KEY=VALUE`.
    pub labels: Vec<String>,
    /// Published ports, short form.
    pub ports: Vec<String>,
    /// Runtime names of attached networks.
    pub networks: Vec<String>,
    /// Mounts with volume names resolved.
    pub mounts: Vec<MountDescriptor>,
    /// Fingerprint of the service configuration.
    pub config_hash: ConfigHash,
    /// Services this container's service depends on.
    pub deps: BTreeSet<ServiceDependency>,
    /// Services depending on this container's service.
    pub dependents: BTreeSet<ServiceDependency>,
}

/// A pod grouping the project's containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodRecord {
    /// Pod name.
    pub name: String,
    /// Labels applied to the pod.
    pub labels: Vec<String>,
}

/// Lenient deserializers for fields compose files spell several ways.
mod de {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_yaml::Value;

    use super::ServiceNetwork;
    use crate::normalize::scalar_string;

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            other => scalar_string(&other)
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected a scalar")),
        }
    }

    pub fn string_map<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, String>, D::Error> {
        let mut out = BTreeMap::new();
        match Value::deserialize(d)? {
            Value::Null => {}
            Value::Mapping(map) => {
                for (k, v) in map {
                    let k = scalar_string(&k).ok_or_else(|| D::Error::custom("expected scalar keys"))?;
                    let v = scalar_string(&v).unwrap_or_default();
                    let _ = out.insert(k, v);
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    let item =
                        scalar_string(&item).ok_or_else(|| D::Error::custom("expected KEY=VALUE"))?;
                    let (k, v) = item.split_once('=').unwrap_or((item.as_str(), ""));
                    let _ = out.insert(k.to_owned(), v.to_owned());
                }
            }
            _ => return Err(D::Error::custom("expected a mapping or list")),
        }
        Ok(out)
    }

    pub fn ports<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(Vec::new()),
            Value::Sequence(items) => items
                .iter()
                .map(|item| port_string(item).map_err(D::Error::custom))
                .collect(),
            other => port_string(&other).map(|p| vec![p]).map_err(D::Error::custom),
        }
    }

    /// Short form of one port entry.
    pub fn port_string(port: &Value) -> Result<String, String> {
        if let Some(short) = scalar_string(port) {
            return Ok(short);
        }
        let Value::Mapping(long) = port else {
            return Err("port must be a string, number, or mapping".into());
        };
        let field = |name: &str| long.get(name).and_then(scalar_string).unwrap_or_default();
        let target = field("target");
        if target.is_empty() {
            return Err("target container port must be specified".into());
        }
        let published = field("published");
        let host_ip = field("host_ip");
        let mut short = if !host_ip.is_empty() {
            format!("{host_ip}:{published}:{target}")
        } else if !published.is_empty() {
            format!("{published}:{target}")
        } else {
            target
        };
        let protocol = field("protocol");
        if !protocol.is_empty() && protocol != "tcp" {
            short.push('/');
            short.push_str(&protocol);
        }
        Ok(short)
    }

    pub fn service_networks<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, Option<ServiceNetwork>>, D::Error> {
        let mut out = BTreeMap::new();
        match Value::deserialize(d)? {
            Value::Null => {}
            Value::Sequence(items) => {
                for item in items {
                    let name = item
                        .as_str()
                        .ok_or_else(|| D::Error::custom("network names must be strings"))?;
                    let _ = out.insert(name.to_owned(), None);
                }
            }
            Value::Mapping(map) => {
                for (k, v) in map {
                    let name = k
                        .as_str()
                        .ok_or_else(|| D::Error::custom("network names must be strings"))?;
                    let settings = match v {
                        Value::Null => None,
                        other => Some(serde_yaml::from_value(other).map_err(D::Error::custom)?),
                    };
                    let _ = out.insert(name.to_owned(), settings);
                }
            }
            _ => return Err(D::Error::custom("networks must be a list or mapping")),
        }
        Ok(out)
    }
}
