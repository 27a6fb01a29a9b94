//! Project resolution: from compose files and an environment to the final
//! project model.
//!
//! [`ProjectResolver::resolve`] walks the stages of [`ResolveStage`] in
//! order and stops at the first failure, which is reported together with
//! the stage it aborted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use convoy_common::config::ResolveOptions;
use convoy_common::constants::{
    APP_VERSION, DEFAULT_COMPOSE_FILES, DEFAULT_ENV_FILE, DEFAULT_PATH_SEPARATOR,
    ENV_COMPOSE_FILE, ENV_PATH_SEPARATOR, ENV_PROFILES, ENV_PROJECT_DIR, ENV_PROJECT_NAME,
    LABEL_COMPOSE_PROJECT, LABEL_CONFIG_FILES, LABEL_CONFIG_HASH, LABEL_CONTAINER_NUMBER,
    LABEL_PROJECT, LABEL_SERVICE, LABEL_VERSION, LABEL_WORKING_DIR, NAME_SEPARATOR,
};
use convoy_common::error::{ComposeError, Result};
use convoy_common::types::{ConfigHash, ResolveStage};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::build_graph::{resolve_context_dependencies, service_image};
use crate::document::{DocumentSource, FileSystemSource, document_dir, load_documents};
use crate::env::{Environment, load_dotenv, overlay, process_environment};
use crate::extends::{extends_order, resolve_extends};
use crate::graph::{DependencyGraph, DependencyMap, DependencySets, flat_deps};
use crate::interpolate::interpolate;
use crate::merge::{finalize, merge_all, type_name};
use crate::model::{
    ContainerRecord, NetworkDefinition, PodRecord, SecretDefinition, ServiceDefinition,
    VolumeDefinition, canonical_json, runtime_name,
};
use crate::mount::{assign_volume_name, resolve_entry};
use crate::normalize::{finalize_build_contexts, normalize_document, normalize_path};

/// Profile name enabling every service.
const ALL_PROFILES: &str = "*";

/// A fully resolved project.
#[derive(Debug, Clone)]
pub struct Project {
    /// Project name, used to scope every runtime object.
    pub name: String,
    /// Absolute project directory.
    pub dir: PathBuf,
    /// Compose files, as given.
    pub files: Vec<PathBuf>,
    /// Ambient environment the documents were interpolated with.
    pub environment: Environment,
    /// The merged document, free of merge markers.
    pub merged: Mapping,
    /// Hash of the merged document.
    pub config_hash: ConfigHash,
    /// Services enabled by the requested profiles.
    pub services: BTreeMap<String, ServiceDefinition>,
    /// Declared networks.
    pub networks: BTreeMap<String, NetworkDefinition>,
    /// Network services join when they name none.
    pub default_network: Option<String>,
    /// Declared volumes.
    pub volumes: BTreeMap<String, VolumeDefinition>,
    /// Declared secrets.
    pub secrets: BTreeMap<String, SecretDefinition>,
    /// One record per service replica, fewest dependencies first.
    pub containers: Vec<ContainerRecord>,
    /// Pods the containers join.
    pub pods: Vec<PodRecord>,
}

impl Project {
    /// The merged document as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Config`] if the document cannot be
    /// serialized.
    pub fn config_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.merged).map_err(|e| ComposeError::Config {
            message: format!("cannot serialize merged document: {e}"),
        })
    }

    /// Service names with dependencies first; ties sort by name.
    #[must_use]
    pub fn start_order(&self) -> Vec<String> {
        let deps: DependencyMap = self
            .services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.deps.clone()))
            .collect();
        DependencyGraph::from_map("service", &deps).resolve_order_lenient()
    }

    /// Checks that every name is a service of this project.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownReference`] for the first unknown
    /// name.
    pub fn assert_services<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        for name in names {
            let name = name.as_ref();
            if !self.services.contains_key(name) {
                return Err(ComposeError::UnknownReference {
                    kind: "service",
                    name: name.to_owned(),
                    referrer: "the command line".into(),
                });
            }
        }
        Ok(())
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    /// Containers of one service, by replica number.
    pub fn containers_of<'a>(
        &'a self,
        service: &'a str,
    ) -> impl Iterator<Item = &'a ContainerRecord> + 'a {
        self.containers.iter().filter(move |c| c.service == service)
    }

    /// Looks up a container by name.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<&ContainerRecord> {
        self.containers.iter().find(|c| c.name == name)
    }
}

/// Lower-cases `raw` and drops characters outside `[-_a-z0-9]`.
#[must_use]
pub fn normalize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
        .collect()
}

/// Resolves compose files into a [`Project`].
pub struct ProjectResolver<'a> {
    options: ResolveOptions,
    source: &'a dyn DocumentSource,
    environment: Option<Environment>,
}

impl std::fmt::Debug for ProjectResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectResolver")
            .field("options", &self.options)
            .field("environment", &self.environment.as_ref().map(BTreeMap::len))
            .finish_non_exhaustive()
    }
}

impl<'a> ProjectResolver<'a> {
    /// Creates a resolver reading documents from the filesystem.
    #[must_use]
    pub fn new(options: ResolveOptions) -> Self {
        Self {
            options,
            source: &FileSystemSource,
            environment: None,
        }
    }

    /// Reads documents through `source` instead.
    #[must_use]
    pub fn with_source(mut self, source: &'a dyn DocumentSource) -> Self {
        self.source = source;
        self
    }

    /// Uses `environment` in place of the process environment.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Runs every resolution stage.
    ///
    /// # Errors
    ///
    /// Returns the first failure, wrapped in [`ComposeError::Stage`].
    pub fn resolve(&self) -> Result<Project> {
        let mut base_env = match &self.environment {
            Some(env) => env.clone(),
            None if self.options.use_process_env => process_environment(),
            None => Environment::new(),
        };

        let stage = ResolveStage::Init;
        let files = self.compose_files(&base_env).map_err(|e| e.at_stage(stage))?;
        let dir = self.project_dir(&files).map_err(|e| e.at_stage(stage))?;
        self.load_environment(&mut base_env, &dir, &files)
            .map_err(|e| e.at_stage(stage))?;
        let mut env = base_env;

        let stage = ResolveStage::DocumentsLoaded;
        tracing::info!(%stage, files = files.len(), "resolving project");
        let documents = load_documents(&files, self.source).map_err(|e| e.at_stage(stage))?;

        let stage = ResolveStage::Interpolated;
        tracing::info!(%stage, documents = documents.len());
        let mut contents = Vec::with_capacity(documents.len());
        for mut document in documents {
            normalize_document(&mut document.content, None)
                .map_err(|e| e.at_stage(ResolveStage::Normalized))?;
            let value = interpolate(&Value::Mapping(document.content), &env)
                .map_err(|e| e.at_stage(stage))?;
            if let Value::Mapping(content) = value {
                contents.push(content);
            }
        }

        let stage = ResolveStage::Merged;
        tracing::info!(%stage);
        let mut merged = merge_all(&contents).map_err(|e| e.at_stage(stage))?;
        let name = self.project_name(&env, &merged, &dir).map_err(|e| e.at_stage(stage))?;
        tracing::debug!(project = %name, "project name resolved");
        let _ = env.insert(ENV_PROJECT_NAME.to_owned(), name.clone());

        let stage = ResolveStage::Normalized;
        tracing::info!(%stage);
        normalize_document(&mut merged, None).map_err(|e| e.at_stage(stage))?;

        let stage = ResolveStage::ExtendsResolved;
        tracing::info!(%stage);
        let merged = self
            .resolve_all_extends(merged, &env, &dir)
            .map_err(|e| e.at_stage(stage))?;
        let config_hash = document_hash(&merged).map_err(|e| e.at_stage(stage))?;

        let stage = ResolveStage::DepsBuilt;
        tracing::info!(%stage);
        let (mut services, mut sets) = typed_services(&merged).map_err(|e| e.at_stage(stage))?;

        let stage = ResolveStage::ProfilesFiltered;
        let profiles = self.requested_profiles(&env);
        tracing::info!(%stage, profiles = ?profiles);
        filter_profiles(&mut services, &mut sets, &profiles);
        for (svc_name, svc) in &mut services {
            svc.deps = sets.deps_of(svc_name);
            svc.dependents = sets.dependents_of(svc_name);
        }

        let stage = ResolveStage::BuildGraphChecked;
        tracing::info!(%stage);
        resolve_context_dependencies(&mut services, &name).map_err(|e| e.at_stage(stage))?;

        let stage = ResolveStage::ReplicasExpanded;
        tracing::info!(%stage);
        let mut project = Project {
            name,
            dir,
            files,
            environment: env,
            merged,
            config_hash,
            services,
            networks: BTreeMap::new(),
            default_network: None,
            volumes: BTreeMap::new(),
            secrets: BTreeMap::new(),
            containers: Vec::new(),
            pods: Vec::new(),
        };
        self.expand(&mut project).map_err(|e| e.at_stage(stage))?;

        tracing::info!(
            stage = %ResolveStage::Done,
            project = %project.name,
            services = project.services.len(),
            containers = project.containers.len(),
            "project resolved"
        );
        Ok(project)
    }

    fn compose_files(&self, env: &Environment) -> Result<Vec<PathBuf>> {
        if !self.options.files.is_empty() {
            return Ok(self.options.files.clone());
        }
        if let Some(list) = env.get(ENV_COMPOSE_FILE).filter(|l| !l.is_empty()) {
            let sep = env
                .get(ENV_PATH_SEPARATOR)
                .map_or(DEFAULT_PATH_SEPARATOR, String::as_str);
            return Ok(list
                .split(sep)
                .filter(|f| !f.is_empty())
                .map(PathBuf::from)
                .collect());
        }
        let dir = self.options.project_dir.clone().unwrap_or_default();
        let found: Vec<PathBuf> = DEFAULT_COMPOSE_FILES
            .iter()
            .map(|candidate| dir.join(candidate))
            .filter(|path| path.is_file())
            .collect();
        if found.is_empty() {
            return Err(ComposeError::Config {
                message: format!(
                    "no compose file found in {}, pass files with -f",
                    display_dir(&dir)
                ),
            });
        }
        Ok(found)
    }

    fn project_dir(&self, files: &[PathBuf]) -> Result<PathBuf> {
        let dir = match &self.options.project_dir {
            Some(dir) => dir.clone(),
            None => files.first().map(|f| document_dir(f)).unwrap_or_default(),
        };
        if dir.is_absolute() {
            return Ok(normalize_path(&dir));
        }
        let cwd = std::env::current_dir().map_err(|source| ComposeError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        Ok(normalize_path(&cwd.join(dir)))
    }

    fn load_environment(&self, env: &mut Environment, dir: &Path, files: &[PathBuf]) -> Result<()> {
        match &self.options.env_file {
            Some(path) => overlay(env, load_dotenv(&dir.join(path))?),
            None => {
                let default = dir.join(DEFAULT_ENV_FILE);
                if default.is_file() {
                    overlay(env, load_dotenv(&default)?);
                }
            }
        }
        let sep = env
            .get(ENV_PATH_SEPARATOR)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PATH_SEPARATOR.to_owned());
        let joined = files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(&sep);
        let _ = env.insert(ENV_PROJECT_DIR.to_owned(), dir.display().to_string());
        let _ = env.insert(ENV_COMPOSE_FILE.to_owned(), joined);
        let _ = env.insert(ENV_PATH_SEPARATOR.to_owned(), sep);
        Ok(())
    }

    /// Explicit override, then the environment, then the document's `name`,
    /// then the project directory's name.
    fn project_name(&self, env: &Environment, merged: &Mapping, dir: &Path) -> Result<String> {
        if let Some(name) = self.options.project_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_owned());
        }
        if let Some(name) = env.get(ENV_PROJECT_NAME).filter(|n| !n.is_empty()) {
            let normalized = normalize_project_name(name);
            if normalized.is_empty() {
                return Err(ComposeError::ProjectName { dir: name.clone() });
            }
            return Ok(normalized);
        }
        if let Some(name) = merged.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) {
            return Ok(name.to_owned());
        }
        let base = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let normalized = normalize_project_name(&base);
        if normalized.is_empty() {
            return Err(ComposeError::ProjectName { dir: base });
        }
        Ok(normalized)
    }

    fn resolve_all_extends(
        &self,
        mut merged: Mapping,
        env: &Environment,
        dir: &Path,
    ) -> Result<Mapping> {
        match merged.get_mut("services") {
            Some(Value::Mapping(services)) => {
                let order = extends_order(services)?;
                resolve_extends(services, &order, env, dir, self.source)?;
            }
            Some(Value::Null) | None => tracing::warn!("no services defined"),
            Some(_) => {}
        }
        let mut merged = finalize(merged)?;
        finalize_build_contexts(&mut merged, dir);
        Ok(merged)
    }

    fn requested_profiles(&self, env: &Environment) -> BTreeSet<String> {
        if !self.options.profiles.is_empty() {
            return self.options.profiles.clone();
        }
        env.get(ENV_PROFILES)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expand(&self, project: &mut Project) -> Result<()> {
        let name = project.name.clone();

        project.networks = definitions(&project.merged, "networks")?;
        if project.networks.is_empty() {
            let _ = project
                .networks
                .insert("default".to_owned(), NetworkDefinition::default());
        }
        for (logical, net) in &mut project.networks {
            net.runtime_name = runtime_name(&name, logical, net.name.as_deref(), &net.external);
        }
        project.default_network = if project.networks.len() == 1 {
            project.networks.keys().next().cloned()
        } else if project.networks.contains_key("default") {
            Some("default".to_owned())
        } else {
            None
        };

        project.volumes = definitions(&project.merged, "volumes")?;
        for (logical, vol) in &mut project.volumes {
            vol.runtime_name = runtime_name(&name, logical, vol.name.as_deref(), &vol.external);
        }
        project.secrets = definitions(&project.merged, "secrets")?;
        for (logical, secret) in &mut project.secrets {
            secret.runtime_name =
                runtime_name(&name, logical, secret.name.as_deref(), &secret.external);
        }

        check_networks(project)?;
        for (svc_name, svc) in &mut project.services {
            for secret in &svc.secrets {
                if !project.secrets.contains_key(secret.source()) {
                    return Err(ComposeError::UnknownReference {
                        kind: "secret",
                        name: secret.source().to_owned(),
                        referrer: format!("service \"{svc_name}\""),
                    });
                }
            }
            let mut mounts = Vec::with_capacity(svc.volumes.len());
            for entry in &svc.volumes {
                let mut mount = resolve_entry(entry, &project.dir).map_err(|e| match e {
                    ComposeError::Normalization { field, message } => ComposeError::Normalization {
                        field: format!("services.{svc_name}.{field}"),
                        message,
                    },
                    other => other,
                })?;
                assign_volume_name(&mut mount, &name, svc_name, &project.volumes)?;
                mounts.push(mount);
            }
            svc.mounts = mounts;
        }

        project.containers = self.containers(project);
        if self.options.in_pod {
            let pod = format!("pod{NAME_SEPARATOR}{name}");
            for container in &mut project.containers {
                container.pod = Some(pod.clone());
            }
            project.pods = vec![PodRecord {
                name: pod,
                labels: vec![format!("{LABEL_PROJECT}={name}")],
            }];
        }
        Ok(())
    }

    fn replicas(&self, name: &str, svc: &ServiceDefinition) -> u32 {
        if let Some(n) = self.options.scale.get(name) {
            return *n;
        }
        if let Some(n) = svc.scale {
            return n;
        }
        if let Some(deploy) = &svc.deploy {
            // An absent `deploy.mode` is compose's default, `replicated`.
            if deploy.mode.as_deref().unwrap_or("replicated") == "replicated" {
                if let Some(n) = deploy.replicas {
                    return n;
                }
            }
        }
        1
    }

    fn containers(&self, project: &Project) -> Vec<ContainerRecord> {
        let project_labels = [
            format!("{LABEL_CONFIG_HASH}={}", project.config_hash),
            format!("{LABEL_PROJECT}={}", project.name),
            format!("{LABEL_VERSION}={APP_VERSION}"),
            format!("{LABEL_COMPOSE_PROJECT}={}", project.name),
            format!("{LABEL_WORKING_DIR}={}", project.dir.display()),
            format!(
                "{LABEL_CONFIG_FILES}={}",
                project
                    .files
                    .iter()
                    .map(|f| f.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        ];

        let mut containers = Vec::new();
        for (svc_name, svc) in &project.services {
            let networks = service_networks(project, svc)
                .into_iter()
                .filter_map(|n| project.networks.get(n).map(|d| d.runtime_name.clone()))
                .collect::<Vec<_>>();
            let config_hash = svc
                .fingerprint
                .clone()
                .unwrap_or_else(|| project.config_hash.clone());
            for num in 1..=self.replicas(svc_name, svc) {
                let generated = format!(
                    "{}{NAME_SEPARATOR}{svc_name}{NAME_SEPARATOR}{num}",
                    project.name
                );
                let name = match (&svc.container_name, num) {
                    (Some(explicit), 1) => explicit.clone(),
                    _ => generated,
                };
                let mut labels = svc.label_strings();
                labels.extend(project_labels.iter().cloned());
                labels.push(format!("{LABEL_CONTAINER_NUMBER}={num}"));
                labels.push(format!("{LABEL_SERVICE}={svc_name}"));
                containers.push(ContainerRecord {
                    name,
                    service: svc_name.clone(),
                    num,
                    image: service_image(&project.name, svc_name, svc),
                    pod: None,
                    labels,
                    ports: svc.ports.clone(),
                    networks: networks.clone(),
                    mounts: svc.mounts.clone(),
                    config_hash: config_hash.clone(),
                    deps: svc.deps.clone(),
                    dependents: svc.dependents.clone(),
                });
            }
        }
        containers.sort_by_key(|c| c.deps.len());
        containers
    }
}

fn display_dir(dir: &Path) -> String {
    if dir.as_os_str().is_empty() {
        ".".to_owned()
    } else {
        dir.display().to_string()
    }
}

/// Hash of a document's canonical JSON form.
fn document_hash(doc: &Mapping) -> Result<ConfigHash> {
    let json = canonical_json(&Value::Mapping(doc.clone()))?;
    Ok(ConfigHash::of_bytes(&serde_json::to_vec(&json)?))
}

/// Converts every service and computes dependency sets.
///
/// Dependencies on undeclared services are errors unless the
/// `depends_on` entry is marked `required: false`.
fn typed_services(merged: &Mapping) -> Result<(BTreeMap<String, ServiceDefinition>, DependencySets)> {
    let raw = match merged.get("services") {
        Some(Value::Mapping(services)) => services.clone(),
        _ => Mapping::new(),
    };
    let mut sets = flat_deps(&raw, false)?;

    let mut services = BTreeMap::new();
    for (name, value) in &raw {
        let Some(name) = name.as_str() else {
            return Err(ComposeError::Normalization {
                field: "services".into(),
                message: "service names must be strings".into(),
            });
        };
        tracing::debug!(service = name, "converting service");
        let _ = services.insert(name.to_owned(), ServiceDefinition::from_value(name, value)?);
    }

    for (name, svc) in &services {
        for (dep, spec) in &svc.depends_on {
            if services.contains_key(dep) {
                continue;
            }
            if spec.required {
                return Err(ComposeError::UnknownReference {
                    kind: "service",
                    name: dep.clone(),
                    referrer: format!("depends_on of service \"{name}\""),
                });
            }
            tracing::warn!(service = %name, dependency = %dep, "optional dependency is not defined");
        }
        for link in &svc.links {
            let target = link.split(':').next().unwrap_or(link);
            if !services.contains_key(target) {
                return Err(ComposeError::UnknownReference {
                    kind: "service",
                    name: target.to_owned(),
                    referrer: format!("links of service \"{name}\""),
                });
            }
        }
    }
    let declared: BTreeSet<String> = services.keys().cloned().collect();
    let _ = sets.retain_services(&declared);
    Ok((services, sets))
}

/// Drops services outside `profiles`, pruning dependency edges to them.
fn filter_profiles(
    services: &mut BTreeMap<String, ServiceDefinition>,
    sets: &mut DependencySets,
    profiles: &BTreeSet<String>,
) {
    let all = profiles.contains(ALL_PROFILES);
    let keep: BTreeSet<String> = services
        .iter()
        .filter(|(_, svc)| {
            all || svc.profiles.is_empty() || svc.profiles.iter().any(|p| profiles.contains(p))
        })
        .map(|(name, _)| name.clone())
        .collect();
    for name in services.keys().filter(|n| !keep.contains(*n)) {
        tracing::debug!(service = %name, "service disabled by profiles");
    }
    services.retain(|name, _| keep.contains(name));
    for (service, dependency) in sets.retain_services(&keep) {
        tracing::warn!(
            %service,
            %dependency,
            "dependency is not enabled by the requested profiles, ignoring it"
        );
    }
}

/// Top-level declarations of one kind; null entries take defaults.
fn definitions<T: DeserializeOwned + Default>(
    merged: &Mapping,
    section: &str,
) -> Result<BTreeMap<String, T>> {
    let mut out = BTreeMap::new();
    let entries = match merged.get(section) {
        Some(Value::Mapping(entries)) => entries,
        Some(Value::Null) | None => return Ok(out),
        Some(other) => {
            return Err(ComposeError::Normalization {
                field: section.to_owned(),
                message: format!("expected a mapping, got a {}", type_name(other)),
            });
        }
    };
    for (key, value) in entries {
        let Some(name) = key.as_str() else { continue };
        let definition = match value {
            Value::Null => T::default(),
            other => serde_yaml::from_value(other.clone()).map_err(|e| {
                ComposeError::Normalization {
                    field: format!("{section}.{name}"),
                    message: e.to_string(),
                }
            })?,
        };
        let _ = out.insert(name.to_owned(), definition);
    }
    Ok(out)
}

/// Logical networks a service joins.
fn service_networks<'a>(project: &'a Project, svc: &'a ServiceDefinition) -> Vec<&'a str> {
    if svc.network_mode.is_some() {
        return Vec::new();
    }
    if svc.networks.is_empty() {
        return project.default_network.iter().map(String::as_str).collect();
    }
    svc.networks.keys().map(String::as_str).collect()
}

fn check_networks(project: &Project) -> Result<()> {
    let mut used = BTreeSet::new();
    for (svc_name, svc) in &project.services {
        for net in service_networks(project, svc) {
            if !project.networks.contains_key(net) {
                return Err(ComposeError::UnknownReference {
                    kind: "network",
                    name: net.to_owned(),
                    referrer: format!("service \"{svc_name}\""),
                });
            }
            let _ = used.insert(net);
        }
    }
    let unused: Vec<&str> = project
        .networks
        .keys()
        .map(String::as_str)
        .filter(|n| *n != "default" && !used.contains(n))
        .collect();
    if !unused.is_empty() {
        tracing::warn!(networks = ?unused, "unused networks");
    }
    Ok(())
}
