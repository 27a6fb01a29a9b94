//! Resolution of `extends` references.
//!
//! A service extending another service of the same document is merged onto
//! a copy of that service, with bases resolved before the services that
//! extend them. A service extending a service of another file is merged
//! onto that file's service, loaded, interpolated, and normalized on its
//! own; such chains are followed recursively.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use convoy_common::error::{ComposeError, Result};
use serde_yaml::{Mapping, Value};

use crate::document::{DocumentSource, document_dir, parse_document, take_key};
use crate::env::Environment;
use crate::graph::{DependencyGraph, DependencyMap};
use crate::interpolate::interpolate;
use crate::merge::{MergeValue, merge};
use crate::normalize::{normalize_path, normalize_service};
use convoy_common::types::{ServiceDependency, ServiceDependencyCondition};

/// A normalized `extends` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExtendsRef {
    service: String,
    file: Option<String>,
}

fn extends_ref(service: &Mapping) -> Option<ExtendsRef> {
    let extends = match MergeValue::classify(service.get("extends")?) {
        MergeValue::Plain(Value::Mapping(m)) | MergeValue::Override(Value::Mapping(m)) => m,
        _ => return None,
    };
    Some(ExtendsRef {
        service: extends.get("service")?.as_str()?.to_owned(),
        file: extends
            .get("file")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

/// The mapping behind a service value; `None` for `!reset` or a
/// non-mapping.
fn service_mapping(value: &Value) -> Option<Mapping> {
    match MergeValue::classify(value) {
        MergeValue::Plain(Value::Mapping(m)) | MergeValue::Override(Value::Mapping(m)) => {
            Some(m.clone())
        }
        MergeValue::Plain(Value::Null) => Some(Mapping::new()),
        _ => None,
    }
}

/// Orders services so that every same-file `extends` base precedes the
/// services extending it. Ties are broken by name.
///
/// # Errors
///
/// Returns [`ComposeError::Cycle`] (kind `extends`) when bases extend each
/// other in a cycle.
pub fn extends_order(services: &Mapping) -> Result<Vec<String>> {
    let mut edges = DependencyMap::new();
    for (name, service) in services {
        let Some(name) = name.as_str() else { continue };
        let mut deps = BTreeSet::new();
        if let Some(reference) = service_mapping(service).as_ref().and_then(extends_ref) {
            if reference.file.is_none() && reference.service != name {
                let _ = deps.insert(ServiceDependency::new(
                    reference.service,
                    ServiceDependencyCondition::Running,
                ));
            }
        }
        let _ = edges.insert(name.to_owned(), deps);
    }
    DependencyGraph::from_map("extends", &edges).resolve_order()
}

/// Merges every service's `extends` base into it, in `order`, and removes
/// the `extends` key.
///
/// `extends.file` is read through `source`, relative to `project_dir`.
/// This holds for services that came from an `include`d document in
/// another directory too; only nested `extends.file` references inside a
/// base file resolve against that base file's directory.
/// A service extending itself is left as it is.
///
/// # Errors
///
/// Returns [`ComposeError::UnknownReference`] for a missing base service,
/// [`ComposeError::Cycle`] for a cycle among file-based references, and
/// propagates read, interpolation, normalization, and merge failures.
pub fn resolve_extends(
    services: &mut Mapping,
    order: &[String],
    env: &Environment,
    project_dir: &Path,
    source: &dyn DocumentSource,
) -> Result<()> {
    let loader = FileBases {
        env,
        project_dir,
        source,
    };
    for name in order {
        let Some(mut service) = services.get(name.as_str()).and_then(service_mapping) else {
            continue;
        };
        let Some(reference) = extends_ref(&service) else {
            continue;
        };
        let _ = take_key(&mut service, "extends");

        let base = match &reference.file {
            Some(file) => {
                let mut stack = Vec::new();
                loader.base(&normalize_path(Path::new(file)), &reference.service, &mut stack)?
            }
            None if reference.service == *name => {
                tracing::debug!(service = %name, "service extends itself, ignoring");
                Mapping::new()
            }
            None => {
                let mut base = services
                    .get(reference.service.as_str())
                    .and_then(service_mapping)
                    .ok_or_else(|| ComposeError::UnknownReference {
                        kind: "service",
                        name: reference.service.clone(),
                        referrer: format!("extends of service \"{name}\""),
                    })?;
                let _ = take_key(&mut base, "extends");
                base
            }
        };
        tracing::debug!(service = %name, base = %reference.service, "resolved extends");

        let mut resolved = Mapping::new();
        merge(&mut resolved, &base)?;
        merge(&mut resolved, &service)?;
        let _ = services.insert(Value::String(name.clone()), Value::Mapping(resolved));
    }
    Ok(())
}

/// Loads services referenced through `extends.file`.
struct FileBases<'a> {
    env: &'a Environment,
    project_dir: &'a Path,
    source: &'a dyn DocumentSource,
}

impl FileBases<'_> {
    /// Services of `file` (relative to the project), interpolated.
    fn services(&self, file: &Path) -> Result<Mapping> {
        let full = normalize_path(&self.project_dir.join(file));
        let text = self.source.read(&full)?;
        let mut content = parse_document(&text, &full.display().to_string())?;
        let services = take_key(&mut content, "services").unwrap_or(Value::Mapping(content));
        match interpolate(&services, self.env)? {
            Value::Mapping(services) => Ok(services),
            _ => Ok(Mapping::new()),
        }
    }

    /// Fully resolved `service` of `file`, without its `extends` key.
    fn base(
        &self,
        file: &Path,
        service: &str,
        stack: &mut Vec<(PathBuf, String)>,
    ) -> Result<Mapping> {
        let frame = (file.to_path_buf(), service.to_owned());
        if let Some(pos) = stack.iter().position(|f| *f == frame) {
            let mut path: Vec<String> = stack[pos..]
                .iter()
                .map(|(f, s)| format!("{}:{s}", f.display()))
                .collect();
            path.push(format!("{}:{service}", file.display()));
            return Err(ComposeError::Cycle {
                kind: "extends",
                path,
            });
        }
        stack.push(frame);

        let services = self.services(file)?;
        let mut value = services
            .get(service)
            .cloned()
            .ok_or_else(|| ComposeError::UnknownReference {
                kind: "service",
                name: service.to_owned(),
                referrer: format!("extends in {}", file.display()),
            })?;
        let dir = document_dir(file);
        let sub_dir = dir.to_string_lossy();
        normalize_service(&mut value, Some(sub_dir.as_ref()))?;
        let mut own = service_mapping(&value).unwrap_or_default();

        let resolved = match extends_ref(&own) {
            None => own,
            Some(reference) => {
                let _ = take_key(&mut own, "extends");
                let parent = match &reference.file {
                    Some(nested) => {
                        self.base(&normalize_path(&dir.join(nested)), &reference.service, stack)?
                    }
                    None if reference.service == service => Mapping::new(),
                    None => self.base(file, &reference.service, stack)?,
                };
                let mut merged = parent;
                merge(&mut merged, &own)?;
                merged
            }
        };

        let _ = stack.pop();
        Ok(resolved)
    }
}
