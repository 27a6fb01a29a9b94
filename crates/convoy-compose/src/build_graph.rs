//! Build dependencies implied by `service:` build contexts.
//!
//! A build may name another service's image as an additional context
//! (`additional_contexts: [base=service:builder]`). The referenced service
//! has to be built first, so the reference becomes a build dependency and
//! the context is rewritten to a pullable image URL. Unlike ordinary
//! dependency cycles, build cycles are never tolerated.

use std::collections::{BTreeMap, BTreeSet};

use convoy_common::constants::{IMAGE_CONTEXT_SCHEME, LOCAL_IMAGE_PREFIX, NAME_SEPARATOR};
use convoy_common::error::{ComposeError, Result};

use crate::model::ServiceDefinition;

const SERVICE_CONTEXT_PREFIX: &str = "service:";

/// Image a service runs or builds: its declared `image`, or the
/// project-scoped default.
#[must_use]
pub fn service_image(project: &str, name: &str, service: &ServiceDefinition) -> String {
    service
        .image
        .clone()
        .unwrap_or_else(|| default_image(project, name))
}

/// Image name given to a service that declares none.
#[must_use]
pub fn default_image(project: &str, service: &str) -> String {
    format!("{project}{NAME_SEPARATOR}{service}")
}

/// Records build dependencies for every `name=service:target` context and
/// rewrites each to `name=docker://<image of target>`, then rejects cycles
/// among the recorded dependencies.
///
/// # Errors
///
/// Returns [`ComposeError::UnknownReference`] when a context names an
/// undefined service, and [`ComposeError::Cycle`] (kind `build`) with the
/// full path when the build dependencies form a cycle.
pub fn resolve_context_dependencies(
    services: &mut BTreeMap<String, ServiceDefinition>,
    project: &str,
) -> Result<()> {
    let images: BTreeMap<String, String> = services
        .iter()
        .map(|(name, svc)| {
            let image = svc.image.clone().unwrap_or_else(|| {
                format!("{LOCAL_IMAGE_PREFIX}{}", default_image(project, name))
            });
            (name.clone(), image)
        })
        .collect();

    for (name, service) in services.iter_mut() {
        let Some(build) = service.build.as_mut() else {
            continue;
        };
        let mut deps = BTreeSet::new();
        for entry in &mut build.additional_contexts {
            let Some((context, value)) = entry.split_once('=') else {
                continue;
            };
            let Some(target) = value.strip_prefix(SERVICE_CONTEXT_PREFIX) else {
                continue;
            };
            let image = images
                .get(target)
                .ok_or_else(|| ComposeError::UnknownReference {
                    kind: "service",
                    name: target.to_owned(),
                    referrer: format!("build context \"{context}\" of service \"{name}\""),
                })?;
            tracing::debug!(service = %name, context, target, "build context refers to service");
            let _ = deps.insert(target.to_owned());
            *entry = format!("{context}={IMAGE_CONTEXT_SCHEME}{image}");
        }
        build.build_deps = deps.into_iter().collect();
    }

    check_build_cycles(services)
}

fn check_build_cycles(services: &BTreeMap<String, ServiceDefinition>) -> Result<()> {
    let mut finished = BTreeSet::new();
    for name in services.keys() {
        let mut path = Vec::new();
        visit(services, name, &mut path, &mut finished)?;
    }
    Ok(())
}

fn visit<'a>(
    services: &'a BTreeMap<String, ServiceDefinition>,
    name: &'a str,
    path: &mut Vec<&'a str>,
    finished: &mut BTreeSet<&'a str>,
) -> Result<()> {
    if let Some(pos) = path.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = path[pos..].iter().map(|n| (*n).to_owned()).collect();
        cycle.push(name.to_owned());
        return Err(ComposeError::Cycle {
            kind: "build",
            path: cycle,
        });
    }
    if finished.contains(name) {
        return Ok(());
    }
    let Some(service) = services.get(name) else {
        return Ok(());
    };
    path.push(name);
    for dep in service.build.iter().flat_map(|b| &b.build_deps) {
        visit(services, dep, path, finished)?;
    }
    let _ = path.pop();
    let _ = finished.insert(name);
    Ok(())
}
