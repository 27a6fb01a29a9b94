//! Resolution of service mounts into canonical long form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use convoy_common::error::{ComposeError, Result};
use convoy_common::types::ConfigHash;

use crate::model::{BindOptions, MountDescriptor, MountType, VolumeDefinition, VolumeEntry};
use crate::normalize::normalize_path;

/// Short-form options carried into `bind.propagation`, comma-joined.
const PROPAGATION_OPTIONS: &[&str] = &[
    "z", "Z", "O", "U", "shared", "rshared", "slave", "rslave", "private", "rprivate",
    "unbindable", "runbindable", "bind", "rbind", "exec", "noexec", "dev", "nodev", "suid",
    "nosuid",
];

fn invalid(spec: &str, message: impl Into<String>) -> ComposeError {
    ComposeError::Normalization {
        field: format!("volumes ({spec})"),
        message: message.into(),
    }
}

/// Whether a short-form source names a host path rather than a volume.
fn is_host_path(source: &str) -> bool {
    source.starts_with(['~', '/', '.'])
}

fn expand_home(source: &str) -> PathBuf {
    if source == "~" || source.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(source.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(source)
}

/// Makes a bind source absolute against `base_dir`.
fn absolute_source(source: &str, base_dir: &Path) -> String {
    normalize_path(&base_dir.join(expand_home(source)))
        .to_string_lossy()
        .into_owned()
}

/// Parses `source:target:options` (each part but the target optional).
///
/// Two parts are `source:target` when the second starts with `/`, and
/// `target:options` otherwise. Host-path sources become absolute.
///
/// # Errors
///
/// Returns [`ComposeError::Normalization`] for more than three parts or an
/// unknown option.
pub fn parse_short_mount(spec: &str, base_dir: &Path) -> Result<MountDescriptor> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, options) = match parts.as_slice() {
        [target] => (None, *target, None),
        [source, target] if target.starts_with('/') => (Some(*source), *target, None),
        [target, options] => (None, *target, Some(*options)),
        [source, target, options] => (Some(*source), *target, Some(*options)),
        _ => return Err(invalid(spec, "expected at most source:target:options")),
    };
    if target.is_empty() {
        return Err(invalid(spec, "missing target"));
    }

    let (kind, source) = match source {
        Some(src) if is_host_path(src) => (MountType::Bind, Some(absolute_source(src, base_dir))),
        Some(src) if !src.is_empty() => (MountType::Volume, Some(src.to_owned())),
        _ => (MountType::Volume, None),
    };

    let mut mount = MountDescriptor {
        kind,
        source,
        target: target.to_owned(),
        read_only: false,
        consistency: None,
        bind: None,
        volume: None,
        tmpfs: None,
        volume_name: None,
    };
    let mut propagation = Vec::new();
    for opt in options.unwrap_or_default().split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" => mount.read_only = true,
            "rw" => mount.read_only = false,
            "consistent" | "delegated" | "cached" => mount.consistency = Some(opt.to_owned()),
            _ if PROPAGATION_OPTIONS.contains(&opt) => propagation.push(opt),
            _ => return Err(invalid(spec, format!("unknown mount option \"{opt}\""))),
        }
    }
    if !propagation.is_empty() {
        mount.bind = Some(BindOptions {
            propagation: Some(propagation.join(",")),
            ..BindOptions::default()
        });
    }
    Ok(mount)
}

/// Canonicalizes one `volumes` entry. Relative bind sources in long form
/// are made absolute the same way as in short form.
///
/// # Errors
///
/// See [`parse_short_mount`].
pub fn resolve_entry(entry: &VolumeEntry, base_dir: &Path) -> Result<MountDescriptor> {
    match entry {
        VolumeEntry::Short(spec) => parse_short_mount(spec, base_dir),
        VolumeEntry::Long(long) => {
            let mut mount = long.clone();
            if mount.kind == MountType::Bind {
                if let Some(source) = &mount.source {
                    if !Path::new(source).is_absolute() {
                        mount.source = Some(absolute_source(source, base_dir));
                    }
                }
            }
            Ok(mount)
        }
    }
}

/// Records the runtime volume name a `volume` mount refers to.
///
/// Anonymous volumes are named after the project, service, and a hash of
/// the target. Named volumes must be declared at the top level.
///
/// # Errors
///
/// Returns [`ComposeError::UnknownReference`] for an undeclared volume.
pub fn assign_volume_name(
    mount: &mut MountDescriptor,
    project: &str,
    service: &str,
    volumes: &BTreeMap<String, VolumeDefinition>,
) -> Result<()> {
    if mount.kind != MountType::Volume {
        return Ok(());
    }
    let name = match &mount.source {
        None => format!(
            "{project}_{service}_{}",
            ConfigHash::of_bytes(mount.target.as_bytes())
        ),
        Some(source) => volumes
            .get(source)
            .map(|vol| vol.runtime_name.clone())
            .ok_or_else(|| ComposeError::UnknownReference {
                kind: "volume",
                name: source.clone(),
                referrer: format!("service \"{service}\""),
            })?,
    };
    mount.volume_name = Some(name);
    Ok(())
}
