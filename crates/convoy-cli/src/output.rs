//! Formatted output helpers for CLI commands.

use std::collections::BTreeSet;

use convoy_common::types::{ConfigHash, ServiceDependency};
use convoy_compose::model::{MountDescriptor, MountType};

/// Hex digits of a hash shown in tables.
const SHORT_HASH_LEN: usize = 12;

/// The leading digits of a hash.
#[must_use]
pub fn short_hash(hash: &ConfigHash) -> &str {
    let hex = hash.as_hex();
    hex.get(..SHORT_HASH_LEN).unwrap_or(hex)
}

/// Dependencies as `name (condition)`, comma separated; `-` when empty.
#[must_use]
pub fn format_dependencies(deps: &BTreeSet<ServiceDependency>) -> String {
    if deps.is_empty() {
        return "-".to_owned();
    }
    deps.iter()
        .map(|d| format!("{} ({})", d.name, d.condition))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One mount as `source -> target`, with the runtime volume name when
/// there is one.
#[must_use]
pub fn format_mount(mount: &MountDescriptor) -> String {
    let source = match (mount.kind, &mount.volume_name, &mount.source) {
        (MountType::Volume, Some(volume), _) => volume.clone(),
        (_, _, Some(source)) => source.clone(),
        (kind, _, None) => format!("({kind:?})").to_lowercase(),
    };
    let mode = if mount.read_only { " (ro)" } else { "" };
    format!("{source} -> {}{mode}", mount.target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_common::types::ServiceDependencyCondition;

    fn mount(kind: MountType, source: Option<&str>) -> MountDescriptor {
        MountDescriptor {
            kind,
            source: source.map(str::to_owned),
            target: "/data".into(),
            read_only: false,
            consistency: None,
            bind: None,
            volume: None,
            tmpfs: None,
            volume_name: None,
        }
    }

    #[test]
    fn short_hash_truncates() {
        let hash = ConfigHash::of_bytes(b"x");
        assert_eq!(short_hash(&hash).len(), 12);
        assert!(hash.as_hex().starts_with(short_hash(&hash)));
    }

    #[test]
    fn dependencies_show_conditions() {
        let deps = BTreeSet::from([
            ServiceDependency::new("db", ServiceDependencyCondition::Healthy),
            ServiceDependency::new("cache", ServiceDependencyCondition::Running),
        ]);
        assert_eq!(format_dependencies(&deps), "cache (running), db (healthy)");
        assert_eq!(format_dependencies(&BTreeSet::new()), "-");
    }

    #[test]
    fn mounts_prefer_volume_names() {
        let mut named = mount(MountType::Volume, Some("data"));
        named.volume_name = Some("proj_data".into());
        named.read_only = true;
        assert_eq!(format_mount(&named), "proj_data -> /data (ro)");
        assert_eq!(
            format_mount(&mount(MountType::Bind, Some("/host"))),
            "/host -> /data"
        );
        assert_eq!(format_mount(&mount(MountType::Tmpfs, None)), "(tmpfs) -> /data");
    }
}
