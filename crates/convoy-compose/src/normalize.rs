//! Canonicalization of per-service shorthand forms.
//!
//! After [`normalize_service`] every field has one shape: `build` is a
//! mapping, `command` is a token list, `environment` is a map, and so on.
//! Normalizing an already-normalized service changes nothing.

use std::path::{Component, Path, PathBuf};

use convoy_common::error::{ComposeError, Result};
use serde_yaml::{Mapping, Value};

use crate::lexer::split_shell;
use crate::merge::{MergeValue, type_name};

/// Condition recorded for short-form `depends_on` entries.
pub const DEFAULT_DEPENDS_ON_CONDITION: &str = "service_started";

fn key(name: &str) -> Value {
    Value::String(name.to_owned())
}

fn invalid(field: &str, message: impl Into<String>) -> ComposeError {
    ComposeError::Normalization {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// The value a merge marker wraps, or the value itself. `!reset` yields
/// nothing.
fn unmarked_mut(value: &mut Value) -> Option<&mut Value> {
    if MergeValue::classify(value) == MergeValue::Reset {
        return None;
    }
    match value {
        Value::Tagged(tagged) => Some(&mut tagged.value),
        other => Some(other),
    }
}

fn field_mut<'a>(service: &'a mut Mapping, name: &str) -> Option<&'a mut Value> {
    service.get_mut(name).and_then(unmarked_mut)
}

/// Renders a scalar as the string the container engine would see.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Normalizes one service in place.
///
/// `sub_dir` is the directory, relative to the project, of the file the
/// service was read from; relative build contexts and bind sources are
/// rebased onto it. A `!reset` marker or non-mapping value is left as is.
///
/// # Errors
///
/// Returns [`ComposeError::Normalization`] for a field whose shape cannot
/// be coerced.
pub fn normalize_service(service: &mut Value, sub_dir: Option<&str>) -> Result<()> {
    let Some(Value::Mapping(service)) = unmarked_mut(service) else {
        return Ok(());
    };
    let sub_dir = sub_dir.filter(|dir| !dir.is_empty());

    normalize_build(service, sub_dir)?;
    for name in ["command", "entrypoint"] {
        normalize_command(service, name)?;
    }
    for name in ["env_file", "security_opt", "volumes"] {
        if let Some(value) = field_mut(service, name) {
            if let Value::String(s) = value {
                *value = Value::Sequence(vec![Value::String(std::mem::take(s))]);
            }
        }
    }
    if let Some(Value::Sequence(opts)) = field_mut(service, "security_opt") {
        for opt in opts.iter_mut() {
            if let Value::String(s) = opt {
                for prefix in ["seccomp:", "apparmor:"] {
                    if let Some(rest) = s.strip_prefix(prefix) {
                        *s = format!("{}={rest}", &prefix[..prefix.len() - 1]);
                    }
                }
            }
        }
    }
    if let Some(dir) = sub_dir {
        if let Some(Value::Sequence(volumes)) = field_mut(service, "volumes") {
            for volume in volumes.iter_mut() {
                rebase_volume(volume, dir);
            }
        }
    }
    for name in ["environment", "labels"] {
        if let Some(value) = field_mut(service, name) {
            *value = Value::Mapping(key_value_map(name, value)?);
        }
    }
    if let Some(value) = field_mut(service, "extends") {
        if let Value::String(s) = value {
            let mut extends = Mapping::new();
            let _ = extends.insert(key("service"), Value::String(std::mem::take(s)));
            *value = Value::Mapping(extends);
        }
    }
    if let Some(value) = field_mut(service, "depends_on") {
        *value = Value::Mapping(depends_on_map(value)?);
    }
    if let Some(value) = field_mut(service, "healthcheck") {
        if !matches!(value, Value::Mapping(_) | Value::Null) {
            return Err(invalid(
                "healthcheck",
                format!("expected a mapping, got a {}", type_name(value)),
            ));
        }
    }
    Ok(())
}

fn normalize_build(service: &mut Mapping, sub_dir: Option<&str>) -> Result<()> {
    let Some(build) = field_mut(service, "build") else {
        return Ok(());
    };
    match build {
        Value::String(context) => {
            let mut spec = Mapping::new();
            let _ = spec.insert(key("context"), Value::String(std::mem::take(context)));
            *build = Value::Mapping(spec);
        }
        Value::Mapping(_) | Value::Null => {}
        other => {
            return Err(invalid(
                "build",
                format!("expected a string or mapping, got a {}", type_name(other)),
            ));
        }
    }
    let Value::Mapping(build) = build else {
        return Ok(());
    };

    if let Some(dir) = sub_dir {
        rebase_context(build, dir);
    }
    for name in ["additional_contexts", "args"] {
        let list = match field_mut(build, name) {
            Some(Value::Mapping(entries)) => assignment_list(&format!("build.{name}"), entries)?,
            _ => continue,
        };
        let _ = build.insert(key(name), Value::Sequence(list));
    }
    Ok(())
}

/// `{K: V, K2: null}` to `["K=V", "K2"]`.
fn assignment_list(field: &str, entries: &Mapping) -> Result<Vec<Value>> {
    entries
        .iter()
        .map(|(k, v)| {
            let k = scalar_string(k).ok_or_else(|| invalid(field, "keys must be scalars"))?;
            Ok(Value::String(match scalar_string(v) {
                Some(v) => format!("{k}={v}"),
                None => k,
            }))
        })
        .collect()
}

fn rebase_context(build: &mut Mapping, sub_dir: &str) {
    let context = build.get("context").and_then(Value::as_str).unwrap_or("");
    if is_git_url(context) || Path::new(context).is_absolute() {
        return;
    }
    let relative = context.strip_prefix("./").unwrap_or(context);
    let joined = if relative.is_empty() {
        sub_dir.to_owned()
    } else {
        format!("{}/{relative}", sub_dir.trim_end_matches('/'))
    };
    let joined = joined.trim_end_matches('/');
    let joined = if joined.is_empty() { "." } else { joined };
    let _ = build.insert(key("context"), Value::String(joined.to_owned()));
}

/// Prefixes a relative (`.`-leading) bind source with `sub_dir`.
fn rebase_volume(volume: &mut Value, sub_dir: &str) {
    let sub_dir = sub_dir.trim_end_matches('/');
    match volume {
        Value::String(spec) => {
            if let Some((source, rest)) = spec.split_once(':') {
                if source.starts_with('.') {
                    *spec = format!("{sub_dir}/{source}:{rest}");
                }
            }
        }
        Value::Mapping(long) => {
            let is_bind = long.get("type").and_then(Value::as_str) == Some("bind");
            if let (true, Some(Value::String(source))) = (is_bind, long.get_mut("source")) {
                if source.starts_with('.') {
                    *source = format!("{sub_dir}/{source}");
                }
            }
        }
        _ => {}
    }
}

fn normalize_command(service: &mut Mapping, name: &str) -> Result<()> {
    let Some(value) = field_mut(service, name) else {
        return Ok(());
    };
    match value {
        Value::String(s) => {
            let words = split_shell(name, s)?;
            *value = Value::Sequence(words.into_iter().map(Value::String).collect());
        }
        Value::Sequence(items) => {
            for item in items.iter_mut() {
                match scalar_string(item) {
                    Some(s) => *item = Value::String(s),
                    None => {
                        return Err(invalid(
                            name,
                            format!("list items must be scalars, got a {}", type_name(item)),
                        ));
                    }
                }
            }
        }
        Value::Null => {}
        other => {
            return Err(invalid(
                name,
                format!("expected a string or list, got a {}", type_name(other)),
            ));
        }
    }
    Ok(())
}

/// Converts a `KEY=VALUE` list (or a single such string) to a map, and
/// stringifies scalar map values. Valueless keys map to null.
fn key_value_map(field: &str, value: &Value) -> Result<Mapping> {
    let mut out = Mapping::new();
    match value {
        Value::Mapping(entries) => {
            for (k, v) in entries {
                let v = match v {
                    Value::Null => Value::Null,
                    other => Value::String(scalar_string(other).ok_or_else(|| {
                        let k = scalar_string(k).unwrap_or_default();
                        invalid(field, format!("value of \"{k}\" must be a scalar"))
                    })?),
                };
                let _ = out.insert(k.clone(), v);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                let Some(entry) = scalar_string(item) else {
                    return Err(invalid(field, "list items must be KEY=VALUE strings"));
                };
                insert_key_value(&mut out, &entry);
            }
        }
        Value::String(entry) => insert_key_value(&mut out, entry),
        Value::Null => {}
        other => {
            return Err(invalid(
                field,
                format!("expected a list or mapping, got a {}", type_name(other)),
            ));
        }
    }
    Ok(out)
}

fn insert_key_value(out: &mut Mapping, entry: &str) {
    if entry.is_empty() {
        return;
    }
    let (k, v) = match entry.split_once('=') {
        Some((k, v)) => (k, Value::String(v.to_owned())),
        None => (entry, Value::Null),
    };
    let _ = out.insert(key(k), v);
}

fn default_condition() -> Mapping {
    let mut entry = Mapping::new();
    let _ = entry.insert(
        key("condition"),
        Value::String(DEFAULT_DEPENDS_ON_CONDITION.to_owned()),
    );
    entry
}

fn depends_on_map(value: &Value) -> Result<Mapping> {
    let mut out = Mapping::new();
    match value {
        Value::String(name) => {
            let _ = out.insert(key(name), Value::Mapping(default_condition()));
        }
        Value::Sequence(items) => {
            for item in items {
                let Value::String(name) = item else {
                    return Err(invalid(
                        "depends_on",
                        format!("list items must be service names, got a {}", type_name(item)),
                    ));
                };
                let _ = out.insert(key(name), Value::Mapping(default_condition()));
            }
        }
        Value::Mapping(entries) => {
            for (name, entry) in entries {
                let entry = match entry {
                    Value::Null => default_condition(),
                    Value::Mapping(m) => {
                        let mut m = m.clone();
                        if !m.contains_key("condition") {
                            let _ = m.insert(
                                key("condition"),
                                Value::String(DEFAULT_DEPENDS_ON_CONDITION.to_owned()),
                            );
                        }
                        m
                    }
                    other => {
                        return Err(invalid(
                            "depends_on",
                            format!(
                                "entry for \"{}\" must be a mapping, got a {}",
                                name.as_str().unwrap_or_default(),
                                type_name(other)
                            ),
                        ));
                    }
                };
                let _ = out.insert(name.clone(), Value::Mapping(entry));
            }
        }
        Value::Null => {}
        other => {
            return Err(invalid(
                "depends_on",
                format!("expected a string, list, or mapping, got a {}", type_name(other)),
            ));
        }
    }
    Ok(out)
}

/// Normalizes every service of a document in place.
///
/// # Errors
///
/// Returns the first normalization error, qualified with the service name.
pub fn normalize_document(doc: &mut Mapping, sub_dir: Option<&str>) -> Result<()> {
    let Some(services) = field_mut(doc, "services") else {
        return Ok(());
    };
    let services = match services {
        Value::Mapping(services) => services,
        Value::Null => return Ok(()),
        other => {
            return Err(invalid(
                "services",
                format!("expected a mapping, got a {}", type_name(other)),
            ));
        }
    };
    for (name, service) in services.iter_mut() {
        normalize_service(service, sub_dir).map_err(|err| match err {
            ComposeError::Normalization { field, message } => ComposeError::Normalization {
                field: format!("services.{}.{field}", name.as_str().unwrap_or("?")),
                message,
            },
            other => other,
        })?;
    }
    Ok(())
}

/// Resolves relative build contexts against `project_dir`.
///
/// Runs once, after all documents are merged. Absolute contexts and git
/// URLs are kept; a build with no context builds from `project_dir`.
pub fn finalize_build_contexts(doc: &mut Mapping, project_dir: &Path) {
    let Some(Value::Mapping(services)) = field_mut(doc, "services") else {
        return;
    };
    for (_, service) in services.iter_mut() {
        let Some(Value::Mapping(service)) = unmarked_mut(service) else {
            continue;
        };
        let Some(Value::Mapping(build)) = field_mut(service, "build") else {
            continue;
        };
        let resolved = match build.get("context").and_then(Value::as_str) {
            None => project_dir.to_path_buf(),
            Some(ctx) if is_git_url(ctx) || Path::new(ctx).is_absolute() => continue,
            Some(ctx) => normalize_path(&project_dir.join(ctx)),
        };
        let _ = build.insert(
            key("context"),
            Value::String(resolved.to_string_lossy().into_owned()),
        );
    }
}

/// Returns true when a build context names a git repository.
///
/// Either a `git://` URL or a URL whose path (ignoring any `#fragment`)
/// ends in `.git`.
#[must_use]
pub fn is_git_url(path: &str) -> bool {
    if path.starts_with("git://") {
        return true;
    }
    let Some((scheme, rest)) = path.split_once("://") else {
        return false;
    };
    if scheme.is_empty() || rest.is_empty() {
        return false;
    }
    let without_fragment = rest.split('#').next().unwrap_or_default();
    let url_path = without_fragment
        .split_once('/')
        .map_or("", |(_, url_path)| url_path);
    url_path.ends_with(".git")
}

/// Lexically normalizes a path: drops `.` components and folds `..` into
/// the preceding component. Symlinks are not consulted.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    let _ = out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
