//! Recursive merging of compose documents.
//!
//! Later sources win. Mappings merge key by key, sequences concatenate
//! (with `volumes` deduplicated by mount target), and scalars are replaced.
//! Two YAML tags steer the merge: `!reset` deletes a key and `!override`
//! replaces a value wholesale instead of merging into it.
//!
//! Markers survive merging so they can still act on later sources (and on
//! `extends` bases); [`strip_markers`] removes whatever is left once the
//! document is complete.

use std::collections::BTreeSet;

use convoy_common::error::{ComposeError, Result};
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};

const RESET_TAG: &str = "reset";
const OVERRIDE_TAG: &str = "override";

/// A value as seen by the merger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeValue<'a> {
    /// An ordinary value.
    Plain(&'a Value),
    /// `!override value`: replaces without merging.
    Override(&'a Value),
    /// `!reset`: removes the key.
    Reset,
}

impl<'a> MergeValue<'a> {
    /// Classifies a raw document value.
    ///
    /// Tags other than `!reset` and `!override` are not merge markers and
    /// are classified as plain.
    #[must_use]
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::Tagged(tagged) if tagged.tag == RESET_TAG => Self::Reset,
            Value::Tagged(tagged) if tagged.tag == OVERRIDE_TAG => Self::Override(&tagged.value),
            other => Self::Plain(other),
        }
    }
}

/// Builds a `!reset` marker value.
#[must_use]
pub fn reset_marker() -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: serde_yaml::value::Tag::new(RESET_TAG),
        value: Value::Null,
    }))
}

/// Builds an `!override` marker around `value`.
#[must_use]
pub fn override_marker(value: Value) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: serde_yaml::value::Tag::new(OVERRIDE_TAG),
        value,
    }))
}

/// Name of a value's type, as reported in merge conflicts.
#[must_use]
pub const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

/// Merges `source` into `target`.
///
/// # Errors
///
/// Returns [`ComposeError::MergeTypeConflict`] when the same key holds
/// values of different types. A null target accepts any incoming value.
pub fn merge(target: &mut Mapping, source: &Mapping) -> Result<()> {
    merge_at(target, source, "")
}

/// Folds `sources` left to right into a fresh mapping.
///
/// # Errors
///
/// Propagates the first merge conflict.
pub fn merge_all<'a, I>(sources: I) -> Result<Mapping>
where
    I: IntoIterator<Item = &'a Mapping>,
{
    let mut target = Mapping::new();
    for source in sources {
        merge(&mut target, source)?;
    }
    Ok(target)
}

fn child_path(path: &str, key: &Value) -> String {
    let key = match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default(),
    };
    if path.is_empty() {
        key
    } else {
        format!("{path}.{key}")
    }
}

fn merge_at(target: &mut Mapping, source: &Mapping, path: &str) -> Result<()> {
    let mut removed = Vec::new();
    for (key, incoming) in source {
        let Some(current) = target.get_mut(key) else {
            let _ = target.insert(key.clone(), incoming.clone());
            continue;
        };
        let key_path = child_path(path, key);

        match (MergeValue::classify(current), MergeValue::classify(incoming)) {
            (MergeValue::Reset, _) | (_, MergeValue::Reset) => removed.push(key.clone()),
            (_, MergeValue::Override(value)) | (MergeValue::Override(value), _) => {
                *current = value.clone();
            }
            (MergeValue::Plain(_), MergeValue::Plain(value)) => {
                merge_value(current, value, key, &key_path)?;
            }
        }
    }
    if !removed.is_empty() {
        *target = std::mem::take(target)
            .into_iter()
            .filter(|(k, _)| !removed.contains(k))
            .collect();
    }
    Ok(())
}

fn merge_value(current: &mut Value, incoming: &Value, key: &Value, path: &str) -> Result<()> {
    if matches!(key.as_str(), Some("command" | "entrypoint")) || current.is_null() {
        *current = incoming.clone();
        return Ok(());
    }
    let conflict = ComposeError::MergeTypeConflict {
        key: path.to_owned(),
        left: type_name(current),
        right: type_name(incoming),
    };
    match (current, incoming) {
        (Value::Mapping(into), Value::Mapping(from)) => merge_at(into, from, path),
        (Value::Sequence(into), Value::Sequence(from)) => {
            if key.as_str() == Some("volumes") {
                let targets: BTreeSet<&str> = from.iter().filter_map(mount_target).collect();
                into.retain(|existing| {
                    mount_target(existing).is_none_or(|target| !targets.contains(target))
                });
            }
            into.extend(from.iter().cloned());
            Ok(())
        }
        (Value::Mapping(_) | Value::Sequence(_), _) | (_, Value::Mapping(_) | Value::Sequence(_)) => {
            Err(conflict)
        }
        (into, from) => {
            if std::mem::discriminant(&*into) != std::mem::discriminant(from) && !from.is_null() {
                return Err(conflict);
            }
            *into = from.clone();
            Ok(())
        }
    }
}

/// Mount target of a volume entry: the second `:`-segment of the short
/// form, or the `target` key of the long form.
fn mount_target(entry: &Value) -> Option<&str> {
    match entry {
        Value::String(s) => s.split(':').nth(1),
        Value::Mapping(m) => m.get("target").and_then(Value::as_str),
        _ => None,
    }
}

/// Removes every merge marker left in `value`: `!reset` entries are
/// deleted, `!override` values are unwrapped.
///
/// Other tags are unwrapped to their inner value.
pub fn strip_markers(value: &mut Value) {
    match value {
        Value::Tagged(tagged) => {
            let inner = std::mem::take(&mut tagged.value);
            *value = inner;
            strip_markers(value);
        }
        Value::Mapping(map) => {
            *map = std::mem::take(map)
                .into_iter()
                .filter(|(k, v)| {
                    let reset = MergeValue::classify(v) == MergeValue::Reset;
                    if reset {
                        tracing::debug!(key = ?k, "dropping unmatched !reset");
                    }
                    !reset
                })
                .collect();
            for (_, v) in map.iter_mut() {
                strip_markers(v);
            }
        }
        Value::Sequence(items) => {
            items.retain(|item| MergeValue::classify(item) != MergeValue::Reset);
            for item in items {
                strip_markers(item);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

/// Checks that no tagged value survives anywhere in `value`.
///
/// # Errors
///
/// Returns [`ComposeError::Config`] naming the path of the first tagged
/// value found.
pub fn ensure_plain(value: &Value) -> Result<()> {
    ensure_plain_at(value, "")
}

fn ensure_plain_at(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Tagged(tagged) => Err(ComposeError::Config {
            message: format!("unresolved tag {} at \"{path}\"", tagged.tag),
        }),
        Value::Mapping(map) => map
            .iter()
            .try_for_each(|(k, v)| ensure_plain_at(v, &child_path(path, k))),
        Value::Sequence(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, v)| ensure_plain_at(v, &format!("{path}[{i}]"))),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(()),
    }
}

/// Strips markers from a finished mapping and verifies the result.
///
/// # Errors
///
/// See [`ensure_plain`].
pub fn finalize(map: Mapping) -> Result<Mapping> {
    let mut value = Value::Mapping(map);
    strip_markers(&mut value);
    ensure_plain(&value)?;
    match value {
        Value::Mapping(map) => Ok(map),
        other => Err(ComposeError::Config {
            message: format!("document became a {}", type_name(&other)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(text: &str) -> Mapping {
        serde_yaml::from_str(text).expect("valid yaml mapping")
    }

    fn merged(docs: &[&str]) -> Mapping {
        let docs: Vec<Mapping> = docs.iter().map(|d| map(d)).collect();
        finalize(merge_all(&docs).expect("should merge")).expect("should finalize")
    }

    #[test]
    fn empty_source_is_identity() {
        let x = map("a: 1\nb: [1, 2]\nc: {d: e}\n");
        let mut target = x.clone();
        merge(&mut target, &Mapping::new()).expect("should merge");
        assert_eq!(target, x);
        assert_eq!(merged(&["{}", "a: 1\nb: [1, 2]\nc: {d: e}\n"]), x);
    }

    #[test]
    fn scalars_replace_and_mappings_recurse() {
        let out = merged(&["a: 1\nm: {x: 1, y: 2}\n", "a: 2\nm: {y: 3, z: 4}\n"]);
        assert_eq!(out, map("a: 2\nm: {x: 1, y: 3, z: 4}\n"));
    }

    #[test]
    fn sequences_concatenate() {
        let out = merged(&["ports: ['80:80']\n", "ports: ['443:443']\n"]);
        assert_eq!(out, map("ports: ['80:80', '443:443']\n"));
    }

    #[test]
    fn command_is_replaced_not_concatenated() {
        let out = merged(&["command: [a, b]\n", "command: [c]\n"]);
        assert_eq!(out, map("command: [c]\n"));
    }

    #[test]
    fn volumes_deduplicate_by_target() {
        let out = merged(&[
            "volumes: ['h1:/x:ro', 'h3:/y']\n",
            "volumes: ['h2:/x:rw', {type: bind, source: /z, target: /y}]\n",
        ]);
        assert_eq!(
            out,
            map("volumes: ['h2:/x:rw', {type: bind, source: /z, target: /y}]\n")
        );
    }

    #[test]
    fn type_mismatch_is_reported_with_key() {
        let mut target = map("services:\n  web:\n    ports: ['80:80']\n");
        let err = merge(&mut target, &map("services:\n  web:\n    ports: 80\n")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't merge value of services.web.ports of type sequence and number"
        );
    }

    #[test]
    fn null_target_accepts_mapping() {
        let out = merged(&["volumes:\n  data:\n", "volumes:\n  data: {driver: local}\n"]);
        assert_eq!(out, map("volumes:\n  data: {driver: local}\n"));
    }

    #[test]
    fn reset_removes_key() {
        let out = merged(&["app:\n  ports: ['80:80']\n  image: x\n", "app:\n  ports: !reset null\n"]);
        assert_eq!(out, map("app:\n  image: x\n"));
    }

    #[test]
    fn reset_wins_over_later_plain_value() {
        let out = merged(&[
            "app:\n  image: x\n",
            "app:\n  ports: !reset null\n",
            "app:\n  ports: ['1:1']\n",
        ]);
        assert_eq!(out, map("app:\n  image: x\n"));
    }

    #[test]
    fn unmatched_reset_is_dropped() {
        let out = merged(&["app:\n  image: x\n  volumes: !reset []\n"]);
        assert_eq!(out, map("app:\n  image: x\n"));
    }

    #[test]
    fn override_replaces_without_merging() {
        let out = merged(&[
            "app:\n  environment: {A: '1', B: '2'}\n",
            "app:\n  environment: !override {C: '3'}\n",
        ]);
        assert_eq!(out, map("app:\n  environment: {C: '3'}\n"));
    }

    #[test]
    fn unmatched_override_is_unwrapped() {
        let out = merged(&["app:\n  ports: !override ['1:1']\n"]);
        assert_eq!(out, map("app:\n  ports: ['1:1']\n"));
    }

    #[test]
    fn classify_ignores_other_tags() {
        let value: Value = serde_yaml::from_str("!custom 5").expect("valid yaml");
        assert!(matches!(MergeValue::classify(&value), MergeValue::Plain(_)));
        assert_eq!(MergeValue::classify(&reset_marker()), MergeValue::Reset);
        let wrapped = override_marker(Value::from(1));
        assert_eq!(
            MergeValue::classify(&wrapped),
            MergeValue::Override(&Value::from(1))
        );
    }

    #[test]
    fn finalized_tree_has_no_tags() {
        let mut value: Value =
            serde_yaml::from_str("a: !override {b: !reset null, c: [!override 1, !reset null]}\n")
                .expect("valid yaml");
        strip_markers(&mut value);
        ensure_plain(&value).expect("no markers should remain");
        assert_eq!(value, serde_yaml::from_str::<Value>("a: {c: [1]}\n").expect("yaml"));
    }

    #[test]
    fn ensure_plain_reports_path() {
        let value: Value = serde_yaml::from_str("a:\n  b: !reset null\n").expect("valid yaml");
        let msg = ensure_plain(&value).unwrap_err().to_string();
        assert!(msg.contains("a.b"), "got: {msg}");
    }
}
