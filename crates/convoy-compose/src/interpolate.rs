//! `$`-variable substitution over a parsed compose document.
//!
//! Substitution is applied to every string scalar and every string mapping
//! key. A mapping that carries an `environment` sub-mapping (a service)
//! adds those variables to the scope of its own subtree, shadowing outer
//! values of the same name.

use std::borrow::Cow;

use convoy_common::error::{ComposeError, Result};
use serde_yaml::{Mapping, Value};

use crate::env::Environment;
use crate::lexer::{Modifier, Segment, template_segments};

/// Substitutes variables in one string.
///
/// # Errors
///
/// Returns [`ComposeError::Interpolation`] when a `${NAME?err}` or
/// `${NAME:?err}` reference finds no usable value.
pub fn interpolate_str(input: &str, env: &Environment) -> Result<String> {
    if !input.contains('$') {
        return Ok(input.to_owned());
    }
    let mut out = String::with_capacity(input.len());
    for segment in template_segments(input) {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Dollar => out.push('$'),
            Segment::Variable { name, modifier } => {
                out.push_str(&lookup(name, modifier, env)?);
            }
        }
    }
    Ok(out)
}

fn lookup<'a>(
    name: &str,
    modifier: Option<Modifier<'a>>,
    env: &'a Environment,
) -> Result<Cow<'a, str>> {
    let empty_is_missing = match modifier {
        Some(
            Modifier::Default {
                empty_is_missing, ..
            }
            | Modifier::Required {
                empty_is_missing, ..
            },
        ) => empty_is_missing,
        None => false,
    };
    let found = env
        .get(name)
        .filter(|value| !(empty_is_missing && value.is_empty()));
    match (found, modifier) {
        (Some(value), _) => Ok(Cow::Borrowed(value.as_str())),
        (None, Some(Modifier::Default { value, .. })) => Ok(Cow::Borrowed(value)),
        (None, Some(Modifier::Required { message, .. })) => {
            let message = if message.is_empty() {
                format!("required variable {name} is missing a value")
            } else {
                message.to_owned()
            };
            Err(ComposeError::Interpolation { message })
        }
        (None, None) => Ok(Cow::Borrowed("")),
    }
}

/// Substitutes variables throughout a document tree.
///
/// Merge markers are preserved around their substituted contents.
///
/// # Errors
///
/// Propagates the first [`ComposeError::Interpolation`] encountered.
pub fn interpolate(value: &Value, env: &Environment) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(interpolate_str(s, env)?)),
        Value::Sequence(items) => items
            .iter()
            .map(|item| interpolate(item, env))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => interpolate_mapping(map, env).map(Value::Mapping),
        Value::Tagged(tagged) => {
            let mut tagged = tagged.clone();
            tagged.value = interpolate(&tagged.value, env)?;
            Ok(Value::Tagged(tagged))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn interpolate_mapping(map: &Mapping, env: &Environment) -> Result<Mapping> {
    let scoped = match service_environment(map, env)? {
        Some(local) => {
            let mut scoped = env.clone();
            scoped.extend(local);
            Cow::Owned(scoped)
        }
        None => Cow::Borrowed(env),
    };
    let mut out = Mapping::with_capacity(map.len());
    for (key, value) in map {
        let key = match key {
            Value::String(k) => Value::String(interpolate_str(k, &scoped)?),
            other => other.clone(),
        };
        // Environment values see the outer scope only, never themselves.
        let scope = if key.as_str() == Some("environment") {
            env
        } else {
            &scoped
        };
        let _ = out.insert(key, interpolate(value, scope)?);
    }
    Ok(out)
}

/// Collects the non-null entries of an `environment` sub-mapping,
/// substituted against the outer scope.
fn service_environment(map: &Mapping, env: &Environment) -> Result<Option<Environment>> {
    let Some(environment) = map.get("environment") else {
        return Ok(None);
    };
    let environment = match environment {
        Value::Tagged(tagged) => &tagged.value,
        other => other,
    };
    let Value::Mapping(entries) = environment else {
        return Ok(None);
    };
    let mut local = Environment::new();
    for (key, value) in entries {
        let Value::String(key) = key else { continue };
        let value = match value {
            Value::String(s) => interpolate_str(s, env)?,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let _ = local.insert(key.clone(), value);
    }
    Ok(Some(local))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("valid yaml")
    }

    #[test]
    fn substitutes_all_reference_forms() {
        let e = env(&[("v1", "high"), ("empty", "")]);
        let cases = [
            ("$v1", "high"),
            ("${v1}", "high"),
            ("${empty:-low}", "low"),
            ("${empty-low}", ""),
            ("${unset:-low}", "low"),
            ("${unset-low}", "low"),
            ("$$v1", "$v1"),
            ("$unset", ""),
            ("pre${v1}post", "prehighpost"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                interpolate_str(input, &e).expect(input),
                expected,
                "input: {input}"
            );
        }
    }

    #[test]
    fn required_reference_reports_user_message() {
        let e = env(&[("empty", "")]);
        let err = interpolate_str("${empty:?must be set}", &e).unwrap_err();
        assert_eq!(err.to_string(), "interpolation failed: must be set");
        assert_eq!(interpolate_str("${empty?fine}", &e).expect("set"), "");
    }

    #[test]
    fn required_reference_without_message_names_variable() {
        let msg = interpolate_str("${TAG?}", &Environment::new())
            .unwrap_err()
            .to_string();
        assert!(msg.contains("TAG"), "got: {msg}");
    }

    #[test]
    fn text_without_references_is_unchanged() {
        let e = Environment::new();
        for input in ["plain", "a $ b", "${1abc}", "${open", "100$"] {
            assert_eq!(interpolate_str(input, &e).expect(input), input);
        }
    }

    #[test]
    fn substitutes_keys_and_nested_values() {
        let doc = yaml("services:\n  ${NAME}:\n    image: $IMG\n    ports: ['${PORT}:80']\n");
        let out = interpolate(&doc, &env(&[("NAME", "web"), ("IMG", "nginx"), ("PORT", "8080")]))
            .expect("should interpolate");
        assert_eq!(
            out,
            yaml("services:\n  web:\n    image: nginx\n    ports: ['8080:80']\n")
        );
    }

    #[test]
    fn service_environment_shadows_outer_scope() {
        let doc = yaml(
            "services:\n  web:\n    environment:\n      MODE: local\n    command: run $MODE\n  db:\n    command: run $MODE\n",
        );
        let out = interpolate(&doc, &env(&[("MODE", "outer")])).expect("should interpolate");
        assert_eq!(out["services"]["web"]["command"], Value::from("run local"));
        assert_eq!(out["services"]["db"]["command"], Value::from("run outer"));
    }

    #[test]
    fn self_referencing_environment_expands_once() {
        let doc = yaml("environment:\n  PATH: /app/bin:$PATH\ncommand: echo $PATH\n");
        let out = interpolate(&doc, &env(&[("PATH", "/usr/bin")])).expect("should interpolate");
        assert_eq!(out["environment"]["PATH"], Value::from("/app/bin:/usr/bin"));
        assert_eq!(out["command"], Value::from("echo /app/bin:/usr/bin"));
    }

    #[test]
    fn null_environment_entries_do_not_shadow() {
        let doc = yaml("environment:\n  MODE: null\ncommand: $MODE\n");
        let out = interpolate(&doc, &env(&[("MODE", "outer")])).expect("should interpolate");
        assert_eq!(out["command"], Value::from("outer"));
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let doc = yaml("a: 1\nb: true\nc: null\n");
        assert_eq!(interpolate(&doc, &Environment::new()).expect("ok"), doc);
    }

    #[test]
    fn error_propagates_from_deep_value() {
        let doc = yaml("services:\n  web:\n    image: ${TAG:?TAG is required}\n");
        let msg = interpolate(&doc, &Environment::new())
            .unwrap_err()
            .to_string();
        assert!(msg.contains("TAG is required"), "got: {msg}");
    }
}
