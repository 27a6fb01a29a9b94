//! The ambient environment: process variables overlaid with dotenv files.

use std::collections::BTreeMap;
use std::path::Path;

use convoy_common::error::{ComposeError, Result};

/// Variable name to value.
pub type Environment = BTreeMap<String, String>;

/// Snapshot of the current process environment.
///
/// Variables whose name or value is not valid Unicode are skipped.
#[must_use]
pub fn process_environment() -> Environment {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Parses dotenv text.
///
/// Supported syntax: `KEY=VALUE` lines, an optional `export ` prefix,
/// `#` comment lines, blank lines, and single- or double-quoted values.
/// Unquoted values lose trailing ` #` comments and surrounding whitespace.
///
/// # Errors
///
/// Returns [`ComposeError::Parse`] for a line with no `=` or an empty key.
pub fn parse_dotenv(content: &str, origin: &str) -> Result<Environment> {
    let mut env = Environment::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let Some((key, value)) = line.split_once('=') else {
            return Err(ComposeError::Parse {
                file: origin.to_owned(),
                line: Some(idx + 1),
                column: None,
                message: format!("expected KEY=VALUE, got \"{line}\""),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ComposeError::Parse {
                file: origin.to_owned(),
                line: Some(idx + 1),
                column: None,
                message: "empty variable name".into(),
            });
        }
        let _ = env.insert(key.to_owned(), dotenv_value(value.trim()));
    }
    Ok(env)
}

fn dotenv_value(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.rfind(quote).map(|end| &rest[..end]))
        {
            return if quote == '"' {
                inner.replace("\\n", "\n").replace("\\\"", "\"")
            } else {
                inner.to_owned()
            };
        }
    }
    let value = value.find(" #").map_or(value, |idx| &value[..idx]);
    value.trim_end().to_owned()
}

/// Reads and parses a dotenv file.
///
/// # Errors
///
/// Returns [`ComposeError::Io`] when the file cannot be read, or a parse
/// error from [`parse_dotenv`].
pub fn load_dotenv(path: &Path) -> Result<Environment> {
    tracing::debug!(path = %path.display(), "loading dotenv file");
    let content = std::fs::read_to_string(path).map_err(|source| ComposeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_dotenv(&content, &path.display().to_string())
}

/// Overlays `overlay` on `base`; keys in `overlay` win.
pub fn overlay(base: &mut Environment, overlay: Environment) {
    base.extend(overlay);
}
