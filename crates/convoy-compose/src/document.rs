//! Reading and parsing compose documents.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};

use convoy_common::constants::STDIN_MARKER;
use convoy_common::error::{ComposeError, Result};
use serde_yaml::{Mapping, Value};

use crate::merge::type_name;

/// Provides the text of compose documents.
pub trait DocumentSource {
    /// Returns the contents of `path`, or of stdin for [`STDIN_MARKER`].
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Io`] if the document cannot be read.
    fn read(&self, path: &Path) -> Result<String>;
}

/// Reads documents from the local filesystem and stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystemSource;

impl DocumentSource for FileSystemSource {
    fn read(&self, path: &Path) -> Result<String> {
        if path == Path::new(STDIN_MARKER) {
            let mut text = String::new();
            let _ = std::io::stdin()
                .read_to_string(&mut text)
                .map_err(|source| ComposeError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            return Ok(text);
        }
        std::fs::read_to_string(path).map_err(|source| ComposeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Serves documents from memory, keyed by path.
#[derive(Debug, Default, Clone)]
pub struct InMemorySource {
    files: BTreeMap<PathBuf, String>,
}

impl InMemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a document.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let _ = self.files.insert(path.into(), text.into());
        self
    }
}

impl DocumentSource for InMemorySource {
    fn read(&self, path: &Path) -> Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ComposeError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such document"),
            })
    }
}

/// One parsed source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Where the document was read from.
    pub path: PathBuf,
    /// Top-level mapping, with any `include` key removed.
    pub content: Mapping,
}

/// Parses YAML text whose root must be a mapping. An empty document is an
/// empty mapping.
///
/// # Errors
///
/// Returns [`ComposeError::Parse`] naming `origin` (and the location, when
/// the YAML parser reports one).
pub fn parse_document(text: &str, origin: &str) -> Result<Mapping> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| {
        let location = e.location();
        ComposeError::Parse {
            file: origin.to_owned(),
            line: location.as_ref().map(serde_yaml::Location::line),
            column: location.as_ref().map(serde_yaml::Location::column),
            message: e.to_string(),
        }
    })?;
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        other => Err(ComposeError::Parse {
            file: origin.to_owned(),
            line: None,
            column: None,
            message: format!("top-level object must be a mapping, got a {}", type_name(&other)),
        }),
    }
}

/// Removes `name` from `map`, keeping the order of the remaining keys.
pub(crate) fn take_key(map: &mut Mapping, name: &str) -> Option<Value> {
    let value = map.get(name).cloned()?;
    *map = std::mem::take(map)
        .into_iter()
        .filter(|(k, _)| k.as_str() != Some(name))
        .collect();
    Some(value)
}

/// Directory a document's relative references resolve against.
pub(crate) fn document_dir(path: &Path) -> PathBuf {
    if path == Path::new(STDIN_MARKER) {
        return PathBuf::new();
    }
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn include_paths(include: &Value, origin: &Path) -> Result<Vec<String>> {
    let bad = |what: &str| ComposeError::Parse {
        file: origin.display().to_string(),
        line: None,
        column: None,
        message: format!("invalid include entry: {what}"),
    };
    let entries = match include {
        Value::String(path) => return Ok(vec![path.clone()]),
        Value::Sequence(entries) => entries,
        Value::Null => return Ok(Vec::new()),
        other => return Err(bad(type_name(other))),
    };
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Value::String(path) => paths.push(path.clone()),
            Value::Mapping(long) => match long.get("path") {
                Some(Value::String(path)) => paths.push(path.clone()),
                Some(Value::Sequence(list)) => {
                    for path in list {
                        paths.push(path.as_str().ok_or_else(|| bad(type_name(path)))?.to_owned());
                    }
                }
                _ => return Err(bad("mapping without a path")),
            },
            other => return Err(bad(type_name(other))),
        }
    }
    Ok(paths)
}

/// Loads `files` in order, appending the targets of each document's
/// `include` key to the end of the queue.
///
/// Included paths are resolved relative to the including document. A path
/// already loaded is skipped.
///
/// # Errors
///
/// Returns the first read or parse failure.
pub fn load_documents(files: &[PathBuf], source: &dyn DocumentSource) -> Result<Vec<Document>> {
    let mut queue: VecDeque<PathBuf> = files.iter().cloned().collect();
    let mut seen = BTreeSet::new();
    let mut documents = Vec::new();

    while let Some(path) = queue.pop_front() {
        if !seen.insert(path.clone()) {
            tracing::warn!(path = %path.display(), "document already loaded, skipping");
            continue;
        }
        tracing::debug!(path = %path.display(), "loading compose document");
        let text = source.read(&path)?;
        let mut content = parse_document(&text, &path.display().to_string())?;
        if let Some(include) = take_key(&mut content, "include") {
            let dir = document_dir(&path);
            for included in include_paths(&include, &path)? {
                tracing::debug!(from = %path.display(), include = %included, "queueing include");
                queue.push_back(dir.join(included));
            }
        }
        documents.push(Document { path, content });
    }

    Ok(documents)
}
