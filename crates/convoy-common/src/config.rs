//! Options controlling one project resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Inputs supplied by the CLI layer to the project resolver.
///
/// None of these are parsed by the resolver itself; they arrive as plain
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Compose files in merge order. Empty means "discover defaults".
    pub files: Vec<PathBuf>,
    /// Explicit project-name override (highest priority).
    pub project_name: Option<String>,
    /// Explicit project directory. Defaults to the first file's directory.
    pub project_dir: Option<PathBuf>,
    /// Requested profiles. Empty means "use `COMPOSE_PROFILES`".
    pub profiles: BTreeSet<String>,
    /// Per-service replica overrides (`--scale svc=N`).
    pub scale: BTreeMap<String, u32>,
    /// Explicit dotenv file. Defaults to `<project dir>/.env`.
    pub env_file: Option<PathBuf>,
    /// Whether the process environment is part of the ambient environment.
    pub use_process_env: bool,
    /// Attach every container to one project pod.
    pub in_pod: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            project_name: None,
            project_dir: None,
            profiles: BTreeSet::new(),
            scale: BTreeMap::new(),
            env_file: None,
            use_process_env: true,
            in_pod: false,
        }
    }
}

impl ResolveOptions {
    /// Creates options for the given compose files.
    #[must_use]
    pub fn with_files<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}
