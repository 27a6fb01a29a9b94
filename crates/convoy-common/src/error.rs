//! Unified error types for the Convoy workspace.
//!
//! Every failure of the resolution pipeline is fatal; the variants below
//! carry enough identity (file, key, service) for the CLI to print a
//! useful message before exiting non-zero.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ResolveStage;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A compose document is not valid YAML or has an invalid shape.
    #[error("{}", format_parse(file, *line, *column, message))]
    Parse {
        /// File (or `-` for stdin) the document came from.
        file: String,
        /// 1-based line of the error, when known.
        line: Option<usize>,
        /// 1-based column of the error, when known.
        column: Option<usize>,
        /// Parser message.
        message: String,
    },

    /// An explicit `${VAR?err}` / `${VAR:?err}` token fired.
    #[error("interpolation failed: {message}")]
    Interpolation {
        /// The user-supplied error text.
        message: String,
    },

    /// Two documents disagree on the type of a key's value.
    #[error("can't merge value of {key} of type {left} and {right}")]
    MergeTypeConflict {
        /// The offending key.
        key: String,
        /// Type name of the value already present.
        left: &'static str,
        /// Type name of the incoming value.
        right: &'static str,
    },

    /// A field has a shape normalization cannot coerce.
    #[error("invalid {field}: {message}")]
    Normalization {
        /// Name of the offending field.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// A reference names something that is not declared.
    #[error("{kind} \"{name}\" referenced by {referrer} is not defined")]
    UnknownReference {
        /// Kind of the referenced object (service, network, volume, ...).
        kind: &'static str,
        /// The unresolved name.
        name: String,
        /// Who referenced it.
        referrer: String,
    },

    /// A dependency cycle that cannot be tolerated.
    #[error("{kind} dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Which graph the cycle was found in.
        kind: &'static str,
        /// The full cycle, ending with the repeated node.
        path: Vec<String>,
    },

    /// The project name normalized to an empty string.
    #[error("project name [{dir}] normalized to empty")]
    ProjectName {
        /// The directory name the project name was derived from.
        dir: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// An error annotated with the pipeline stage it aborted.
    #[error("{stage}: {source}")]
    Stage {
        /// Stage being entered when the error occurred.
        stage: ResolveStage,
        /// The underlying failure.
        source: Box<ComposeError>,
    },
}

impl ComposeError {
    /// Wraps `self` with the stage it aborted, unless it is already wrapped.
    #[must_use]
    pub fn at_stage(self, stage: ResolveStage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping stage annotations.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the stage this error aborted, if annotated.
    #[must_use]
    pub const fn stage(&self) -> Option<ResolveStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

fn format_parse(file: &str, line: Option<usize>, column: Option<usize>, message: &str) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!("parse error in {file} at {line}:{column}: {message}"),
        (Some(line), None) => format!("parse error in {file} at line {line}: {message}"),
        _ => format!("parse error in {file}: {message}"),
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ComposeError>;
