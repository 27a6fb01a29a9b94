//! # convoy-compose
//!
//! Resolution of compose files into a project model.
//!
//! Handles:
//! - **Document**: Reading sources, parsing YAML, following `include`.
//! - **Interpolate**: `$VAR` substitution with defaults and required values.
//! - **Merge**: Recursive merging honoring `!reset` and `!override`.
//! - **Normalize**: Canonical shapes for per-service shorthand forms.
//! - **Extends**: Same-file and cross-file `extends` resolution.
//! - **Graph**: Transitive dependency sets and topological ordering.
//! - **Build graph**: `service:` build contexts and build cycle detection.
//! - **Mount**: Short and long mount syntax, volume name resolution.
//! - **Project**: The staged pipeline producing services, networks,
//!   volumes, secrets, and container records.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod build_graph;
pub mod document;
pub mod env;
pub mod extends;
pub mod graph;
pub mod interpolate;
pub mod lexer;
pub mod merge;
pub mod model;
pub mod mount;
pub mod normalize;
pub mod project;

pub use project::{Project, ProjectResolver};
