//! Integration tests for multi-file project resolution over a realistic
//! web stack.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use convoy_common::config::ResolveOptions;
use convoy_common::error::{ComposeError, Result};
use convoy_common::types::ResolveStage;
use convoy_compose::document::InMemorySource;
use convoy_compose::env::Environment;
use convoy_compose::{Project, ProjectResolver};

const BASE: &str = r"
services:
  db:
    image: postgres:16
    volumes: [data:/var/lib/postgresql/data]
    healthcheck: {test: [CMD, pg_isready]}
  cache:
    image: redis:7
  api:
    build: ./api
    depends_on:
      db: {condition: service_healthy}
      cache: {condition: service_started}
    environment: [DATABASE_URL=postgres://db/app, LOG=${LOG_LEVEL:-info}]
    ports: ['8080:8080']
  web:
    image: nginx
    depends_on: [api]
  debug:
    image: busybox
    profiles: [debug]
    depends_on: [api]
volumes:
  data: {}
";

const OVERRIDE: &str = r"
services:
  api:
    ports: !reset []
    environment: {LOG: debug}
  web:
    deploy: {replicas: 2}
";

fn resolve(env: &[(&str, &str)], files: &[&str]) -> Result<Project> {
    let source = InMemorySource::new()
        .with_file("/srv/Web Stack/compose.yaml", BASE)
        .with_file("/srv/Web Stack/compose.override.yaml", OVERRIDE);
    let environment: Environment = env
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    let files: Vec<PathBuf> = files
        .iter()
        .map(|f| PathBuf::from("/srv/Web Stack").join(f))
        .collect();
    ProjectResolver::new(ResolveOptions::with_files(files))
        .with_source(&source)
        .with_environment(environment)
        .resolve()
}

fn both(env: &[(&str, &str)]) -> Project {
    resolve(env, &["compose.yaml", "compose.override.yaml"]).expect("should resolve")
}

// ── Ordering ─────────────────────────────────────────────────────────

#[test]
fn stack_starts_dependencies_first() {
    let project = both(&[]);
    let order = project.start_order();
    let pos = |name: &str| order.iter().position(|n| n == name).expect("in order");
    assert!(pos("db") < pos("api"));
    assert!(pos("cache") < pos("api"));
    assert!(pos("api") < pos("web"));
    assert!(!order.contains(&"debug".to_owned()));
}

#[test]
fn transitive_dependencies_reach_the_frontend() {
    let project = both(&[]);
    let deps: Vec<&str> = project.services["web"]
        .deps
        .iter()
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(deps, vec!["api", "cache", "db"]);
}

// ── Overrides ────────────────────────────────────────────────────────

#[test]
fn override_file_resets_and_merges() {
    let project = both(&[("LOG_LEVEL", "warn")]);
    let api = &project.services["api"];
    assert!(api.ports.is_empty());
    assert_eq!(api.environment.get("LOG"), Some(&Some("debug".to_owned())));
    assert_eq!(
        api.environment.get("DATABASE_URL"),
        Some(&Some("postgres://db/app".to_owned()))
    );
}

#[test]
fn interpolation_default_applies_without_override() {
    let project = resolve(&[], &["compose.yaml"]).expect("should resolve");
    let api = &project.services["api"];
    assert_eq!(api.environment.get("LOG"), Some(&Some("info".to_owned())));
    assert_eq!(api.ports, vec!["8080:8080"]);
}

// ── Naming and replicas ──────────────────────────────────────────────

#[test]
fn project_name_comes_from_the_directory() {
    let project = both(&[]);
    assert_eq!(project.name, "webstack");
    assert_eq!(project.volumes["data"].runtime_name, "webstack_data");
    assert!(project.container("webstack_web_1").is_some());
    assert!(project.container("webstack_web_2").is_some());
    assert_eq!(project.containers_of("web").count(), 2);
}

#[test]
fn environment_project_name_is_normalized() {
    let project = both(&[("COMPOSE_PROJECT_NAME", "Prod.Stack")]);
    assert_eq!(project.name, "prodstack");
    assert!(project.container("prodstack_db_1").is_some());
}

#[test]
fn built_service_gets_a_local_image_and_absolute_context() {
    let project = both(&[]);
    let api = project.container("webstack_api_1").expect("api container");
    assert_eq!(api.image, "webstack_api");
    let context = project.services["api"]
        .build
        .as_ref()
        .and_then(|b| b.context.clone());
    assert_eq!(context.as_deref(), Some("/srv/Web Stack/api"));
}

// ── Profiles ─────────────────────────────────────────────────────────

#[test]
fn profiles_from_the_environment_enable_services() {
    let project = both(&[("COMPOSE_PROFILES", "debug")]);
    assert!(project.services.contains_key("debug"));
    assert!(project.start_order().contains(&"debug".to_owned()));
}

// ── Fingerprints ─────────────────────────────────────────────────────

#[test]
fn fingerprints_are_stable_and_track_changes() {
    let first = both(&[]);
    let second = both(&[]);
    assert_eq!(first.config_hash, second.config_hash);
    assert_eq!(
        first.services["db"].fingerprint,
        second.services["db"].fingerprint
    );

    let changed = both(&[("LOG_LEVEL", "warn")]);
    let base_only = resolve(&[], &["compose.yaml"]).expect("should resolve");
    assert_ne!(first.config_hash, base_only.config_hash);
    assert_eq!(
        first.services["db"].fingerprint,
        changed.services["db"].fingerprint
    );
}

#[test]
fn printed_config_parses_back() {
    let project = both(&[]);
    let yaml = project.config_yaml().expect("should serialize");
    let reparsed: serde_yaml::Mapping = serde_yaml::from_str(&yaml).expect("valid yaml");
    assert_eq!(reparsed, project.merged);
}

// ── Failures ─────────────────────────────────────────────────────────

#[test]
fn missing_file_fails_while_loading() {
    let err = resolve(&[], &["compose.yaml", "missing.yaml"]).unwrap_err();
    assert_eq!(err.stage(), Some(ResolveStage::DocumentsLoaded));
    assert!(matches!(err.root(), ComposeError::Io { .. }));
}

#[test]
fn unknown_service_on_the_command_line() {
    let project = both(&[]);
    let err = project.assert_services(&["api", "worker"]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("\"worker\""), "got: {msg}");
}
