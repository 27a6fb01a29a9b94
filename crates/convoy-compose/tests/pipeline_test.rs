//! End-to-end tests of the resolution pipeline.
//!
//! These tests exercise the public API across modules:
//! 1. Merge rules and merge markers
//! 2. Shorthand normalization
//! 3. Variable interpolation
//! 4. Dependency closure and cycle tolerance
//! 5. Build-context cycle rejection
//! 6. Full resolution of on-disk projects

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use convoy_common::config::ResolveOptions;
use convoy_common::error::ComposeError;
use convoy_common::types::ResolveStage;
use convoy_compose::env::Environment;
use convoy_compose::graph::flat_deps;
use convoy_compose::interpolate::interpolate_str;
use convoy_compose::merge::{finalize, merge, merge_all};
use convoy_compose::normalize::normalize_service;
use convoy_compose::{Project, ProjectResolver};
use serde_yaml::{Mapping, Value};

fn map(text: &str) -> Mapping {
    serde_yaml::from_str(text).expect("valid yaml mapping")
}

fn value(text: &str) -> Value {
    serde_yaml::from_str(text).expect("valid yaml")
}

fn merged(docs: &[&str]) -> Mapping {
    let docs: Vec<Mapping> = docs.iter().map(|d| map(d)).collect();
    finalize(merge_all(&docs).expect("should merge")).expect("should finalize")
}

// ── Merge ────────────────────────────────────────────────────────────

#[test]
fn merge_with_empty_is_identity() {
    let x = map("a: 1\nb: [x, y]\nc: {d: e}\nvolumes: ['h:/t']\n");
    let mut left = x.clone();
    merge(&mut left, &Mapping::new()).expect("should merge");
    assert_eq!(left, x);
    let mut right = Mapping::new();
    merge(&mut right, &x).expect("should merge");
    assert_eq!(right, x);
}

#[test]
fn later_scalar_wins() {
    assert_eq!(merged(&["k: a", "k: b"]), map("k: b"));
}

#[test]
fn command_and_entrypoint_are_replaced() {
    assert_eq!(
        merged(&["command: [a]\nentrypoint: [x]", "command: [b]\nentrypoint: [y]"]),
        map("command: [b]\nentrypoint: [y]")
    );
}

#[test]
fn volumes_dedup_by_target() {
    assert_eq!(
        merged(&["volumes: ['h1:/x:ro']", "volumes: ['h2:/x:rw']"]),
        map("volumes: ['h2:/x:rw']")
    );
    assert_eq!(
        merged(&["volumes: ['h1:/x']", "volumes: ['h2:/y']"]),
        map("volumes: ['h1:/x', 'h2:/y']")
    );
}

#[test]
fn reset_wins_in_either_order() {
    assert_eq!(merged(&["k: v\nz: 1", "k: !reset null"]), map("z: 1"));
    assert_eq!(merged(&["k: !reset null\nz: 1", "k: v"]), map("z: 1"));
}

#[test]
fn override_replaces_without_merging() {
    assert_eq!(
        merged(&["env: {A: '1', B: '2'}", "env: !override {C: '3'}"]),
        map("env: {C: '3'}")
    );
}

#[test]
fn type_mismatch_names_the_key() {
    let docs = [map("services: {web: {ports: ['1:1']}}"), map("services: {web: {ports: x}}")];
    let msg = merge_all(&docs).unwrap_err().to_string();
    assert!(msg.contains("services.web.ports"), "got: {msg}");
}

// ── Normalization ────────────────────────────────────────────────────

fn normalized(text: &str) -> Value {
    let mut service = value(text);
    normalize_service(&mut service, None).expect("should normalize");
    service
}

#[test]
fn shorthand_forms_normalize() {
    assert_eq!(normalized("build: ."), value("build: {context: .}"));
    assert_eq!(
        normalized("command: sh -c 'sleep infinity'"),
        value("command: [sh, -c, sleep infinity]")
    );
    assert_eq!(
        normalized("depends_on: x"),
        value("depends_on: {x: {condition: service_started}}")
    );
}

#[test]
fn normalization_is_idempotent() {
    let once = normalized(
        "build: {context: ., args: {A: 1}}\ncommand: run --fast\nenvironment: [X=1, Y]\nlabels: {a: b}\ndepends_on: [db]\nvolumes: ./d:/d\nsecurity_opt: 'apparmor:unconfined'\nextends: base\n",
    );
    let mut twice = once.clone();
    normalize_service(&mut twice, None).expect("should normalize");
    assert_eq!(once, twice);
}

// ── Interpolation ────────────────────────────────────────────────────

#[test]
fn interpolation_defaults() {
    let env = Environment::from([
        ("v1".to_owned(), "high".to_owned()),
        ("empty".to_owned(), String::new()),
    ]);
    let sub = |s: &str| interpolate_str(s, &env).expect("should interpolate");
    assert_eq!(sub("${v1:-low}"), "high");
    assert_eq!(sub("${missing:-low}"), "low");
    assert_eq!(sub("${missing-low}"), "low");
    assert_eq!(sub("${empty:-low}"), "low");
    assert_eq!(sub("${empty-low}"), "");
    assert_eq!(sub("$$x"), "$x");
}

#[test]
fn required_variable_reports_message() {
    let err = interpolate_str("${TOKEN:?token must be set}", &Environment::new()).unwrap_err();
    assert!(err.to_string().contains("token must be set"), "got: {err}");
}

// ── Dependency graph ─────────────────────────────────────────────────

fn services(text: &str) -> Mapping {
    let mut services = map(text);
    for (_, service) in services.iter_mut() {
        normalize_service(service, None).expect("should normalize");
    }
    services
}

fn names(set: &BTreeSet<convoy_common::types::ServiceDependency>) -> Vec<&str> {
    set.iter().map(|d| d.name.as_str()).collect()
}

#[test]
fn dependency_closure() {
    let sets = flat_deps(
        &services("foo: {}\nbar: {depends_on: foo}\nbaz: {depends_on: bar}\n"),
        false,
    )
    .expect("should build");
    assert!(sets.deps_of("foo").is_empty());
    assert_eq!(names(&sets.deps_of("bar")), vec!["foo"]);
    assert_eq!(names(&sets.deps_of("baz")), vec!["bar", "foo"]);
    assert_eq!(names(&sets.dependents_of("foo")), vec!["bar", "baz"]);
    assert!(sets.dependents_of("baz").is_empty());
}

#[test]
fn self_and_mutual_cycles_are_tolerated() {
    let sets = flat_deps(
        &services("a: {depends_on: [a]}\nb: {depends_on: [c]}\nc: {depends_on: [b]}\n"),
        false,
    )
    .expect("should build");
    assert!(sets.deps_of("a").is_empty());
    assert_eq!(names(&sets.deps_of("b")), vec!["c"]);
    assert_eq!(names(&sets.deps_of("c")), vec!["b"]);
}

// ── On-disk projects ─────────────────────────────────────────────────

fn write(dir: &Path, name: &str, text: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("should create directories");
    }
    fs::write(path, text).expect("should write file");
}

fn resolve(dir: &Path, files: &[&str]) -> Result<Project, ComposeError> {
    ProjectResolver::new(ResolveOptions::with_files(files.iter().map(|f| dir.join(f))))
        .with_environment(Environment::new())
        .resolve()
}

#[test]
fn later_build_context_wins_and_becomes_absolute() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    write(tmp.path(), "a.yaml", "services: {svc: {build: ./dir-1}}\n");
    write(tmp.path(), "b.yaml", "services: {svc: {build: ./dir-2}}\n");
    let project = resolve(tmp.path(), &["a.yaml", "b.yaml"]).expect("should resolve");

    let expected = format!("{}/dir-2", tmp.path().display());
    let build = project.services["svc"].build.as_ref().expect("build");
    assert_eq!(build.context.as_deref(), Some(expected.as_str()));

    let raw = project
        .merged
        .get("services")
        .and_then(|s| s.get("svc"))
        .and_then(|s| s.get("build"))
        .cloned();
    assert_eq!(raw, Some(value(&format!("{{context: '{expected}'}}"))));
}

#[test]
fn include_extends_and_dotenv_work_together() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    write(tmp.path(), ".env", "TAG=1.2\nexport LEVEL='debug'\n");
    write(
        tmp.path(),
        "compose.yaml",
        "include: [extra/more.yaml]\nservices:\n  web:\n    image: app:${TAG}\n    extends: {file: common/base.yaml, service: base}\n    environment: {LEVEL: $LEVEL}\n",
    );
    write(
        tmp.path(),
        "common/base.yaml",
        "services:\n  base:\n    build: .\n    environment: [A=1]\n",
    );
    write(
        tmp.path(),
        "extra/more.yaml",
        "services:\n  worker: {image: w, depends_on: [web]}\n",
    );

    let project = resolve(tmp.path(), &["compose.yaml"]).expect("should resolve");
    let web = &project.services["web"];
    assert_eq!(web.image.as_deref(), Some("app:1.2"));
    assert_eq!(
        web.build.as_ref().and_then(|b| b.context.clone()),
        Some(format!("{}/common", tmp.path().display()))
    );
    assert_eq!(web.environment.get("A"), Some(&Some("1".to_owned())));
    assert_eq!(web.environment.get("LEVEL"), Some(&Some("debug".to_owned())));
    assert_eq!(project.start_order(), vec!["web", "worker"]);
}

#[test]
fn default_files_are_discovered_in_order() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    write(tmp.path(), "compose.yaml", "services: {web: {image: base}}\n");
    write(tmp.path(), "compose.override.yaml", "services: {web: {image: override}}\n");
    let project = ProjectResolver::new(ResolveOptions {
        project_dir: Some(tmp.path().to_path_buf()),
        ..ResolveOptions::default()
    })
    .with_environment(Environment::new())
    .resolve()
    .expect("should resolve");
    assert_eq!(project.files.len(), 2);
    assert_eq!(project.services["web"].image.as_deref(), Some("override"));
}

#[test]
fn missing_compose_file_fails_at_init() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let err = ProjectResolver::new(ResolveOptions {
        project_dir: Some(tmp.path().to_path_buf()),
        ..ResolveOptions::default()
    })
    .with_environment(Environment::new())
    .resolve()
    .unwrap_err();
    assert_eq!(err.stage(), Some(ResolveStage::Init));
}

#[test]
fn build_context_cycles_are_fatal() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    write(
        tmp.path(),
        "compose.yaml",
        "services:\n  a: {build: {context: ., additional_contexts: {x: 'service:b'}}}\n  b: {build: {context: ., additional_contexts: ['y=service:a']}}\n",
    );
    let err = resolve(tmp.path(), &["compose.yaml"]).unwrap_err();
    assert_eq!(err.stage(), Some(ResolveStage::BuildGraphChecked));
    let ComposeError::Cycle { kind, path } = err.root() else {
        panic!("expected a cycle, got {err:?}");
    };
    assert_eq!(*kind, "build");
    assert_eq!(path, &["a", "b", "a"]);
}

#[test]
fn build_context_diamond_resolves() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    write(
        tmp.path(),
        "compose.yaml",
        "services:\n  a: {build: {context: ., additional_contexts: ['c=service:c', 'b=service:b']}}\n  b: {build: {context: ., additional_contexts: ['d=service:d']}}\n  c: {build: {context: ., additional_contexts: ['d=service:d']}}\n  d: {image: base:1}\n",
    );
    let project = resolve(tmp.path(), &["compose.yaml"]).expect("should resolve");
    let build = project.services["a"].build.as_ref().expect("build");
    assert_eq!(build.build_deps, vec!["b", "c"]);
    let b = project.services["b"].build.as_ref().expect("build");
    assert_eq!(b.additional_contexts, vec!["d=docker://base:1"]);
}
