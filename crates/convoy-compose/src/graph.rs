//! Service dependency graphs.
//!
//! [`flat_deps`] computes, for every service, the transitive set of
//! services it depends on and the transposed set of services depending on
//! it. Dependency cycles are tolerated there: propagation stops at any
//! service that already points back at the one being resolved.
//!
//! [`DependencyGraph`] orders named nodes topologically using `petgraph`,
//! breaking ties by name so the order is stable.

use std::collections::{BTreeMap, BTreeSet};

use convoy_common::error::{ComposeError, Result};
use convoy_common::types::{ServiceDependency, ServiceDependencyCondition};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use serde_yaml::{Mapping, Value};

/// Service name to a set of dependency edges.
pub type DependencyMap = BTreeMap<String, BTreeSet<ServiceDependency>>;

/// Transitive dependencies and their transpose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySets {
    /// Services each service (transitively) depends on.
    pub deps: DependencyMap,
    /// Services that (transitively) depend on each service.
    pub dependents: DependencyMap,
}

impl DependencySets {
    /// Dependencies of `name`; empty for an unknown service.
    #[must_use]
    pub fn deps_of(&self, name: &str) -> BTreeSet<ServiceDependency> {
        self.deps.get(name).cloned().unwrap_or_default()
    }

    /// Dependents of `name`; empty for an unknown service.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> BTreeSet<ServiceDependency> {
        self.dependents.get(name).cloned().unwrap_or_default()
    }

    /// Drops services not in `keep`, along with every edge naming one.
    ///
    /// Returns the dropped `(service, dependency)` edges of kept services.
    pub fn retain_services(&mut self, keep: &BTreeSet<String>) -> Vec<(String, String)> {
        let mut pruned = Vec::new();
        for map in [&mut self.deps, &mut self.dependents] {
            map.retain(|name, _| keep.contains(name));
        }
        for (name, set) in &mut self.deps {
            set.retain(|dep| {
                let kept = keep.contains(&dep.name);
                if !kept {
                    pruned.push((name.clone(), dep.name.clone()));
                }
                kept
            });
        }
        for set in self.dependents.values_mut() {
            set.retain(|dep| keep.contains(&dep.name));
        }
        pruned
    }
}

fn condition_error(service: &str, err: ComposeError) -> ComposeError {
    match err {
        ComposeError::Normalization { field, message } => ComposeError::Normalization {
            field: format!("services.{service}.{field}"),
            message,
        },
        other => other,
    }
}

/// Direct dependencies of one service.
///
/// `depends_on` entries keep their condition; `links` targets (with any
/// `:alias` stripped) depend on [`ServiceDependencyCondition::Running`].
/// With `with_extends`, a service extending another service of the same
/// file depends on exactly that service instead.
///
/// # Errors
///
/// Returns [`ComposeError::Normalization`] for an unknown condition.
pub fn direct_dependencies(
    name: &str,
    service: &Mapping,
    with_extends: bool,
) -> Result<BTreeSet<ServiceDependency>> {
    let mut deps = BTreeSet::new();
    if with_extends {
        if let Some(Value::Mapping(extends)) = service.get("extends") {
            if !extends.contains_key("file") {
                if let Some(target) = extends.get("service").and_then(Value::as_str) {
                    if target != name {
                        let _ = deps.insert(ServiceDependency::new(
                            target,
                            ServiceDependencyCondition::Running,
                        ));
                    }
                    return Ok(deps);
                }
            }
        }
    }

    if let Some(Value::Mapping(depends_on)) = service.get("depends_on") {
        for (dep, entry) in depends_on {
            let Some(dep) = dep.as_str() else { continue };
            let condition = match entry.get("condition").and_then(Value::as_str) {
                Some(raw) => raw
                    .parse::<ServiceDependencyCondition>()
                    .map_err(|e| condition_error(name, e))?,
                None => ServiceDependencyCondition::Running,
            };
            let _ = deps.insert(ServiceDependency::new(dep, condition));
        }
    }
    if let Some(Value::Sequence(links)) = service.get("links") {
        for link in links.iter().filter_map(Value::as_str) {
            let target = link.split(':').next().unwrap_or(link);
            let _ = deps.insert(ServiceDependency::new(
                target,
                ServiceDependencyCondition::Running,
            ));
        }
    }
    Ok(deps)
}

/// Direct dependencies of every service in a `services` mapping.
///
/// # Errors
///
/// See [`direct_dependencies`].
pub fn direct_dependency_map(services: &Mapping, with_extends: bool) -> Result<DependencyMap> {
    let mut direct = DependencyMap::new();
    for (name, service) in services {
        let Some(name) = name.as_str() else { continue };
        let deps = match service {
            Value::Mapping(service) => direct_dependencies(name, service, with_extends)?,
            _ => BTreeSet::new(),
        };
        let _ = direct.insert(name.to_owned(), deps);
    }
    Ok(direct)
}

/// Computes transitive dependencies and dependents of every service.
///
/// # Errors
///
/// See [`direct_dependencies`].
pub fn flat_deps(services: &Mapping, with_extends: bool) -> Result<DependencySets> {
    Ok(close_dependencies(direct_dependency_map(services, with_extends)?))
}

/// Expands direct dependencies to their transitive closure, then computes
/// the transpose.
///
/// No service ends up in its own dependency set. Cycles are logged, not
/// rejected.
#[must_use]
pub fn close_dependencies(direct: DependencyMap) -> DependencySets {
    let mut deps = direct;
    let names: Vec<String> = deps.keys().cloned().collect();
    for name in &names {
        let mut path = vec![name.clone()];
        let _ = expand(&mut deps, name, name, &mut path);
    }
    for (name, set) in &mut deps {
        set.retain(|dep| dep.name != *name);
    }

    let mut dependents: DependencyMap = names
        .iter()
        .map(|name| (name.clone(), BTreeSet::new()))
        .collect();
    for (name, set) in &deps {
        for dep in set {
            if let Some(target) = dependents.get_mut(&dep.name) {
                let _ = target.insert(ServiceDependency::new(name.clone(), dep.condition));
            }
        }
    }
    DependencySets { deps, dependents }
}

fn expand(
    deps: &mut DependencyMap,
    name: &str,
    start: &str,
    path: &mut Vec<String>,
) -> BTreeSet<ServiceDependency> {
    let current = deps.get(name).cloned().unwrap_or_default();
    for dep in &current {
        if dep.name == name {
            continue;
        }
        let Some(nested) = deps.get(&dep.name) else {
            continue;
        };
        if nested.iter().any(|d| d.name == start) {
            tracing::warn!(
                service = start,
                via = %dep.name,
                "dependency cycle detected, not propagating further"
            );
            continue;
        }
        if path.contains(&dep.name) {
            continue;
        }
        path.push(dep.name.clone());
        let nested = expand(deps, &dep.name, start, path);
        let _ = path.pop();
        if let Some(set) = deps.get_mut(name) {
            set.extend(nested);
        }
    }
    deps.get(name).cloned().unwrap_or_default()
}

/// A dependency graph of named nodes.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Internal petgraph representation. Edges point from a dependency to
    /// its dependent.
    graph: petgraph::Graph<String, ()>,
    /// Node lookup by name.
    nodes: BTreeMap<String, NodeIndex>,
    /// Graph kind, reported in cycle errors.
    kind: &'static str,
}

impl DependencyGraph {
    /// Creates an empty graph whose cycles are reported as `kind`.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            graph: petgraph::Graph::new(),
            nodes: BTreeMap::new(),
            kind,
        }
    }

    /// Adds a node, or returns the existing node of that name.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_owned());
        let _ = self.nodes.insert(name.to_owned(), idx);
        idx
    }

    /// Adds a dependency edge: `dependent` depends on `dependency`.
    pub fn add_dependency(&mut self, dependent: NodeIndex, dependency: NodeIndex) {
        let _ = self.graph.update_edge(dependency, dependent, ());
    }

    /// Builds a graph from a dependency map. Edges to names missing from
    /// the map's keys are ignored.
    #[must_use]
    pub fn from_map(kind: &'static str, map: &DependencyMap) -> Self {
        let mut graph = Self::new(kind);
        for name in map.keys() {
            let _ = graph.add_node(name);
        }
        for (name, deps) in map {
            let dependent = graph.add_node(name);
            for dep in deps {
                if let Some(&dependency) = graph.nodes.get(&dep.name) {
                    graph.add_dependency(dependent, dependency);
                }
            }
        }
        graph
    }

    fn name(&self, idx: NodeIndex) -> &str {
        self.graph.node_weight(idx).map_or("", String::as_str)
    }

    /// Returns the nodes with dependencies before their dependents. Among
    /// nodes that are ready at the same time, names sort first.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Cycle`] with the cycle's path if the graph
    /// is not acyclic.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        self.order(true)
    }

    /// Like [`Self::resolve_order`], but breaks cycles by taking the
    /// lowest-named blocked node next.
    #[must_use]
    pub fn resolve_order_lenient(&self) -> Vec<String> {
        self.order(false).unwrap_or_default()
    }

    fn order(&self, strict: bool) -> Result<Vec<String>> {
        let mut pending: BTreeMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let count = self.graph.neighbors_directed(idx, Direction::Incoming).count();
                (idx, count)
            })
            .collect();
        let mut ready: BTreeSet<(String, NodeIndex)> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| (self.name(*idx).to_owned(), *idx))
            .collect();
        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(pending.len());

        while order.len() < pending.len() {
            let (name, idx) = match ready.pop_first() {
                Some(next) => next,
                None => {
                    let blocked = self.blocked(&done);
                    if strict {
                        return Err(ComposeError::Cycle {
                            kind: self.kind,
                            path: self.cycle_path(&blocked),
                        });
                    }
                    let Some(&(_, idx)) = blocked.first() else {
                        break;
                    };
                    tracing::warn!(kind = self.kind, node = self.name(idx), "breaking dependency cycle");
                    (self.name(idx).to_owned(), idx)
                }
            };
            if !done.insert(idx) {
                continue;
            }
            order.push(name);
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if done.contains(&dependent) {
                    continue;
                }
                if let Some(count) = pending.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        let _ = ready.insert((self.name(dependent).to_owned(), dependent));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Nodes not yet emitted, sorted by name.
    fn blocked(&self, done: &BTreeSet<NodeIndex>) -> Vec<(String, NodeIndex)> {
        let mut blocked: Vec<_> = self
            .graph
            .node_indices()
            .filter(|idx| !done.contains(idx))
            .map(|idx| (self.name(idx).to_owned(), idx))
            .collect();
        blocked.sort();
        blocked
    }

    /// Walks dependency edges among blocked nodes until one repeats.
    ///
    /// Every blocked node still waits on another blocked node, so the walk
    /// always closes a cycle.
    fn cycle_path(&self, blocked: &[(String, NodeIndex)]) -> Vec<String> {
        let members: BTreeSet<NodeIndex> = blocked.iter().map(|(_, idx)| *idx).collect();
        let Some(&(_, start)) = blocked.first() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        loop {
            let next = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|idx| members.contains(idx))
                .min_by(|a, b| self.name(*a).cmp(self.name(*b)));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|idx| *idx == next) {
                path.drain(..pos);
                path.push(next);
                break;
            }
            path.push(next);
            current = next;
        }
        path.into_iter().map(|idx| self.name(idx).to_owned()).collect()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new("service")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(text: &str) -> Mapping {
        let mut doc: Mapping = serde_yaml::from_str(text).expect("valid yaml");
        crate::normalize::normalize_document(&mut doc, None).expect("should normalize");
        match doc.get("services") {
            Some(Value::Mapping(services)) => services.clone(),
            _ => panic!("no services"),
        }
    }

    fn names(set: &BTreeSet<ServiceDependency>) -> Vec<&str> {
        set.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn closure_and_transpose() {
        let sets = flat_deps(
            &services(
                "services:\n  foo: {}\n  bar: {depends_on: foo}\n  baz: {depends_on: bar}\n",
            ),
            false,
        )
        .expect("should build");
        assert!(sets.deps_of("foo").is_empty());
        assert_eq!(names(&sets.deps_of("bar")), vec!["foo"]);
        assert_eq!(names(&sets.deps_of("baz")), vec!["bar", "foo"]);
        assert_eq!(names(&sets.dependents_of("foo")), vec!["bar", "baz"]);
        assert_eq!(names(&sets.dependents_of("bar")), vec!["baz"]);
        assert!(sets.dependents_of("baz").is_empty());
    }

    #[test]
    fn dependents_keep_conditions() {
        let sets = flat_deps(
            &services(
                "services:\n  db: {}\n  web:\n    depends_on:\n      db: {condition: service_healthy}\n",
            ),
            false,
        )
        .expect("should build");
        assert_eq!(
            sets.dependents_of("db"),
            BTreeSet::from([ServiceDependency::new(
                "web",
                ServiceDependencyCondition::Healthy
            )])
        );
    }

    #[test]
    fn links_strip_alias() {
        let sets = flat_deps(
            &services("services:\n  db: {}\n  web: {links: ['db:database']}\n"),
            false,
        )
        .expect("should build");
        assert_eq!(names(&sets.deps_of("web")), vec!["db"]);
    }

    #[test]
    fn self_dependency_is_dropped() {
        let sets = flat_deps(&services("services:\n  a: {depends_on: [a]}\n"), false)
            .expect("should build");
        assert!(sets.deps_of("a").is_empty());
        assert!(sets.dependents_of("a").is_empty());
    }

    #[test]
    fn mutual_dependency_terminates_without_self_edges() {
        let sets = flat_deps(
            &services("services:\n  a: {depends_on: [b]}\n  b: {depends_on: [a]}\n"),
            false,
        )
        .expect("should build");
        assert_eq!(names(&sets.deps_of("a")), vec!["b"]);
        assert_eq!(names(&sets.deps_of("b")), vec!["a"]);
    }

    #[test]
    fn three_cycle_terminates() {
        let sets = flat_deps(
            &services(
                "services:\n  a: {depends_on: [b]}\n  b: {depends_on: [c]}\n  c: {depends_on: [a]}\n",
            ),
            false,
        )
        .expect("should build");
        for name in ["a", "b", "c"] {
            assert!(
                !sets.deps_of(name).iter().any(|d| d.name == name),
                "{name} depends on itself"
            );
        }
    }

    #[test]
    fn diamond_is_fully_expanded() {
        let sets = flat_deps(
            &services(
                "services:\n  a: {depends_on: [b, c]}\n  b: {depends_on: [d]}\n  c: {depends_on: [d]}\n  d: {}\n",
            ),
            false,
        )
        .expect("should build");
        assert_eq!(names(&sets.deps_of("a")), vec!["b", "c", "d"]);
        assert_eq!(names(&sets.dependents_of("d")), vec!["a", "b", "c"]);
    }

    #[test]
    fn transpose_matches_closure() {
        let sets = flat_deps(
            &services(
                "services:\n  a: {depends_on: {b: {condition: service_healthy}}}\n  b: {links: [c]}\n  c: {}\n  d: {depends_on: [a, c]}\n",
            ),
            false,
        )
        .expect("should build");
        for (name, deps) in &sets.deps {
            for dep in deps {
                assert!(
                    sets.dependents_of(&dep.name)
                        .contains(&ServiceDependency::new(name.clone(), dep.condition)),
                    "missing transpose of {name} -> {dep}"
                );
            }
        }
    }

    #[test]
    fn with_extends_uses_only_the_base() {
        let direct = direct_dependency_map(
            &services(
                "services:\n  base: {}\n  web: {extends: base, depends_on: [db]}\n  db: {}\n  other: {extends: {service: x, file: o.yaml}}\n  me: {extends: me}\n",
            ),
            true,
        )
        .expect("should build");
        assert_eq!(names(&direct["web"]), vec!["base"]);
        assert!(direct["other"].is_empty());
        assert!(direct["me"].is_empty());
    }

    #[test]
    fn unknown_condition_names_service() {
        let msg = flat_deps(
            &services("services:\n  web:\n    depends_on: {db: {condition: eventually}}\n"),
            false,
        )
        .unwrap_err()
        .to_string();
        assert!(msg.contains("services.web.depends_on.condition"), "got: {msg}");
    }

    #[test]
    fn retain_prunes_edges_to_dropped_services() {
        let mut sets = flat_deps(
            &services("services:\n  a: {depends_on: [b]}\n  b: {}\n  c: {depends_on: [a]}\n"),
            false,
        )
        .expect("should build");
        let keep = BTreeSet::from(["a".to_owned(), "c".to_owned()]);
        let pruned = sets.retain_services(&keep);
        assert!(pruned.contains(&("a".to_owned(), "b".to_owned())));
        assert!(sets.deps_of("a").is_empty());
        assert!(!sets.deps.contains_key("b"));
        assert_eq!(names(&sets.dependents_of("a")), vec!["c"]);
    }

    #[test]
    fn empty_graph_resolves_to_empty() {
        let graph = DependencyGraph::default();
        let order = graph.resolve_order().expect("should resolve");
        assert!(order.is_empty());
    }

    #[test]
    fn linear_dependency_chain() {
        let mut graph = DependencyGraph::default();
        let api = graph.add_node("api");
        let db = graph.add_node("db");
        graph.add_dependency(api, db);

        let order = graph.resolve_order().expect("should resolve");
        assert_eq!(order, vec!["db", "api"]);
    }

    #[test]
    fn ties_break_by_name() {
        let mut graph = DependencyGraph::default();
        for name in ["zeta", "alpha", "mid"] {
            let _ = graph.add_node(name);
        }
        assert_eq!(
            graph.resolve_order().expect("should resolve"),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn diamond_dependency() {
        let mut graph = DependencyGraph::default();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        let d = graph.add_node("d");
        graph.add_dependency(a, b);
        graph.add_dependency(a, c);
        graph.add_dependency(b, d);
        graph.add_dependency(c, d);

        let order = graph.resolve_order().expect("should resolve");
        assert_eq!(order, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn cycle_detection_reports_path() {
        let mut graph = DependencyGraph::new("extends");
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_dependency(a, b);
        graph.add_dependency(b, c);
        graph.add_dependency(c, a);

        let err = graph.resolve_order().unwrap_err();
        assert_eq!(
            err.to_string(),
            "extends dependency cycle detected: a -> b -> c -> a"
        );
    }

    #[test]
    fn lenient_order_breaks_cycles() {
        let mut graph = DependencyGraph::default();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let web = graph.add_node("web");
        graph.add_dependency(a, b);
        graph.add_dependency(b, a);
        graph.add_dependency(web, a);

        let order = graph.resolve_order_lenient();
        assert_eq!(order, vec!["a", "b", "web"]);
    }

    #[test]
    fn add_node_is_idempotent() {
        let mut graph = DependencyGraph::default();
        let first = graph.add_node("x");
        let second = graph.add_node("x");
        assert_eq!(first, second);
        assert_eq!(graph.resolve_order().expect("should resolve"), vec!["x"]);
    }
}
