// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::{DependencyReport, OrchestratorError, Result};
use crate::types::UnitId;

/// Declaration of one unit as seen by the dependency resolver.
#[derive(Debug, Clone, Default)]
pub struct UnitDecl {
    pub name: Option<String>,
    pub dependencies: Vec<String>,
}

impl UnitDecl {
    pub fn new(name: Option<&str>, dependencies: &[&str]) -> Self {
        Self {
            name: name.map(str::to_string),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Internal node structure: stores immediate parents and children.
#[derive(Debug, Clone)]
struct GraphNode {
    label: String,
    /// Units this one depends on.
    parents: Vec<UnitId>,
    /// Units that depend on this one.
    children: Vec<UnitId>,
}

/// Validated dependency relation between the units of a group, indexed by
/// construction order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
}

impl DependencyGraph {
    /// Resolve declared dependency names into parent/child links.
    ///
    /// Fails with:
    /// - `ConfigError` if two units share a name,
    /// - `InvalidDependencies` if any dependency name is unknown or the
    ///   relation contains a cycle. Both problems are reported together.
    pub fn resolve(decls: &[UnitDecl]) -> Result<Self> {
        let labels: Vec<String> = decls
            .iter()
            .enumerate()
            .map(|(i, d)| d.name.clone().unwrap_or_else(|| UnitId(i).to_string()))
            .collect();

        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (i, decl) in decls.iter().enumerate() {
            if let Some(name) = decl.name.as_deref() {
                if by_name.insert(name, i).is_some() {
                    return Err(OrchestratorError::ConfigError(format!(
                        "unit name '{name}' is used more than once"
                    )));
                }
            }
        }

        // Edge direction: dependent -> dependency.
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        let mut report = DependencyReport::default();
        let mut parents: Vec<Vec<UnitId>> = vec![Vec::new(); decls.len()];

        for i in 0..decls.len() {
            graph.add_node(i);
        }

        for (i, decl) in decls.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &decl.dependencies {
                match by_name.get(dep.as_str()) {
                    Some(&target) => {
                        graph.add_edge(i, target, ());
                        if seen.insert(target) {
                            parents[i].push(UnitId(target));
                        }
                    }
                    None => report.missing.push(dep.clone()),
                }
            }
        }

        report.cycle = leftover_edges(graph)
            .into_iter()
            .map(|(s, t)| (labels[s].clone(), labels[t].clone()))
            .collect();
        report.cycle.sort();

        if !report.is_empty() {
            return Err(OrchestratorError::InvalidDependencies(report));
        }

        let mut nodes: Vec<GraphNode> = labels
            .into_iter()
            .zip(parents)
            .map(|(label, parents)| GraphNode {
                label,
                parents,
                children: Vec::new(),
            })
            .collect();

        for i in 0..nodes.len() {
            let parents = nodes[i].parents.clone();
            for parent in parents {
                nodes[parent.index()].children.push(UnitId(i));
            }
        }

        debug!(units = nodes.len(), "resolved unit dependency graph");
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn label(&self, unit: UnitId) -> &str {
        self.nodes
            .get(unit.index())
            .map(|n| n.label.as_str())
            .unwrap_or("<unknown>")
    }

    /// Immediate dependencies of a unit.
    pub fn parents_of(&self, unit: UnitId) -> &[UnitId] {
        self.nodes
            .get(unit.index())
            .map(|n| n.parents.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a unit.
    pub fn children_of(&self, unit: UnitId) -> &[UnitId] {
        self.nodes
            .get(unit.index())
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn units(&self) -> impl Iterator<Item = UnitId> + '_ {
        (0..self.nodes.len()).map(UnitId)
    }
}

/// Walk from every unit nothing depends on, deleting each edge as it is
/// followed. A dependency is only walked once all of its dependents' edges are
/// gone, so whatever survives lies on (or behind) a cycle.
fn leftover_edges(mut graph: DiGraphMap<usize, ()>) -> Vec<(usize, usize)> {
    let mut stack: Vec<usize> = graph
        .nodes()
        .filter(|&n| graph.neighbors_directed(n, Direction::Incoming).next().is_none())
        .collect();

    while let Some(current) = stack.pop() {
        let targets: Vec<usize> = graph
            .neighbors_directed(current, Direction::Outgoing)
            .collect();
        for target in targets {
            graph.remove_edge(current, target);
            if graph
                .neighbors_directed(target, Direction::Incoming)
                .next()
                .is_none()
            {
                stack.push(target);
            }
        }
    }

    graph.all_edges().map(|(s, t, _)| (s, t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(table: &[(&str, &[&str])]) -> Vec<UnitDecl> {
        table.iter()
            .map(|(name, deps)| UnitDecl::new(Some(name), deps))
            .collect()
    }

    #[test]
    fn links_parents_and_children() {
        let g = DependencyGraph::resolve(&decls(&[("a", &["b", "c"]), ("b", &[]), ("c", &["b"])]))
            .unwrap();

        assert_eq!(g.parents_of(UnitId(0)), &[UnitId(1), UnitId(2)]);
        assert_eq!(g.children_of(UnitId(1)), &[UnitId(0), UnitId(2)]);
        assert_eq!(g.children_of(UnitId(2)), &[UnitId(0)]);
        assert!(g.parents_of(UnitId(1)).is_empty());
    }

    #[test]
    fn duplicate_dependency_names_collapse_to_one_parent() {
        let g = DependencyGraph::resolve(&decls(&[("a", &["b", "b"]), ("b", &[])])).unwrap();
        assert_eq!(g.parents_of(UnitId(0)), &[UnitId(1)]);
        assert_eq!(g.children_of(UnitId(1)), &[UnitId(0)]);
    }

    #[test]
    fn reports_every_edge_of_a_cycle_sorted() {
        let err = DependencyGraph::resolve(&decls(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
            ("d", &[]),
        ]))
        .unwrap_err();

        match err {
            OrchestratorError::InvalidDependencies(report) => {
                assert!(report.missing.is_empty());
                assert_eq!(
                    report.cycle,
                    vec![
                        ("a".to_string(), "b".to_string()),
                        ("b".to_string(), "c".to_string()),
                        ("c".to_string(), "a".to_string()),
                    ]
                );
                let msg = report.to_string();
                assert!(msg.starts_with("Circular dependency found"));
                assert!(msg.contains("a -> b"));
            }
            other => panic!("expected InvalidDependencies, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = DependencyGraph::resolve(&decls(&[("a", &["a"])])).unwrap_err();
        match err {
            OrchestratorError::InvalidDependencies(report) => {
                assert_eq!(report.cycle, vec![("a".to_string(), "a".to_string())]);
            }
            other => panic!("expected InvalidDependencies, got {other:?}"),
        }
    }

    #[test]
    fn edges_leading_into_a_cycle_are_reported_with_it() {
        // `top` is reachable, but `x <-> y` never drains, and the edge from
        // `top` into it is removed while walking, so only the cycle remains.
        let err = DependencyGraph::resolve(&decls(&[
            ("top", &["x"]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]))
        .unwrap_err();
        match err {
            OrchestratorError::InvalidDependencies(report) => {
                assert_eq!(
                    report.cycle,
                    vec![
                        ("x".to_string(), "y".to_string()),
                        ("y".to_string(), "x".to_string()),
                    ]
                );
            }
            other => panic!("expected InvalidDependencies, got {other:?}"),
        }
    }

    #[test]
    fn missing_dependency_is_named() {
        let err = DependencyGraph::resolve(&decls(&[("a", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("Unit dependency `ghost` not found."));
    }

    #[test]
    fn duplicate_unit_names_are_rejected() {
        let err = DependencyGraph::resolve(&decls(&[("a", &[]), ("a", &[])])).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(_)));
    }

    #[test]
    fn unnamed_units_get_positional_labels() {
        let g = DependencyGraph::resolve(&[UnitDecl::default(), UnitDecl::new(Some("b"), &[])])
            .unwrap();
        assert_eq!(g.label(UnitId(0)), "unit#0");
        assert_eq!(g.label(UnitId(1)), "b");
    }
}
