//! Dependency resolution
//!
//! Plugins are nodes, declared dependencies are edges to the plugins they
//! require. [`resolve_order`] validates the graph and linearizes it with
//! Kahn's algorithm. Among plugins that are ready at the same time the one
//! registered first goes first, so the order only depends on the graph and
//! the registration sequence.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{CoreError, Result};

/// Returns plugin names so that every plugin follows all of its
/// dependencies.
///
/// `nodes` must be given in registration order. Fails with
/// [`CoreError::MissingDependency`] for the first unknown dependency (in
/// registration order) and with [`CoreError::CyclicDependency`] if the graph
/// has a cycle.
pub fn resolve_order<'a, I>(nodes: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (*name, i))
        .collect();

    // requires[i]: indices plugin i depends on, deduplicated
    let mut requires: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
    for (name, deps) in &nodes {
        let mut seen = HashSet::new();
        let mut edges = Vec::with_capacity(deps.len());
        for dep in deps.iter() {
            let Some(&target) = index.get(dep.as_str()) else {
                return Err(CoreError::MissingDependency {
                    plugin: (*name).to_string(),
                    dependency: dep.clone(),
                });
            };
            if seen.insert(target) {
                edges.push(target);
            }
        }
        requires.push(edges);
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut indegree: Vec<usize> = vec![0; nodes.len()];
    for (node, edges) in requires.iter().enumerate() {
        indegree[node] = edges.len();
        for &dep in edges {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &dependents[node] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != nodes.len() {
        let blocked: Vec<bool> = indegree.iter().map(|&degree| degree > 0).collect();
        let cycle = find_cycle(&requires, &blocked)
            .unwrap_or_else(|| (0..nodes.len()).filter(|&n| blocked[n]).collect());
        return Err(CoreError::CyclicDependency {
            cycle: cycle.into_iter().map(|n| nodes[n].0.to_string()).collect(),
        });
    }

    Ok(order.into_iter().map(|n| nodes[n].0.to_string()).collect())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Finds one cycle among the `blocked` nodes, returned as a path that starts
/// and ends with the same node.
fn find_cycle(requires: &[Vec<usize>], blocked: &[bool]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; requires.len()];
    let mut path = Vec::new();

    (0..requires.len())
        .filter(|&start| blocked[start])
        .find_map(|start| visit(start, requires, &mut marks, &mut path))
}

fn visit(
    node: usize,
    requires: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    match marks[node] {
        Mark::Done => return None,
        Mark::OnPath => {
            let start = path.iter().position(|&n| n == node)?;
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::OnPath;
    path.push(node);
    for &dep in &requires[node] {
        if let Some(cycle) = visit(dep, requires, marks, path) {
            return Some(cycle);
        }
    }
    path.pop();
    marks[node] = Mark::Done;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        edges.iter()
            .map(|(name, deps)| {
                (
                    (*name).to_string(),
                    deps.iter().map(|d| (*d).to_string()).collect(),
                )
            })
            .collect()
    }

    fn resolve(edges: &[(&str, &[&str])]) -> Result<Vec<String>> {
        let nodes = graph(edges);
        resolve_order(nodes.iter().map(|(n, d)| (n.as_str(), d.as_slice())))
    }

    #[test]
    fn test_chain_resolves_in_any_registration_order() {
        let expected = vec!["P1", "P2", "P3"];
        let orders: [&[(&str, &[&str])]; 3] = [
            &[("P1", &[]), ("P2", &["P1"]), ("P3", &["P2"])],
            &[("P3", &["P2"]), ("P2", &["P1"]), ("P1", &[])],
            &[("P2", &["P1"]), ("P3", &["P2"]), ("P1", &[])],
        ];
        for edges in orders {
            assert_eq!(resolve(edges).unwrap(), expected);
        }
    }

    #[test]
    fn test_independent_plugins_keep_registration_order() {
        let order = resolve(&[("gamma", &[]), ("alpha", &[]), ("beta", &[])]).unwrap();
        assert_eq!(order, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn test_ties_broken_by_registration_index() {
        // "late" becomes ready after "data", but "early" was registered first
        let order = resolve(&[
            ("strategy", &["data"]),
            ("early", &[]),
            ("data", &[]),
            ("late", &[]),
        ])
        .unwrap();
        assert_eq!(order, vec!["early", "data", "strategy", "late"]);
    }

    #[test]
    fn test_diamond() {
        let order = resolve(&[
            ("report", &["risk", "strategy"]),
            ("strategy", &["data"]),
            ("risk", &["data"]),
            ("data", &[]),
        ])
        .unwrap();
        assert_eq!(order, vec!["data", "strategy", "risk", "report"]);
    }

    #[test]
    fn test_duplicate_dependencies_collapse() {
        let order = resolve(&[("strategy", &["data", "data"]), ("data", &[])]).unwrap();
        assert_eq!(order, vec!["data", "strategy"]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = resolve(&[("P1", &[]), ("P4", &["Px"])]).unwrap_err();
        match err {
            CoreError::MissingDependency { plugin, dependency } => {
                assert_eq!(plugin, "P4");
                assert_eq!(dependency, "Px");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_two_plugin_cycle() {
        let err = resolve(&[("P5", &["P6"]), ("P6", &["P5"])]).unwrap_err();
        match err {
            CoreError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["P5", "P6", "P5"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = resolve(&[("loner", &["loner"])]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::CyclicDependency { cycle } if cycle == vec!["loner", "loner"]
        ));
    }

    #[test]
    fn test_cycle_reported_without_bystanders() {
        let err = resolve(&[
            ("data", &[]),
            ("report", &["a"]),
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a", "data"]),
        ])
        .unwrap_err();
        match err {
            CoreError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_checked_before_cycles() {
        let err = resolve(&[("a", &["b"]), ("b", &["a"]), ("c", &["ghost"])]).unwrap_err();
        assert!(matches!(err, CoreError::MissingDependency { .. }));
    }

    #[test]
    fn test_empty_graph() {
        assert!(resolve(&[]).unwrap().is_empty());
    }
}
