// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency graphs and topological build ordering.

use std::collections::{HashMap, HashSet};

use crate::EngineError;

/// Adjacency map: module name to its direct dependencies.
pub type Graph = HashMap<String, Vec<String>>;

/// Sort a dependency graph into build groups.
///
/// Modules within a group have no dependency between them and may build in
/// parallel; groups are strictly ordered by dependency. Group order is
/// deterministic; order within a group is not significant but kept sorted
/// for stable output. A cycle fails the sort.
pub fn topological_sort(graph: &Graph) -> Result<Vec<Vec<String>>, EngineError> {
    let mut remaining: HashMap<&str, HashSet<&str>> = graph
        .iter()
        .map(|(name, deps)| {
            (
                name.as_str(),
                deps.iter()
                    .map(String::as_str)
                    // Dependencies outside the graph were already satisfied
                    // (they came from the controller schema).
                    .filter(|dep| graph.contains_key(*dep))
                    .collect(),
            )
        })
        .collect();

    let mut groups = Vec::new();
    while !remaining.is_empty() {
        let mut group: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.to_string())
            .collect();
        if group.is_empty() {
            let mut cycle: Vec<String> = remaining.keys().map(|s| s.to_string()).collect();
            cycle.sort();
            return Err(EngineError::DependencyCycle(cycle));
        }
        group.sort();
        for name in &group {
            remaining.remove(name.as_str());
        }
        for deps in remaining.values_mut() {
            for name in &group {
                deps.remove(name.as_str());
            }
        }
        groups.push(group);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Graph {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn linear_chain_sorts_into_singleton_groups() {
        let graph = graph(&[
            ("a", &["b"]),
            ("b", &["builtin"]),
            ("builtin", &[]),
        ]);
        let groups = topological_sort(&graph).unwrap();
        assert_eq!(
            groups,
            vec![vec!["builtin".to_string()], vec!["b".to_string()], vec!["a".to_string()]]
        );
    }

    #[test]
    fn independent_modules_share_a_group() {
        let graph = graph(&[
            ("a", &["builtin"]),
            ("b", &["builtin"]),
            ("c", &["a", "b"]),
            ("builtin", &[]),
        ]);
        let groups = topological_sort(&graph).unwrap();
        assert_eq!(
            groups,
            vec![
                vec!["builtin".to_string()],
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
            ]
        );
    }

    #[test]
    fn cycle_is_detected() {
        let graph = graph(&[("a", &["b"]), ("b", &["a"])]);
        match topological_sort(&graph) {
            Err(EngineError::DependencyCycle(members)) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn external_dependencies_are_ignored() {
        // "remote" is not in the graph: it was resolved from the controller.
        let graph = graph(&[("a", &["remote"])]);
        let groups = topological_sort(&graph).unwrap();
        assert_eq!(groups, vec![vec!["a".to_string()]]);
    }
}
