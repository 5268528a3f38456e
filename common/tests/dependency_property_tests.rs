// Property-based tests for dependency graph validation

use common::dependency::DependencyGraph;
use common::errors::ValidationError;
use common::models::JobId;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

fn id(n: usize) -> JobId {
    Uuid::from_u128(n as u128 + 1)
}

fn graph_from(edges: &HashMap<usize, Vec<usize>>) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for (node, deps) in edges {
        graph.set_dependencies(id(*node), deps.iter().map(|d| id(*d)).collect());
    }
    graph
}

/// Breadth-first reachability, independent of the validator's traversal
fn reaches(edges: &HashMap<usize, Vec<usize>>, from: &[usize], target: usize) -> bool {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<usize> = from.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        if node == target {
            return true;
        }
        if seen.insert(node) {
            if let Some(next) = edges.get(&node) {
                queue.extend(next.iter().copied());
            }
        }
    }
    false
}

fn arbitrary_edges(max_nodes: usize) -> impl Strategy<Value = (usize, HashMap<usize, Vec<usize>>)> {
    (2..max_nodes).prop_flat_map(|n| {
        let lists = prop::collection::vec(prop::collection::vec(0..n, 0..4), n);
        (Just(n), lists).prop_map(|(n, lists)| {
            let edges = lists
                .into_iter()
                .enumerate()
                .map(|(node, mut deps)| {
                    deps.sort();
                    deps.dedup();
                    (node, deps)
                })
                .collect();
            (n, edges)
        })
    })
}

/// Dependency lists that only point at lower indices never form a cycle,
/// so every node validates and no cycle exists anywhere.
#[test]
fn property_forward_only_graphs_are_acyclic() {
    proptest!(|(
        lists in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..25)
    )| {
        let mut edges = HashMap::new();
        for (node, picks) in lists.iter().enumerate() {
            let deps: Vec<usize> = if node == 0 {
                Vec::new()
            } else {
                let mut deps: Vec<usize> = picks.iter().map(|p| p.index(node)).collect();
                deps.sort();
                deps.dedup();
                deps
            };
            edges.insert(node, deps);
        }

        let graph = graph_from(&edges);
        prop_assert!(graph.find_any_cycle().is_none());
        for (node, deps) in &edges {
            let proposed: Vec<JobId> = deps.iter().map(|d| id(*d)).collect();
            prop_assert!(graph.validate(id(*node), &proposed).is_ok());
        }
    });
}

/// The validator rejects a proposal exactly when the candidate is reachable
/// from one of its proposed dependencies, and the reported path is a real
/// cycle through the candidate's new edges.
#[test]
fn property_validator_agrees_with_reachability() {
    proptest!(|(
        (n, edges) in arbitrary_edges(12),
        candidate_pick in any::<prop::sample::Index>(),
        proposed_picks in prop::collection::vec(any::<prop::sample::Index>(), 0..4)
    )| {
        // Start from a graph without cycles among the other nodes
        let candidate = candidate_pick.index(n);
        let mut base: HashMap<usize, Vec<usize>> = HashMap::new();
        for (node, deps) in &edges {
            base.insert(*node, deps.iter().copied().filter(|d| d < node).collect());
        }
        let mut proposed: Vec<usize> = proposed_picks.iter().map(|p| p.index(n)).collect();
        proposed.sort();
        proposed.dedup();

        let graph = graph_from(&base);
        let proposed_ids: Vec<JobId> = proposed.iter().map(|p| id(*p)).collect();
        let result = graph.validate(id(candidate), &proposed_ids);

        let mut view = base.clone();
        view.insert(candidate, proposed.clone());
        let cyclic = reaches(&view, &proposed, candidate);

        match result {
            Ok(()) => prop_assert!(!cyclic),
            Err(ValidationError::CyclicDependency { path }) => {
                prop_assert!(cyclic);
                prop_assert!(path.len() >= 2);
                prop_assert_eq!(path.first(), path.last());
                let index: HashMap<JobId, usize> = (0..n).map(|i| (id(i), i)).collect();
                for pair in path.windows(2) {
                    let from = index[&pair[0]];
                    let to = index[&pair[1]];
                    prop_assert!(view[&from].contains(&to), "{} -> {} is not an edge", from, to);
                }
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    });
}

/// Unknown ids are reported before any traversal, even alongside a cycle
#[test]
fn property_unknown_dependency_reported_first() {
    proptest!(|((n, edges) in arbitrary_edges(10), ghost in 1000u128..2000u128)| {
        let graph = graph_from(&edges);
        let candidate = id(0);
        let ghost = Uuid::from_u128(ghost);
        let proposed: Vec<JobId> = vec![id(n - 1), candidate, ghost];

        let err = graph.validate(candidate, &proposed).unwrap_err();
        prop_assert_eq!(
            err,
            ValidationError::UnknownDependency { job_id: candidate, dependency_id: ghost }
        );
    });
}

#[test]
fn test_self_reference_path() {
    let graph = DependencyGraph::new();
    let c = id(7);
    assert_eq!(
        graph.validate(c, &[c]).unwrap_err(),
        ValidationError::CyclicDependency { path: vec![c, c] }
    );
}
