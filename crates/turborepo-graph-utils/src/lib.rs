//! Additional utilities to be used with `petgraph`: cycle detection that
//! reports the offending path, transitive closure, and a concurrent
//! dependency-ordered graph walker.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, DfsEvent, Reversed},
};
use thiserror::Error;

pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n\t{cycle_path}")]
    CyclicDependencies { cycle_path: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

pub fn transitive_closure<N: Hash + Eq + PartialEq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Validates that the graph is a DAG. Rejects self edges, and on the first
/// back edge found reports the cycle it closes, path included.
pub fn validate_graph<N: Display + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    if let Some(cycle) = find_cycle(graph) {
        let cycle_path = cycle
            .into_iter()
            .map(|index| {
                graph
                    .node_weight(index)
                    .expect("cycle nodes come from iterating the graph")
            })
            .join(" -> ");
        return Err(Error::CyclicDependencies { cycle_path });
    }

    Ok(())
}

// Iterative DFS keeping an explicit path stack so the cycle closed by the
// first back edge can be reconstructed.
fn find_cycle<N>(graph: &Graph<N, ()>) -> Option<Vec<NodeIndex>> {
    let mut finished = HashSet::new();

    for start in graph.node_indices() {
        if finished.contains(&start) {
            continue;
        }
        let mut path: Vec<(NodeIndex, petgraph::graph::Neighbors<'_, ()>)> = Vec::new();
        let mut on_path = HashSet::new();
        path.push((start, graph.neighbors(start)));
        on_path.insert(start);

        while let Some((node, neighbors)) = path.last_mut() {
            let node = *node;
            match neighbors.next() {
                Some(next) if on_path.contains(&next) => {
                    // Back edge: the cycle is the path suffix from `next`,
                    // closed by `next` itself.
                    let position = path
                        .iter()
                        .position(|(n, _)| *n == next)
                        .expect("node on path is in the path stack");
                    let mut cycle: Vec<_> = path[position..].iter().map(|(n, _)| *n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(next) if !finished.contains(&next) => {
                    on_path.insert(next);
                    path.push((next, graph.neighbors(next)));
                }
                Some(_) => {}
                None => {
                    finished.insert(node);
                    on_path.remove(&node);
                    path.pop();
                }
            }
        }
    }

    None
}
