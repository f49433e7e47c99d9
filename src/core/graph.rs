//! Dependency graph construction.
//!
//! Edges come from `after`/`before` constraints and from deferred
//! `{{output.<reference>.<key>}}` placeholders. The order is Kahn's
//! algorithm with a min-heap on declaration sequence, so independent
//! resources keep their declaration order and the result is deterministic.

use super::declare::{Declarations, Resource};
use super::error::{Error, Result};
use super::resolver;
use super::types::ResourceKind;
use crate::tripwire::hasher::composite_hash;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

/// Resources in a valid convergence order, with their edges.
///
/// Positions are indices into [`Graph::resources`]; every predecessor of a
/// resource sits at a lower position.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Resource>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resources in convergence order.
    pub fn resources(&self) -> &[Resource] {
        &self.nodes
    }

    pub fn resource(&self, pos: usize) -> &Resource {
        &self.nodes[pos]
    }

    /// Positions of the resources that must converge before `pos`.
    pub fn predecessors(&self, pos: usize) -> &[usize] {
        &self.predecessors[pos]
    }

    /// Positions of the resources waiting on `pos`.
    pub fn successors(&self, pos: usize) -> &[usize] {
        &self.successors[pos]
    }

    /// Position of a resource by alias or canonical reference.
    pub fn position_of(&self, reference: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|r| r.names().any(|n| n == reference))
    }

    /// Canonical references in convergence order.
    pub fn order(&self) -> Vec<&str> {
        self.nodes.iter().map(Resource::reference).collect()
    }

    /// Whether `to` is transitively downstream of `from`.
    pub fn reachable(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        while let Some(pos) = queue.pop_front() {
            for &next in &self.successors[pos] {
                if next == to {
                    return true;
                }
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Kinds present in the graph.
    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.nodes.iter().map(Resource::kind).collect()
    }

    /// BLAKE3 over the ordered references and edges.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.nodes.len() * 2);
        for (pos, r) in self.nodes.iter().enumerate() {
            parts.push(r.reference().to_string());
            let preds: Vec<String> = self.predecessors[pos]
                .iter()
                .map(|p| p.to_string())
                .collect();
            parts.push(preds.join(","));
        }
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        composite_hash(&refs)
    }
}

/// Build the dependency graph of a declaration set.
///
/// Fails with [`Error::UnknownDependency`] when a constraint or output
/// placeholder names an undeclared resource, and with
/// [`Error::CyclicDependency`] when no topological order exists.
pub fn build_graph(decls: &Declarations) -> Result<Graph> {
    let n = decls.len();
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];

    for (i, resource) in decls.iter().enumerate() {
        let lookup = |reference: &str| {
            decls
                .index_of(reference)
                .ok_or_else(|| Error::UnknownDependency {
                    resource: resource.label().to_string(),
                    reference: reference.to_string(),
                })
        };

        let mut add = |from: usize, to: usize| -> Result<()> {
            if from == to {
                let label = resource.label().to_string();
                return Err(Error::CyclicDependency {
                    cycle: vec![label.clone(), label],
                });
            }
            edges[from].insert(to);
            Ok(())
        };

        for dep in &resource.constraints().after {
            add(lookup(dep)?, i)?;
        }
        for dep in &resource.constraints().before {
            add(i, lookup(dep)?)?;
        }
        for dep in resolver::output_refs(resource.attributes())? {
            add(lookup(&dep)?, i)?;
        }
    }

    let mut in_degree = vec![0usize; n];
    for targets in &edges {
        for &to in targets {
            in_degree[to] += 1;
        }
    }

    let mut heap: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(i)) = heap.pop() {
        order.push(i);
        for &to in &edges[i] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                heap.push(Reverse(to));
            }
        }
    }

    if order.len() < n {
        return Err(Error::CyclicDependency {
            cycle: find_cycle(decls, &edges, &in_degree),
        });
    }

    let mut position = vec![0usize; n];
    for (pos, &seq) in order.iter().enumerate() {
        position[seq] = pos;
    }

    let mut predecessors = vec![Vec::new(); n];
    let mut successors = vec![Vec::new(); n];
    for (from, targets) in edges.iter().enumerate() {
        for &to in targets {
            successors[position[from]].push(position[to]);
            predecessors[position[to]].push(position[from]);
        }
    }
    for list in predecessors.iter_mut().chain(successors.iter_mut()) {
        list.sort_unstable();
    }

    let nodes = order
        .iter()
        .filter_map(|&seq| decls.get(seq).cloned())
        .collect();

    Ok(Graph {
        nodes,
        predecessors,
        successors,
    })
}

/// Name one cycle among the nodes Kahn's algorithm could not order.
///
/// Every leftover node still has a leftover predecessor, so walking
/// predecessors from the earliest leftover node must revisit a node.
fn find_cycle(decls: &Declarations, edges: &[BTreeSet<usize>], in_degree: &[usize]) -> Vec<String> {
    let n = edges.len();
    let stuck: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (from, targets) in edges.iter().enumerate() {
        if !stuck[from] {
            continue;
        }
        for &to in targets {
            if stuck[to] {
                preds[to].push(from);
            }
        }
    }

    let Some(start) = (0..n).find(|&i| stuck[i]) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut visited_at: Vec<Option<usize>> = vec![None; n];
    let mut cur = start;
    loop {
        if let Some(at) = visited_at[cur] {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            if let Some(&first) = cycle.first() {
                cycle.push(first);
            }
            return cycle
                .into_iter()
                .filter_map(|i| decls.get(i).map(|r| r.label().to_string()))
                .collect();
        }
        visited_at[cur] = Some(path.len());
        path.push(cur);
        match preds[cur].first() {
            Some(&p) => cur = p,
            None => return Vec::new(),
        }
    }
}
