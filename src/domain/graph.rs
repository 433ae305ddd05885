//! Task dependency graph.
//!
//! Dependencies form a general DAG, so the graph is an explicit adjacency
//! map (task id to the ids it depends on). All traversals are iterative.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Adjacency map from a task id to the ids it depends on.
///
/// Dependencies naming ids that are not nodes of the graph are allowed and
/// treated as leaves; that is how new tasks reference already persisted
/// ones.
///
/// # Examples
///
/// ```
/// use brain::domain::DependencyGraph;
///
/// let mut graph = DependencyGraph::new();
/// graph.add("a", [] as [&str; 0]);
/// graph.add("b", ["a"]);
/// graph.add("c", ["a"]);
/// graph.add("d", ["b", "c"]);
/// assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
///
/// graph.add("a", ["d"]);
/// assert!(graph.topological_order().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node with its dependency set.
    pub fn add<I, S>(&mut self, id: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges
            .insert(id.into(), dependencies.into_iter().map(Into::into).collect());
    }

    /// Returns `true` if `id` is a node.
    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .map(|(node, _)| node.as_str())
            .collect()
    }

    /// Returns `true` if `to` is reachable from `from` by following
    /// dependency edges. A node does not reach itself unless it sits on a
    /// cycle.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies_of(from).collect();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.dependencies_of(node));
            }
        }
        false
    }

    /// Orders nodes so every node comes after its in-graph dependencies
    /// (Kahn's algorithm, ties broken by id).
    ///
    /// # Errors
    ///
    /// Returns the ids that could not be ordered when the graph has a
    /// cycle: the cycle members plus anything downstream of them.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(self.edges.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (node, deps) in &self.edges {
            let in_graph = deps.iter().filter(|d| self.edges.contains_key(*d));
            let mut count = 0;
            for dep in in_graph {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
                count += 1;
            }
            pending.insert(node.as_str(), count);
        }

        let mut ready: VecDeque<&str> = self
            .edges
            .keys()
            .map(String::as_str)
            .filter(|n| pending.get(n) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            let mut unlocked = Vec::new();
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        unlocked.push(*dependent);
                    }
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if order.len() == self.edges.len() {
            Ok(order)
        } else {
            let ordered: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            Err(self
                .edges
                .keys()
                .filter(|n| !ordered.contains(n.as_str()))
                .cloned()
                .collect())
        }
    }
}
