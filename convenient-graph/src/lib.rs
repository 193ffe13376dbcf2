//! Directed acyclic graph with typed edges for build ordering.
//!
//! The graph rejects any edge that would close a cycle at insertion time, so
//! a `DAG` value is acyclic by construction. Callers that need to treat some
//! cyclic relations differently (for example test-only dependencies) can try
//! to insert the edge and fall back to another strategy on
//! [`GraphError::CycleDetected`].
//!
//! All orderings produced by this crate are deterministic: ties are broken by
//! insertion order of the nodes.
//!
//! # Example
//!
//! ```
//! use convenient_graph::DAG;
//!
//! let mut dag = DAG::<&str, &str>::new();
//! let lib = dag.add_node("devel/lib");
//! let app = dag.add_node("www/app");
//!
//! // lib must be built before app
//! dag.add_edge(lib, app, "build").unwrap();
//!
//! assert_eq!(dag.topological_sort(), vec![lib, app]);
//! assert_eq!(dag.layers(), vec![vec![lib], vec![app]]);
//! assert!(dag.add_edge(app, lib, "run").is_err());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::fmt;

/// Node identifier in the DAG. Identifiers are dense and follow insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in insertion order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Error types for DAG operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Adding the edge would have closed a cycle. The path runs from the
    /// edge target back to the edge source, so `path` followed by the
    /// rejected edge is the full cycle.
    #[error("Cycle detected: edge {from} -> {to} closes a cycle")]
    CycleDetected {
        /// Source of the rejected edge
        from: NodeId,
        /// Target of the rejected edge
        to: NodeId,
        /// Existing path from `to` back to `from`
        path: Vec<NodeId>,
    },

    /// Node not found
    #[error("Node {0} not found in graph")]
    NodeNotFound(NodeId),
}

/// Result type for DAG operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone)]
struct Node<N, E> {
    data: N,
    // from -> this
    incoming: BTreeSet<NodeId>,
    // this -> to
    outgoing: BTreeSet<NodeId>,
    // edge payloads keyed by source, in insertion order
    edge_data: Vec<(NodeId, E)>,
}

/// Directed acyclic graph where an edge `from -> to` means `from` must
/// complete before `to`.
#[derive(Debug, Clone)]
pub struct DAG<N, E> {
    nodes: Vec<Node<N, E>>,
    edge_count: usize,
}

impl<N, E> Default for DAG<N, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N, E> DAG<N, E> {
    /// Create a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edge_count: 0,
        }
    }

    /// Add a node to the graph and return its ID.
    pub fn add_node(&mut self, data: N) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            edge_data: Vec::new(),
        });
        id
    }

    fn get(&self, id: NodeId) -> GraphResult<&Node<N, E>> {
        self.nodes.get(id.0).ok_or(GraphError::NodeNotFound(id))
    }

    /// Add a directed edge: `from` must be processed before `to`.
    ///
    /// Several edges between the same pair of nodes are allowed; each keeps
    /// its own payload but they count as one precedence constraint.
    ///
    /// # Errors
    ///
    /// - `GraphError::NodeNotFound` if either node doesn't exist
    /// - `GraphError::CycleDetected` if the edge would close a cycle; the
    ///   graph is left unchanged
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, data: E) -> GraphResult<()> {
        let _ = self.get(from)?;
        let _ = self.get(to)?;

        if let Some(path) = self.path(to, from) {
            return Err(GraphError::CycleDetected { from, to, path });
        }

        let _ = self.nodes[from.0].outgoing.insert(to);
        let target = &mut self.nodes[to.0];
        let _ = target.incoming.insert(from);
        target.edge_data.push((from, data));
        self.edge_count += 1;
        Ok(())
    }

    /// Shortest path from `start` to `end` following edge direction, both
    /// ends included. A node always reaches itself.
    #[must_use]
    pub fn path(&self, start: NodeId, end: NodeId) -> Option<Vec<NodeId>> {
        if start.0 >= self.nodes.len() || end.0 >= self.nodes.len() {
            return None;
        }
        if start == end {
            return Some(vec![start]);
        }

        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for &next in &self.nodes[current.0].outgoing {
                if next == start || parent.contains_key(&next) {
                    continue;
                }
                let _ = parent.insert(next, current);
                if next == end {
                    let mut path = vec![end];
                    let mut cursor = end;
                    while let Some(&prev) = parent.get(&cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }

        None
    }

    /// Whether `end` is reachable from `start`.
    #[must_use]
    pub fn can_reach(&self, start: NodeId, end: NodeId) -> bool {
        self.path(start, end).is_some()
    }

    /// Get a reference to a node's data.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn node(&self, id: NodeId) -> GraphResult<&N> {
        self.get(id).map(|node| &node.data)
    }

    /// Get a mutable reference to a node's data.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut N> {
        self.nodes
            .get_mut(id.0)
            .map(|node| &mut node.data)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// All node IDs in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges, counting parallel edges separately.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Direct predecessors of a node, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependencies(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.get(id).map(|node| node.incoming.iter().copied().collect())
    }

    /// Direct successors of a node, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependents(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.get(id).map(|node| node.outgoing.iter().copied().collect())
    }

    /// Incoming edges of a node with their payloads.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn incoming_edges(&self, id: NodeId) -> GraphResult<&[(NodeId, E)]> {
        self.get(id).map(|node| node.edge_data.as_slice())
    }

    /// Number of nodes reachable from `id`, excluding `id` itself.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn transitive_dependent_count(&self, id: NodeId) -> GraphResult<usize> {
        let _ = self.get(id)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &next in &self.nodes[current.0].outgoing {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        Ok(seen.len())
    }

    /// Topological order using Kahn's algorithm. Among nodes that are ready
    /// at the same time, the one inserted first comes first.
    #[must_use]
    pub fn topological_sort(&self) -> Vec<NodeId> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.incoming.len()).collect();
        let mut ready: BinaryHeap<Reverse<NodeId>> = self
            .node_ids()
            .filter(|id| in_degree[id.0] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &next in &self.nodes[id.0].outgoing {
                in_degree[next.0] -= 1;
                if in_degree[next.0] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        order
    }

    /// Group nodes into layers: layer 0 has no predecessors, layer `k` holds
    /// nodes whose longest path from a root has length `k`.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for id in self.topological_sort() {
            for &next in &self.nodes[id.0].outgoing {
                depth[next.0] = depth[next.0].max(depth[id.0] + 1);
            }
        }

        let mut layers: Vec<Vec<NodeId>> = Vec::new();
        for id in self.node_ids() {
            let level = depth[id.0];
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(id);
        }
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&'static str]) -> (DAG<&'static str, ()>, Vec<NodeId>) {
        let mut dag = DAG::new();
        let ids: Vec<_> = names.iter().map(|n| dag.add_node(*n)).collect();
        for pair in ids.windows(2) {
            dag.add_edge(pair[0], pair[1], ()).unwrap();
        }
        (dag, ids)
    }

    #[test]
    fn test_create_empty_dag() {
        let dag = DAG::<String, ()>::new();
        assert_eq!(dag.node_count(), 0);
        assert_eq!(dag.edge_count(), 0);
        assert!(dag.topological_sort().is_empty());
        assert!(dag.layers().is_empty());
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let (mut dag, ids) = chain(&["a", "b", "c"]);

        match dag.add_edge(ids[2], ids[0], ()) {
            Err(GraphError::CycleDetected { from, to, path }) => {
                assert_eq!(from, ids[2]);
                assert_eq!(to, ids[0]);
                assert_eq!(path, ids);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        // graph unchanged
        assert_eq!(dag.edge_count(), 2);
        assert!(dag.dependents(ids[2]).unwrap().is_empty());
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        assert!(matches!(
            dag.add_edge(a, a, ()),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_node() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let ghost = NodeId(7);
        assert!(matches!(
            dag.add_edge(a, ghost, ()),
            Err(GraphError::NodeNotFound(id)) if id == ghost
        ));
        assert!(dag.node(ghost).is_err());
    }

    #[test]
    fn test_topological_sort_is_stable() {
        let mut dag = DAG::<&str, ()>::new();
        let c = dag.add_node("c");
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        dag.add_edge(b, c, ()).unwrap();

        // a and b are both roots; insertion order decides
        assert_eq!(dag.topological_sort(), vec![a, b, c]);
    }

    #[test]
    fn test_layers() {
        let mut dag = DAG::<&str, ()>::new();
        let root = dag.add_node("root");
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");
        dag.add_edge(root, a, ()).unwrap();
        dag.add_edge(root, b, ()).unwrap();
        dag.add_edge(a, c, ()).unwrap();
        dag.add_edge(root, c, ()).unwrap();

        assert_eq!(dag.layers(), vec![vec![root], vec![a, b], vec![c]]);
    }

    #[test]
    fn test_parallel_edges_keep_payloads() {
        let mut dag = DAG::<&str, &str>::new();
        let lib = dag.add_node("lib");
        let app = dag.add_node("app");
        dag.add_edge(lib, app, "build").unwrap();
        dag.add_edge(lib, app, "run").unwrap();

        assert_eq!(dag.edge_count(), 2);
        assert_eq!(dag.dependencies(app).unwrap(), vec![lib]);
        let kinds: Vec<_> = dag
            .incoming_edges(app)
            .unwrap()
            .iter()
            .map(|(_, k)| *k)
            .collect();
        assert_eq!(kinds, vec!["build", "run"]);
        assert_eq!(dag.topological_sort(), vec![lib, app]);
    }

    #[test]
    fn test_transitive_dependents() {
        let (mut dag, ids) = chain(&["a", "b", "c"]);
        let d = dag.add_node("d");
        dag.add_edge(ids[0], d, ()).unwrap();

        assert_eq!(dag.transitive_dependent_count(ids[0]).unwrap(), 3);
        assert_eq!(dag.transitive_dependent_count(ids[1]).unwrap(), 1);
        assert_eq!(dag.transitive_dependent_count(d).unwrap(), 0);
    }

    #[test]
    fn test_reachability() {
        let (dag, ids) = chain(&["a", "b", "c"]);
        assert!(dag.can_reach(ids[0], ids[2]));
        assert!(!dag.can_reach(ids[2], ids[0]));
        assert_eq!(dag.path(ids[1], ids[1]), Some(vec![ids[1]]));
    }
}
