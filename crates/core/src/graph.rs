use crate::error::GraphError;
use crate::types::NodeId;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Directed graph of service nodes and their data dependencies.
///
/// Node indices are handed out in insertion order, so ordering by index is
/// ordering by registration. Every query that returns several nodes uses that
/// order, which makes topological sorting and predecessor merging
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    graph: StableDiGraph<NodeId, ()>,
    node_indices: HashMap<NodeId, NodeIndex>,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node if it is absent. Returns `true` when the node was inserted.
    pub fn add_node(&mut self, id: impl Into<NodeId>) -> bool {
        let id = id.into();
        if self.node_indices.contains_key(&id) {
            return false;
        }

        let index = self.graph.add_node(id.clone());
        self.node_indices.insert(id, index);
        true
    }

    /// Record that the output of `from` is an input of `to`.
    ///
    /// Both nodes must already exist. Adding an edge that is already present
    /// leaves the graph unchanged.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<(), GraphError> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;

        if !self.graph.contains_edge(from_idx, to_idx) {
            self.graph.add_edge(from_idx, to_idx, ());
        }

        Ok(())
    }

    /// Order all nodes so that every edge points forward (Kahn's algorithm).
    ///
    /// Among nodes that are ready at the same time, the earliest registered
    /// one is emitted first.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| Reverse(*node))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);

            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(succ));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let placed: HashSet<NodeIndex> = order.iter().copied().collect();
            let nodes = self
                .graph
                .node_indices()
                .filter(|n| !placed.contains(n))
                .map(|n| self.graph[n].clone())
                .collect();
            return Err(GraphError::CycleDetected { nodes });
        }

        Ok(order.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Nodes with no incoming edges; they receive the pipeline's initial input.
    pub fn sources(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Nodes with no outgoing edges; their output is the pipeline's result.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Outgoing)
    }

    /// Direct in-neighbours of a node, in registration order.
    pub fn predecessors(&self, id: &NodeId) -> Result<Vec<NodeId>, GraphError> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct out-neighbours of a node, in registration order.
    pub fn successors(&self, id: &NodeId) -> Result<Vec<NodeId>, GraphError> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn is_source(&self, id: &NodeId) -> Result<bool, GraphError> {
        let index = self.index_of(id)?;
        Ok(self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .next()
            .is_none())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node_indices.contains_key(id)
    }

    pub fn contains_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.node_indices.get(from), self.node_indices.get(to)) {
            (Some(from), Some(to)) => self.graph.contains_edge(*from, *to),
            _ => false,
        }
    }

    /// All nodes in registration order
    pub fn nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn index_of(&self, id: &NodeId) -> Result<NodeIndex, GraphError> {
        self.node_indices
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Result<Vec<NodeId>, GraphError> {
        let index = self.index_of(id)?;

        // petgraph yields neighbours newest-edge first
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort();

        Ok(neighbors
            .into_iter()
            .map(|n| self.graph[n].clone())
            .collect())
    }

    fn nodes_without(&self, direction: Direction) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.neighbors_directed(n, direction).next().is_none())
            .map(|n| self.graph[n].clone())
            .collect()
    }
}
