// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DefaultIx, EdgeIndex, NodeIndex};
use petgraph::{Direction, Graph};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};

use crate::ir::{InstRef, MethodId, ProgramIr};

/// Unique identifiers for call graph nodes.
pub type CGNodeId = NodeIndex<DefaultIx>;
/// Unique identifiers for call graph edges.
pub type CGEdgeId = EdgeIndex<DefaultIx>;

#[derive(Debug)]
pub struct CallGraphNode {
    pub(crate) method: MethodId,
}

impl CallGraphNode {
    pub fn new(method: MethodId) -> Self {
        CallGraphNode { method }
    }
}

#[derive(Debug)]
pub struct CallGraphEdge {
    pub(crate) callsite: InstRef,
}

impl CallGraphEdge {
    pub fn new(callsite: InstRef) -> Self {
        CallGraphEdge { callsite }
    }
}

/// The graph of normal calls between methods with a body. Library calls
/// never appear here.
pub struct CallGraph {
    /// The graph structure capturing call relationships.
    pub graph: Graph<CallGraphNode, CallGraphEdge>,
    /// A map from methods to their corresponding call graph nodes.
    pub func_nodes: HashMap<MethodId, CGNodeId>,
    /// A map from call sites to call graph edges.
    pub callsite_to_edges: HashMap<InstRef, HashSet<CGEdgeId>>,
    /// Methods in the order they were reached.
    reach_funcs: Vec<MethodId>,
}

impl CallGraph {
    pub fn new() -> Self {
        CallGraph {
            graph: Graph::<CallGraphNode, CallGraphEdge>::new(),
            func_nodes: HashMap::new(),
            callsite_to_edges: HashMap::new(),
            reach_funcs: Vec::new(),
        }
    }

    /// Add a new node to the call graph.
    pub fn add_node(&mut self, method: MethodId) {
        self.get_or_insert_node(method);
    }

    /// Helper function to get a node or insert a new
    /// node if it does not exist in the map.
    fn get_or_insert_node(&mut self, method: MethodId) -> CGNodeId {
        match self.func_nodes.entry(method) {
            Entry::Occupied(o) => o.get().to_owned(),
            Entry::Vacant(v) => {
                self.reach_funcs.push(method);
                let node_id = self.graph.add_node(CallGraphNode::new(method));
                *v.insert(node_id)
            }
        }
    }

    pub fn contains(&self, method: MethodId) -> bool {
        self.func_nodes.contains_key(&method)
    }

    /// All methods called from `callsite`.
    pub fn get_callees(&self, callsite: &InstRef) -> HashSet<MethodId> {
        if let Some(edges) = self.callsite_to_edges.get(callsite) {
            edges
                .iter()
                .filter_map(|edge_id| self.graph.edge_endpoints(*edge_id))
                .map(|(_, target)| self.graph[target].method)
                .collect::<HashSet<MethodId>>()
        } else {
            HashSet::new()
        }
    }

    /// Returns true if an edge to the callee already exists for the callsite.
    pub fn has_edge(&self, callsite: &InstRef, callee: MethodId) -> bool {
        self.get_callees(callsite).contains(&callee)
    }

    /// Adds a call from `caller` to `callee` at `callsite`.
    /// Returns false if the edge already existed, and true otherwise.
    pub fn add_edge(&mut self, callsite: InstRef, caller: MethodId, callee: MethodId) -> bool {
        let caller_node = self.get_or_insert_node(caller);
        let callee_node = self.get_or_insert_node(callee);
        if self.has_edge(&callsite, callee) {
            return false;
        }
        let edge_id = self
            .graph
            .add_edge(caller_node, callee_node, CallGraphEdge::new(callsite));
        self.callsite_to_edges
            .entry(callsite)
            .or_default()
            .insert(edge_id);
        true
    }

    /// Methods directly called by `method`, in id order.
    pub fn callees_of(&self, method: MethodId) -> BTreeSet<MethodId> {
        match self.func_nodes.get(&method) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|n| self.graph[n].method)
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Methods directly calling `method`, in id order.
    pub fn callers_of(&self, method: MethodId) -> BTreeSet<MethodId> {
        match self.func_nodes.get(&method) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|n| self.graph[n].method)
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Return an iterator over the reached methods.
    pub fn reach_funcs_iter(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.reach_funcs.iter().copied()
    }

    pub fn num_methods(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    fn sorted_successors(&self, node: CGNodeId) -> Vec<CGNodeId> {
        let mut succs: Vec<CGNodeId> = self.graph.neighbors_directed(node, Direction::Outgoing).collect();
        succs.sort_by_key(|n| self.graph[*n].method);
        succs.dedup();
        succs
    }

    /// The strongly connected components reachable from `root`, callees
    /// before callers. Methods inside a component are sorted.
    ///
    /// Tarjan's algorithm with an explicit stack of frames, so deep call
    /// chains cannot overflow the native stack.
    pub fn scc_order(&self, root: MethodId) -> Vec<Vec<MethodId>> {
        let Some(&root_node) = self.func_nodes.get(&root) else {
            return Vec::new();
        };
        const UNVISITED: usize = usize::MAX;
        let num_nodes = self.graph.node_count();
        let mut index = vec![UNVISITED; num_nodes];
        let mut lowlink = vec![0; num_nodes];
        let mut on_stack = vec![false; num_nodes];
        let mut stack: Vec<CGNodeId> = Vec::new();
        let mut next_index = 0;
        let mut sccs = Vec::new();
        // (node, successors, position of the next successor to visit)
        let mut frames: Vec<(CGNodeId, Vec<CGNodeId>, usize)> = Vec::new();

        index[root_node.index()] = next_index;
        lowlink[root_node.index()] = next_index;
        next_index += 1;
        stack.push(root_node);
        on_stack[root_node.index()] = true;
        frames.push((root_node, self.sorted_successors(root_node), 0));

        while let Some(top) = frames.len().checked_sub(1) {
            let (node, child) = {
                let frame = &mut frames[top];
                let child = frame.1.get(frame.2).copied();
                frame.2 += 1;
                (frame.0, child)
            };
            match child {
                Some(child) if index[child.index()] == UNVISITED => {
                    index[child.index()] = next_index;
                    lowlink[child.index()] = next_index;
                    next_index += 1;
                    stack.push(child);
                    on_stack[child.index()] = true;
                    frames.push((child, self.sorted_successors(child), 0));
                }
                Some(child) => {
                    if on_stack[child.index()] {
                        lowlink[node.index()] = lowlink[node.index()].min(index[child.index()]);
                    }
                }
                None => {
                    frames.pop();
                    if let Some((parent, _, _)) = frames.last() {
                        let parent = parent.index();
                        lowlink[parent] = lowlink[parent].min(lowlink[node.index()]);
                    }
                    if lowlink[node.index()] == index[node.index()] {
                        let mut scc = Vec::new();
                        while let Some(member) = stack.pop() {
                            on_stack[member.index()] = false;
                            scc.push(self.graph[member].method);
                            if member == node {
                                break;
                            }
                        }
                        scc.sort();
                        sccs.push(scc);
                    }
                }
            }
        }
        sccs
    }

    /// Whether `method` calls itself directly or through its component.
    pub fn is_recursive(&self, scc: &[MethodId]) -> bool {
        scc.len() > 1 || scc.iter().any(|m| self.callees_of(*m).contains(m))
    }

    /// Produce a dot file representation of the call graph
    /// for displaying with Graphviz.
    pub fn to_dot(&self, ir: &dyn ProgramIr, dot_path: &Path) -> Result<()> {
        let output = format!(
            "{:?}",
            Dot::with_attr_getters(
                &self.graph,
                &[Config::NodeNoLabel, Config::EdgeNoLabel],
                &|_, edge| format!("label = \"{:?}\"", edge.weight().callsite.inst),
                &|_, (_, node)| format!("label = \"{}\"", ir.method_name(node.method).escape_default()),
            )
        );
        std::fs::write(dot_path, output)
            .with_context(|| format!("failed to write dot file {}", dot_path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::InstId;

    fn callsite(m: u32, i: u32) -> InstRef {
        InstRef::new(MethodId(m), InstId(i))
    }

    #[test]
    fn add_edge_test() {
        let mut cg = CallGraph::new();
        assert!(cg.add_edge(callsite(0, 1), MethodId(0), MethodId(1)));
        assert!(!cg.add_edge(callsite(0, 1), MethodId(0), MethodId(1)));
        assert!(cg.add_edge(callsite(0, 1), MethodId(0), MethodId(2)));
        assert_eq!(cg.get_callees(&callsite(0, 1)).len(), 2);
        assert_eq!(cg.reach_funcs_iter().collect::<Vec<_>>(), vec![MethodId(0), MethodId(1), MethodId(2)]);
        assert_eq!(cg.callers_of(MethodId(2)).into_iter().collect::<Vec<_>>(), vec![MethodId(0)]);
    }

    #[test]
    fn scc_order_test() {
        // 0 -> 1 -> 2 -> 1, 0 -> 3, 2 -> 4
        let mut cg = CallGraph::new();
        cg.add_edge(callsite(0, 0), MethodId(0), MethodId(1));
        cg.add_edge(callsite(1, 0), MethodId(1), MethodId(2));
        cg.add_edge(callsite(2, 0), MethodId(2), MethodId(1));
        cg.add_edge(callsite(0, 1), MethodId(0), MethodId(3));
        cg.add_edge(callsite(2, 1), MethodId(2), MethodId(4));
        cg.add_node(MethodId(5));
        let sccs = cg.scc_order(MethodId(0));
        assert_eq!(
            sccs,
            vec![
                vec![MethodId(4)],
                vec![MethodId(1), MethodId(2)],
                vec![MethodId(3)],
                vec![MethodId(0)],
            ]
        );
        assert!(cg.is_recursive(&sccs[1]));
        assert!(!cg.is_recursive(&sccs[0]));
    }

    #[test]
    fn self_recursion_test() {
        let mut cg = CallGraph::new();
        cg.add_edge(callsite(0, 0), MethodId(0), MethodId(0));
        let sccs = cg.scc_order(MethodId(0));
        assert_eq!(sccs, vec![vec![MethodId(0)]]);
        assert!(cg.is_recursive(&sccs[0]));
        assert!(cg.scc_order(MethodId(9)).is_empty());
    }
}
