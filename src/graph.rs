//! Graph-level operations over assembled templates.
//!
//! Templates learn about their downstream peers as terminals are
//! connected; [`make_graph_executable`] walks that successor relation from
//! a root and flips every reachable template to executable.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;

/// The type-erased face of a task template, used for graph traversal.
pub trait TtNode: Send + Sync {
    fn node_name(&self) -> &str;
    fn make_executable(&self);
    fn is_executable(&self) -> bool;
    fn successors(&self) -> Vec<Weak<dyn TtNode>>;
    fn add_successor(&self, successor: Weak<dyn TtNode>);
}

/// Anything that can stand in for a template in graph operations.
pub trait AsTtNode {
    fn as_node(&self) -> Arc<dyn TtNode>;
}

impl AsTtNode for Arc<dyn TtNode> {
    fn as_node(&self) -> Arc<dyn TtNode> {
        self.clone()
    }
}

fn reachable(root: Arc<dyn TtNode>) -> Vec<Arc<dyn TtNode>> {
    let mut seen = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let ptr = Arc::as_ptr(&node) as *const u8;
        if seen
            .iter()
            .any(|n: &Arc<dyn TtNode>| std::ptr::eq(Arc::as_ptr(n) as *const u8, ptr))
        {
            continue;
        }
        for successor in node.successors() {
            if let Some(successor) = successor.upgrade() {
                stack.push(successor);
            }
        }
        seen.push(node);
    }
    seen
}

/// Flips every template reachable from `root` to executable.
///
/// Must be called on every rank after the graph is fully wired and before
/// any task is injected. Returns `true` once the reachable set is
/// executable.
pub fn make_graph_executable(root: &dyn AsTtNode) -> bool {
    for node in reachable(root.as_node()) {
        if !node.is_executable() {
            node.make_executable();
        }
    }
    true
}

/// Renders the graph reachable from `root` in Graphviz dot format.
pub fn graph_dot(root: &dyn AsTtNode) -> String {
    let nodes = reachable(root.as_node());
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut indices = HashMap::new();
    for node in &nodes {
        let idx = graph.add_node(node.node_name().to_string());
        indices.insert(Arc::as_ptr(node) as *const u8 as usize, idx);
    }
    for node in &nodes {
        let from = indices[&(Arc::as_ptr(node) as *const u8 as usize)];
        for successor in node.successors() {
            if let Some(successor) = successor.upgrade() {
                if let Some(&to) = indices.get(&(Arc::as_ptr(&successor) as *const u8 as usize)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }
    format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}
