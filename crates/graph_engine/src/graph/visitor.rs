//! Read-only traversal of a frozen graph

use super::{Link, Node};

/// Visitor over every node and link of a graph.
///
/// [`super::Graph::accept`] drives the traversal under the graph's read
/// lock: nodes first, then links, in unspecified order.
pub trait GraphVisitor {
    /// Called for every node
    fn visit_node(&mut self, node: &Node) {
        let _ = node;
    }

    /// Called for every link
    fn visit_link(&mut self, link: &Link) {
        let _ = link;
    }
}
