//! The render graph: arena storage with staged mutation

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};

use ash::vk;
use slotmap::{new_key_type, SecondaryMap, SlotMap};

use crate::error::{EngineError, EngineResult};
use crate::synchronization::{sync_groups, SyncObjectSpec};
use crate::topic_log;

use crate::debug::RenderGraphBuilderTopic;

use super::{GraphVisitor, Link, LinkType, Node};

new_key_type! {
    struct NodeKey;
    struct LinkKey;
}

#[derive(Default)]
struct GraphRepresentation {
    nodes: SlotMap<NodeKey, Node>,
    node_names: HashMap<String, NodeKey>,
    links: SlotMap<LinkKey, Link>,
    in_edges: SecondaryMap<NodeKey, Vec<LinkKey>>,
    out_edges: SecondaryMap<NodeKey, Vec<LinkKey>>,
}

impl GraphRepresentation {
    fn add_node(&mut self, node: Node) -> EngineResult<()> {
        if self.node_names.contains_key(node.name()) {
            return Err(EngineError::GraphConstruction {
                reason: format!("duplicate node name '{}'", node.name()),
            });
        }
        let name = node.name().to_string();
        let key = self.nodes.insert(node);
        self.node_names.insert(name, key);
        self.in_edges.insert(key, Vec::new());
        self.out_edges.insert(key, Vec::new());
        Ok(())
    }

    fn add_edge(&mut self, link: Link) -> EngineResult<()> {
        let from = self.key_of(link.from_node())?;
        let to = self.key_of(link.to_node())?;
        let key = self.links.insert(link);
        self.out_edges[from].push(key);
        self.in_edges[to].push(key);
        Ok(())
    }

    fn remove_node(&mut self, name: &str) -> EngineResult<()> {
        let key = self.key_of(name)?;
        let incident: Vec<LinkKey> = self
            .in_edges
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .chain(self.out_edges.remove(key).unwrap_or_default())
            .collect();
        for link_key in incident {
            self.detach_link(link_key);
        }
        self.nodes.remove(key);
        self.node_names.remove(name);
        Ok(())
    }

    fn remove_edge(&mut self, from: &str, to: &str) -> EngineResult<()> {
        let from_key = self.key_of(from)?;
        let link_key = self.out_edges[from_key]
            .iter()
            .copied()
            .find(|key| self.links[*key].to_node() == to)
            .ok_or_else(|| EngineError::GraphConstruction {
                reason: format!("no edge from '{from}' to '{to}'"),
            })?;
        self.detach_link(link_key);
        Ok(())
    }

    fn detach_link(&mut self, link_key: LinkKey) {
        if let Some(link) = self.links.remove(link_key) {
            if let Some(&from) = self.node_names.get(link.from_node()) {
                if let Some(edges) = self.out_edges.get_mut(from) {
                    edges.retain(|key| *key != link_key);
                }
            }
            if let Some(&to) = self.node_names.get(link.to_node()) {
                if let Some(edges) = self.in_edges.get_mut(to) {
                    edges.retain(|key| *key != link_key);
                }
            }
        }
    }

    fn key_of(&self, name: &str) -> EngineResult<NodeKey> {
        self.node_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::GraphConstruction {
                reason: format!("unknown node '{name}'"),
            })
    }

    fn neighbors(
        &self,
        name: &str,
        incoming: bool,
        accepted: Option<LinkType>,
    ) -> Vec<String> {
        let Ok(key) = self.key_of(name) else {
            return Vec::new();
        };
        let edges = if incoming {
            self.in_edges.get(key)
        } else {
            self.out_edges.get(key)
        };
        edges
            .into_iter()
            .flatten()
            .filter_map(|link_key| self.links.get(*link_key))
            .filter(|link| accepted.map_or(true, |filter| link.link_type() == filter))
            .map(|link| {
                if incoming {
                    link.from_node().to_string()
                } else {
                    link.to_node().to_string()
                }
            })
            .collect()
    }
}

enum StagedCommand {
    AddNode(Node),
    AddEdge(Link),
    RemoveNode(String),
    RemoveEdge { from: String, to: String },
}

#[derive(Default)]
struct StagingArea {
    add_nodes: Vec<Node>,
    add_edges: Vec<Link>,
    remove_nodes: Vec<String>,
    remove_edges: Vec<(String, String)>,
}

impl StagingArea {
    fn is_empty(&self) -> bool {
        self.add_nodes.is_empty()
            && self.add_edges.is_empty()
            && self.remove_nodes.is_empty()
            && self.remove_edges.is_empty()
    }
}

/// DAG of named nodes and typed links with staged mutation.
///
/// `add_*`/`remove_*` only buffer commands; the live representation changes
/// atomically in [`apply_changes`](Self::apply_changes), taken under the
/// write lock. Queries read the live representation under the shared lock,
/// so builders can stage edits against a graph referenced by running
/// executions without torn state.
pub struct Graph {
    name: String,
    representation: RwLock<GraphRepresentation>,
    staging: Mutex<StagingArea>,
}

impl Graph {
    /// Empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            representation: RwLock::new(GraphRepresentation::default()),
            staging: Mutex::new(StagingArea::default()),
        }
    }

    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage a node addition.
    ///
    /// Duplicate names are rejected immediately, against both the live graph
    /// and earlier staged additions.
    pub fn add_node(&self, node: Node) -> EngineResult<()> {
        // Lock order everywhere: staging area first, representation second.
        let mut staging = self.lock_staging();
        let representation = self.read();
        let exists_live = representation.node_names.contains_key(node.name());
        let exists_staged = staging
            .add_nodes
            .iter()
            .any(|staged| staged.name() == node.name());
        if exists_live || exists_staged {
            return Err(EngineError::GraphConstruction {
                reason: format!("duplicate node name '{}'", node.name()),
            });
        }
        topic_log!(RenderGraphBuilderTopic, "staged node '{}'", node.name());
        staging.add_nodes.push(node);
        Ok(())
    }

    /// Stage an edge addition.
    ///
    /// Both endpoints must exist, either live or among staged additions.
    pub fn add_edge(&self, link: Link) -> EngineResult<()> {
        let mut staging = self.lock_staging();
        let representation = self.read();
        for endpoint in [link.from_node(), link.to_node()] {
            let exists_live = representation.node_names.contains_key(endpoint);
            let exists_staged = staging.add_nodes.iter().any(|node| node.name() == endpoint);
            if !exists_live && !exists_staged {
                return Err(EngineError::GraphConstruction {
                    reason: format!("edge endpoint '{endpoint}' does not exist"),
                });
            }
        }
        topic_log!(
            RenderGraphBuilderTopic,
            "staged edge '{}' -> '{}'",
            link.from_node(),
            link.to_node()
        );
        staging.add_edges.push(link);
        Ok(())
    }

    /// Stage a node removal
    pub fn remove_node(&self, name: impl Into<String>) {
        self.lock_staging().remove_nodes.push(name.into());
    }

    /// Stage an edge removal
    pub fn remove_edge(&self, from: impl Into<String>, to: impl Into<String>) {
        self.lock_staging()
            .remove_edges
            .push((from.into(), to.into()));
    }

    /// Drain the staging area into the live representation.
    ///
    /// Commands apply in the order remove-edges, remove-nodes, add-nodes,
    /// add-edges. With an empty staging area this is a no-op.
    pub fn apply_changes(&self) -> EngineResult<()> {
        let commands: Vec<StagedCommand> = {
            let mut staging = self.lock_staging();
            if staging.is_empty() {
                return Ok(());
            }
            let mut commands = Vec::new();
            commands.extend(
                staging
                    .remove_edges
                    .drain(..)
                    .map(|(from, to)| StagedCommand::RemoveEdge { from, to }),
            );
            commands.extend(staging.remove_nodes.drain(..).map(StagedCommand::RemoveNode));
            commands.extend(staging.add_nodes.drain(..).map(StagedCommand::AddNode));
            commands.extend(staging.add_edges.drain(..).map(StagedCommand::AddEdge));
            commands
        };

        let mut representation = self
            .representation
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for command in commands {
            match command {
                StagedCommand::RemoveEdge { from, to } => representation.remove_edge(&from, &to)?,
                StagedCommand::RemoveNode(name) => representation.remove_node(&name)?,
                StagedCommand::AddNode(node) => representation.add_node(node)?,
                StagedCommand::AddEdge(link) => representation.add_edge(link)?,
            }
        }
        Ok(())
    }

    /// Look up a node by name (a shared-handle clone)
    pub fn find_node(&self, name: &str) -> Option<Node> {
        let representation = self.read();
        representation
            .node_names
            .get(name)
            .map(|key| representation.nodes[*key].clone())
    }

    /// Names of all live nodes
    pub fn node_names(&self) -> Vec<String> {
        self.read().node_names.keys().cloned().collect()
    }

    /// Views of all live links
    pub fn links(&self) -> Vec<Link> {
        self.read().links.values().cloned().collect()
    }

    /// Direct predecessors, optionally filtered by link type
    pub fn find_predecessors(&self, name: &str, accepted: Option<LinkType>) -> Vec<String> {
        self.read().neighbors(name, true, accepted)
    }

    /// Transitive predecessors, optionally filtered by link type
    pub fn find_all_predecessors(&self, name: &str, accepted: Option<LinkType>) -> Vec<String> {
        self.closure(name, true, accepted)
    }

    /// Direct successors, optionally filtered by link type
    pub fn find_successors(&self, name: &str, accepted: Option<LinkType>) -> Vec<String> {
        self.read().neighbors(name, false, accepted)
    }

    /// Transitive successors, optionally filtered by link type
    pub fn find_all_successors(&self, name: &str, accepted: Option<LinkType>) -> Vec<String> {
        self.closure(name, false, accepted)
    }

    /// Views of the links ending at `name`
    pub fn find_edges_to(&self, name: &str) -> Vec<Link> {
        let representation = self.read();
        let Ok(key) = representation.key_of(name) else {
            return Vec::new();
        };
        representation
            .in_edges
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|link_key| representation.links.get(*link_key))
            .cloned()
            .collect()
    }

    /// Views of the links starting at `name`
    pub fn find_edges_from(&self, name: &str) -> Vec<Link> {
        let representation = self.read();
        let Ok(key) = representation.key_of(name) else {
            return Vec::new();
        };
        representation
            .out_edges
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|link_key| representation.links.get(*link_key))
            .cloned()
            .collect()
    }

    /// Drive a visitor over all live nodes, then all live links
    pub fn accept(&self, visitor: &mut dyn GraphVisitor) {
        let representation = self.read();
        for node in representation.nodes.values() {
            visitor.visit_node(node);
        }
        for link in representation.links.values() {
            visitor.visit_link(link);
        }
    }

    /// Modify the sync recipe of the most recently staged edge between two
    /// nodes (link-builder plumbing)
    pub(crate) fn modify_staged_link(
        &self,
        from: &str,
        to: &str,
        modify: impl FnOnce(&mut SyncObjectSpec),
    ) {
        let mut staging = self.lock_staging();
        if let Some(link) = staging
            .add_edges
            .iter_mut()
            .rev()
            .find(|link| link.from_node() == from && link.to_node() == to)
        {
            modify(link.sync_object_spec_mut());
        }
    }

    fn closure(&self, name: &str, incoming: bool, accepted: Option<LinkType>) -> Vec<String> {
        let representation = self.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            for neighbor in representation.neighbors(&current, incoming, accepted) {
                if seen.insert(neighbor.clone()) {
                    queue.push_back(neighbor.clone());
                    result.push(neighbor);
                }
            }
        }
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphRepresentation> {
        self.representation
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_staging(&self) -> std::sync::MutexGuard<'_, StagingArea> {
        self.staging
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Declares the synchronization recipe of a freshly staged link
pub struct LinkBuilder<'g> {
    graph: &'g Graph,
    from: String,
    to: String,
}

impl<'g> LinkBuilder<'g> {
    pub(crate) fn new(graph: &'g Graph, from: String, to: String) -> Self {
        Self { graph, from, to }
    }

    /// Declare a binary semaphore on the link
    pub fn add_semaphore(&self, name: &str) -> &Self {
        self.modify(|spec| {
            spec.add_semaphore(name);
        })
    }

    /// Declare a timeline semaphore on the link
    pub fn add_timeline_semaphore(&self, name: &str, initial_value: u64, width: u64) -> &Self {
        self.modify(|spec| {
            spec.add_timeline_semaphore(name, initial_value, width);
        })
    }

    /// Producer signals `semaphore` in `stage` (external group)
    pub fn signal_on_gpu(&self, semaphore: &str, stage: vk::PipelineStageFlags2) -> &Self {
        self.modify(|spec| {
            spec.add_signal_operation(sync_groups::EXTERNAL, semaphore, stage);
        })
    }

    /// Producer signals `semaphore` at a relative timeline value
    pub fn signal_value_on_gpu(
        &self,
        semaphore: &str,
        stage: vk::PipelineStageFlags2,
        value: u64,
    ) -> &Self {
        self.modify(|spec| {
            spec.add_signal_value_operation(sync_groups::EXTERNAL, semaphore, stage, value);
        })
    }

    /// Consumer waits on `semaphore` in `stage` (internal group)
    pub fn wait_on_gpu(&self, semaphore: &str, stage: vk::PipelineStageFlags2) -> &Self {
        self.modify(|spec| {
            spec.add_wait_operation(sync_groups::INTERNAL, semaphore, stage);
        })
    }

    /// Consumer waits on `semaphore` at a relative timeline value
    pub fn wait_value_on_gpu(
        &self,
        semaphore: &str,
        stage: vk::PipelineStageFlags2,
        value: u64,
    ) -> &Self {
        self.modify(|spec| {
            spec.add_wait_value_operation(sync_groups::INTERNAL, semaphore, stage, value);
        })
    }

    /// Binary semaphore signaled by the producer, waited on by the consumer
    pub fn with_signal_wait_semaphore(
        &self,
        name: &str,
        signal_stage: vk::PipelineStageFlags2,
        wait_stage: vk::PipelineStageFlags2,
    ) -> &Self {
        self.add_semaphore(name)
            .signal_on_gpu(name, signal_stage)
            .wait_on_gpu(name, wait_stage)
    }

    /// Timeline semaphore advanced by `width` per frame, signaled by the
    /// producer and waited on by the consumer at the window's last value
    pub fn with_signal_wait_timeline(
        &self,
        name: &str,
        width: u64,
        signal_stage: vk::PipelineStageFlags2,
        wait_stage: vk::PipelineStageFlags2,
    ) -> &Self {
        self.add_timeline_semaphore(name, 0, width)
            .signal_value_on_gpu(name, signal_stage, width)
            .wait_value_on_gpu(name, wait_stage, width)
    }

    fn modify(&self, modify: impl FnOnce(&mut SyncObjectSpec)) -> &Self {
        self.graph.modify_staged_link(&self.from, &self.to, modify);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    fn empty_node(name: &str) -> Node {
        Node::new(name, NodeKind::Empty)
    }

    fn edge(from: &str, to: &str, link_type: LinkType) -> Link {
        Link::new(from, to, link_type, SyncObjectSpec::default())
    }

    #[test]
    fn staged_commands_only_land_on_apply() {
        let graph = Graph::new("test");
        graph.add_node(empty_node("a")).unwrap();
        assert!(graph.find_node("a").is_none());
        graph.apply_changes().unwrap();
        assert!(graph.find_node("a").is_some());
    }

    #[test]
    fn apply_is_idempotent_with_an_empty_staging_area() {
        let graph = Graph::new("test");
        graph.add_node(empty_node("a")).unwrap();
        graph.apply_changes().unwrap();
        graph.apply_changes().unwrap();
        graph.apply_changes().unwrap();
        assert_eq!(graph.node_names().len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected_at_staging_time() {
        let graph = Graph::new("test");
        graph.add_node(empty_node("a")).unwrap();
        assert!(graph.add_node(empty_node("a")).is_err());
        graph.apply_changes().unwrap();
        assert!(graph.add_node(empty_node("a")).is_err());
    }

    #[test]
    fn edges_require_both_endpoints() {
        let graph = Graph::new("test");
        graph.add_node(empty_node("a")).unwrap();
        assert!(graph.add_edge(edge("a", "ghost", LinkType::CpuSync)).is_err());
        graph.add_node(empty_node("b")).unwrap();
        assert!(graph.add_edge(edge("a", "b", LinkType::CpuSync)).is_ok());
    }

    #[test]
    fn mixed_mutations_apply_in_removal_first_order() {
        let graph = Graph::new("test");
        for name in ["a", "b", "c"] {
            graph.add_node(empty_node(name)).unwrap();
        }
        graph.add_edge(edge("a", "b", LinkType::CpuSync)).unwrap();
        graph.add_edge(edge("b", "c", LinkType::CpuSync)).unwrap();
        graph.apply_changes().unwrap();

        // Replace node b's outgoing edge with a direct a -> c edge.
        graph.remove_edge("a", "b");
        graph.remove_node("b");
        graph.add_edge(edge("a", "c", LinkType::CpuAsync)).unwrap();
        graph.apply_changes().unwrap();

        assert!(graph.find_node("b").is_none());
        assert_eq!(graph.find_successors("a", None), vec!["c".to_string()]);
        assert_eq!(
            graph.find_successors("a", Some(LinkType::CpuAsync)),
            vec!["c".to_string()]
        );
        assert!(graph.find_successors("a", Some(LinkType::CpuSync)).is_empty());
    }

    #[test]
    fn transitive_queries_follow_the_link_filter() {
        let graph = Graph::new("test");
        for name in ["a", "b", "c", "d"] {
            graph.add_node(empty_node(name)).unwrap();
        }
        graph.add_edge(edge("a", "b", LinkType::CpuSync)).unwrap();
        graph.add_edge(edge("b", "c", LinkType::CpuSync)).unwrap();
        graph.add_edge(edge("c", "d", LinkType::CpuAsync)).unwrap();
        graph.apply_changes().unwrap();

        let mut all = graph.find_all_successors("a", None);
        all.sort();
        assert_eq!(all, vec!["b".to_string(), "c".to_string(), "d".to_string()]);

        let mut sync_only = graph.find_all_successors("a", Some(LinkType::CpuSync));
        sync_only.sort();
        assert_eq!(sync_only, vec!["b".to_string(), "c".to_string()]);

        let mut predecessors = graph.find_all_predecessors("d", None);
        predecessors.sort();
        assert_eq!(
            predecessors,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn visitor_sees_every_node_and_link() {
        struct Counter {
            nodes: usize,
            links: usize,
        }
        impl GraphVisitor for Counter {
            fn visit_node(&mut self, _: &Node) {
                self.nodes += 1;
            }
            fn visit_link(&mut self, _: &Link) {
                self.links += 1;
            }
        }

        let graph = Graph::new("test");
        for name in ["a", "b"] {
            graph.add_node(empty_node(name)).unwrap();
        }
        graph.add_edge(edge("a", "b", LinkType::CpuSync)).unwrap();
        graph.apply_changes().unwrap();

        let mut counter = Counter { nodes: 0, links: 0 };
        graph.accept(&mut counter);
        assert_eq!(counter.nodes, 2);
        assert_eq!(counter.links, 1);
    }
}
