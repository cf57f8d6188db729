//! Render-graph model and taskflow construction

mod acquire;
mod job;
mod link;
mod node;
mod taskflow_builder;
mod visitor;

#[allow(clippy::module_inception)]
mod graph;

pub use acquire::ImageAcquireTask;
pub use graph::{Graph, LinkBuilder};
pub use job::{ExecutionContext, Job};
pub use link::{Link, LinkId, LinkType};
pub use node::{ComputeTask, CpuTask, Node, NodeKind, Renderer, TrackingMode};
pub use taskflow_builder::TaskflowBuilder;
pub use visitor::GraphVisitor;
