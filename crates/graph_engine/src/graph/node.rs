//! Graph nodes and the task traits they embed

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::error::EngineResult;
use crate::queue::{CommandContext, SingleShotCommandContext};
use crate::synchronization::SyncOperations;
use crate::transfer::{DataTransferScheduler, TransferEngine};
use crate::window::{Swapchain, WindowBridge};

use super::ExecutionContext;

/// Whether a render node attaches a fence-backed submit tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Track every submission with a fence, published to the feedback service
    On,
    /// Submit untracked
    Off,
}

/// A renderer embedded in a render node.
///
/// Implementations record into their own command buffers; the runtime
/// supplies the swapchain image index and merges the renderer's extra sync
/// operations into the node's submission.
pub trait Renderer: Send + Sync {
    /// Called before the swapchain is torn down for a rebuild
    fn before_reinit(&mut self) {}

    /// Called after the swapchain was rebuilt
    fn finalize_reinit(&mut self, back_buffer_count: u32) {
        let _ = back_buffer_count;
    }

    /// Record the draw for one swapchain image
    fn draw(&mut self, image_index: u32) -> EngineResult<()>;

    /// Command buffers to submit for `frame`
    fn command_buffers(&self, frame: u64) -> Vec<vk::CommandBuffer>;

    /// Extra submission-time sync operations of this renderer
    fn sync_operations(&self, frame: u64) -> SyncOperations {
        let _ = frame;
        SyncOperations::default()
    }
}

/// A CPU-side task embedded in a CPU node
pub trait CpuTask: Send + Sync {
    /// Execute for the current frame; `sync_operations` carries the resolved
    /// operations of the node's graph links
    fn run(
        &self,
        execution_context: &ExecutionContext,
        sync_operations: &SyncOperations,
    ) -> EngineResult<()>;

    /// Frame-root tasks bracket the frame and may not have inbound links
    fn is_frame_root(&self) -> bool {
        false
    }

    /// Inactive tasks are skipped without failing the frame
    fn is_active(&self) -> bool {
        true
    }
}

/// A compute dispatch embedded in a compute node.
///
/// Kernel registration happens through this seam; the kernel body itself is
/// the implementor's business.
pub trait ComputeTask: Send + Sync {
    /// Record and submit the dispatch for the current frame
    fn run(
        &self,
        execution_context: &ExecutionContext,
        sync_operations: &SyncOperations,
    ) -> EngineResult<()>;
}

/// Payload of a graph node
#[derive(Clone)]
pub enum NodeKind {
    /// GPU rendering through a reusable command context
    Render {
        /// Context the node submits on
        context: Arc<CommandContext>,
        /// The embedded renderer
        renderer: Arc<Mutex<Box<dyn Renderer>>>,
        /// Submission tracking switch
        tracking_mode: TrackingMode,
    },
    /// Batched data transfers
    Transfer {
        /// Engine recording the transfer submissions
        transfer_engine: Arc<TransferEngine>,
        /// Staging areas drained by this node
        scheduler: Arc<DataTransferScheduler>,
    },
    /// Compute dispatch through an embedded task
    Compute {
        /// The embedded dispatch
        task: Arc<dyn ComputeTask>,
        /// Context whose queue family scopes the node's operations
        context: Arc<SingleShotCommandContext>,
    },
    /// CPU-side work
    Cpu {
        /// The embedded task
        task: Arc<dyn CpuTask>,
    },
    /// Swapchain presentation
    Present {
        /// Swapchain presented on
        swapchain: Arc<Swapchain>,
        /// Context the present runs on
        context: Arc<CommandContext>,
        /// Hook for rebuild requests
        window: Arc<dyn WindowBridge>,
    },
    /// Structural placeholder without work
    Empty,
}

/// A named node of the render graph.
///
/// Payloads are shared handles so every in-flight slot executes the same
/// node state.
#[derive(Clone)]
pub struct Node {
    name: String,
    kind: NodeKind,
}

impl Node {
    /// Node from name and payload
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Unique name within the graph
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether this node brackets the frame start (image acquire)
    pub fn is_frame_root(&self) -> bool {
        matches!(&self.kind, NodeKind::Cpu { task } if task.is_frame_root())
    }

    /// Whether this node presents
    pub fn is_present(&self) -> bool {
        matches!(self.kind, NodeKind::Present { .. })
    }
}
