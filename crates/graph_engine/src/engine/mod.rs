//! Parallel render engine: K pipelined in-flight slots over one graph
//!
//! The application describes its frame as a graph through
//! [`RenderGraphBuilder`], freezes it with
//! [`ParallelRenderEngine::set_render_graph`], and pumps frames with
//! [`ParallelRenderEngine::render`]. Each `render()` call advances one slot:
//! it waits for that slot's previous run if still outstanding, resets the
//! slot's execution context, and launches its taskflow asynchronously, so at
//! most `in_flight_frames` submissions are outstanding at any time.

use std::sync::Arc;

use crate::config::RenderEngineConfig;
use crate::device::LogicalDevice;
use crate::error::{EngineError, EngineResult};
use crate::graph::{
    ComputeTask, CpuTask, ExecutionContext, Graph, Link, LinkBuilder, LinkType, Node, NodeKind,
    Renderer, TaskflowBuilder, TrackingMode,
};
use crate::queue::{CommandContext, SingleShotCommandContext};
use crate::runtime::{Executor, RunToken, Taskflow};
use crate::synchronization::{SyncFeedbackService, SyncObject, SyncObjectSpec};
use crate::transfer::{DataTransferScheduler, TransferEngine};
use crate::window::{Swapchain, WindowBridge};

/// Well-known name of the semaphore the terminal render node signals
pub const RENDER_FINISHED_SEMAPHORE_NAME: &str = "render-finished";

/// Worker threads per in-flight slot's executor
const EXECUTOR_WORKERS_PER_SLOT: usize = 4;

struct RenderingProcess {
    execution_context: Arc<ExecutionContext>,
    taskflow: Taskflow,
    executor: Executor,
    calling_token: Option<RunToken>,
    runs: u64,
}

/// Orchestrates K back-buffered taskflows built from one frozen graph
pub struct ParallelRenderEngine {
    logical_device: LogicalDevice,
    render_context: Arc<CommandContext>,
    present_context: Arc<CommandContext>,
    transfer_context: Arc<SingleShotCommandContext>,
    transfer_scheduler: Arc<DataTransferScheduler>,
    feedback_service: Arc<SyncFeedbackService>,
    config: RenderEngineConfig,
    skeleton: Option<Arc<Graph>>,
    shared_sync_objects: Vec<Arc<SyncObject>>,
    rendering_processes: Vec<RenderingProcess>,
    render_call_count: u64,
}

impl ParallelRenderEngine {
    /// Engine over pre-built command contexts
    pub fn new(
        logical_device: LogicalDevice,
        render_context: Arc<CommandContext>,
        present_context: Arc<CommandContext>,
        transfer_context: Arc<SingleShotCommandContext>,
        config: RenderEngineConfig,
    ) -> Self {
        let transfer_scheduler = Arc::new(DataTransferScheduler::new(logical_device.clone()));
        Self {
            logical_device,
            render_context,
            present_context,
            transfer_context,
            transfer_scheduler,
            feedback_service: Arc::new(SyncFeedbackService::new()),
            config,
            skeleton: None,
            shared_sync_objects: Vec::new(),
            rendering_processes: Vec::new(),
            render_call_count: 0,
        }
    }

    /// Start describing a render graph
    pub fn create_render_graph_builder(&self, graph_name: impl Into<String>) -> RenderGraphBuilder {
        RenderGraphBuilder {
            graph: Graph::new(graph_name),
            render_context: self.render_context.clone(),
            present_context: self.present_context.clone(),
            transfer_context: self.transfer_context.clone(),
            transfer_scheduler: self.transfer_scheduler.clone(),
        }
    }

    /// Freeze `render_graph` and materialize the in-flight slots.
    ///
    /// May be called exactly once; the engine keeps the graph skeleton for
    /// the rest of its life.
    pub fn set_render_graph(&mut self, render_graph: Graph) -> EngineResult<()> {
        if self.skeleton.is_some() {
            return Err(EngineError::InvalidOperation {
                reason: "engine already has a render graph".to_string(),
            });
        }
        self.config.validate()?;
        render_graph.apply_changes()?;
        let skeleton = Arc::new(render_graph);

        // Cross-frame links share one sync object across every slot; their
        // timelines advance once per engine frame.
        self.shared_sync_objects = skeleton
            .links()
            .iter()
            .filter(|link| link.link_type() == LinkType::CpuAsync)
            .map(|link| link.shared_sync_object(&self.logical_device))
            .collect::<EngineResult<Vec<_>>>()?;

        for _ in 0..self.config.effective_in_flight_frames() {
            let (taskflow, execution_context) = TaskflowBuilder::create_taskflow(
                &skeleton,
                &self.logical_device,
                &self.feedback_service,
            )?;
            self.rendering_processes.push(RenderingProcess {
                execution_context,
                taskflow,
                executor: Executor::new(EXECUTOR_WORKERS_PER_SLOT),
                calling_token: None,
                runs: 0,
            });
        }
        self.skeleton = Some(skeleton);
        Ok(())
    }

    /// Pump the next frame.
    ///
    /// Blocks only when the oldest in-flight slot has not finished its
    /// previous run. Without a graph this is a no-op.
    pub fn render(&mut self) -> EngineResult<()> {
        if self.skeleton.is_none() {
            return Ok(());
        }
        let slot = (self.render_call_count % self.rendering_processes.len() as u64) as usize;

        // Frame entry: advance every timeline window. Shared cross-frame
        // objects step once per engine frame, slot-private ones once per run
        // of their slot; the very first frame keeps the initial window.
        if self.render_call_count > 0 {
            for object in &self.shared_sync_objects {
                object.step_all_timelines()?;
            }
        }
        let process = &mut self.rendering_processes[slot];
        if let Some(token) = process.calling_token.take() {
            token.wait();
        }
        if process.runs > 0 {
            for object in process.execution_context.slot_private_sync_objects() {
                object.step_all_timelines()?;
            }
        }
        process.execution_context.reset();
        process.execution_context.set_frame_number(self.render_call_count);
        process.calling_token = Some(process.executor.run(&process.taskflow));
        process.runs += 1;
        self.render_call_count += 1;
        Ok(())
    }

    /// Slots whose previous run has not retired yet
    pub fn outstanding_frames(&self) -> usize {
        self.rendering_processes
            .iter()
            .filter(|process| {
                process
                    .calling_token
                    .as_ref()
                    .is_some_and(|token| !token.is_finished())
            })
            .count()
    }

    /// Drain every in-flight slot, then wait for the device
    pub fn wait_idle(&mut self) -> EngineResult<()> {
        for process in &mut self.rendering_processes {
            if let Some(token) = process.calling_token.take() {
                token.wait();
            }
        }
        self.logical_device.wait_idle()
    }

    /// Run the renderers' teardown hooks before a swapchain rebuild
    pub fn before_swapchain_reinit(&mut self) -> EngineResult<()> {
        self.wait_idle()?;
        self.visit_renderers(|renderer| renderer.before_reinit());
        Ok(())
    }

    /// Run the renderers' rebuild hooks after a swapchain rebuild
    pub fn finalize_swapchain_reinit(&mut self, back_buffer_count: u32) {
        self.visit_renderers(|renderer| renderer.finalize_reinit(back_buffer_count));
    }

    /// The staging-area scheduler transfer nodes drain
    pub fn transfer_scheduler(&self) -> &Arc<DataTransferScheduler> {
        &self.transfer_scheduler
    }

    /// Tracker lookup for per-submission status queries
    pub fn feedback_service(&self) -> &Arc<SyncFeedbackService> {
        &self.feedback_service
    }

    /// The engine's configuration
    pub fn config(&self) -> &RenderEngineConfig {
        &self.config
    }

    fn visit_renderers(&self, mut visit: impl FnMut(&mut dyn Renderer)) {
        let Some(skeleton) = &self.skeleton else {
            return;
        };
        for name in skeleton.node_names() {
            if let Some(node) = skeleton.find_node(&name) {
                if let NodeKind::Render { renderer, .. } = node.kind() {
                    let mut renderer = renderer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    visit(&mut **renderer);
                }
            }
        }
    }
}

impl Drop for ParallelRenderEngine {
    fn drop(&mut self) {
        // Cooperative shutdown: everything in flight retires, then the
        // feedback fences go away, before any owned object is destroyed.
        if let Err(error) = self.wait_idle() {
            log::error!("engine teardown: wait-idle failed: {error}");
        }
        if let Err(error) = self.feedback_service.clear_fences() {
            log::error!("engine teardown: clearing feedback fences failed: {error}");
        }
    }
}

/// Stages nodes and links of a render graph.
///
/// Node additions buffer in the graph's staging area; link creation applies
/// pending changes first, so endpoints are always validated against the live
/// graph.
pub struct RenderGraphBuilder {
    graph: Graph,
    render_context: Arc<CommandContext>,
    present_context: Arc<CommandContext>,
    transfer_context: Arc<SingleShotCommandContext>,
    transfer_scheduler: Arc<DataTransferScheduler>,
}

impl RenderGraphBuilder {
    /// Add a render node driving `renderer`
    pub fn add_render_node(
        &self,
        name: impl Into<String>,
        renderer: Box<dyn Renderer>,
        tracking_mode: TrackingMode,
    ) -> EngineResult<()> {
        self.graph.add_node(Node::new(
            name,
            NodeKind::Render {
                context: self.render_context.clone(),
                renderer: Arc::new(std::sync::Mutex::new(renderer)),
                tracking_mode,
            },
        ))
    }

    /// Add a transfer node draining the engine's staging areas
    pub fn add_transfer_node(&self, name: impl Into<String>) -> EngineResult<()> {
        let transfer_engine = Arc::new(TransferEngine::new(self.transfer_context.clone()));
        self.graph.add_node(Node::new(
            name,
            NodeKind::Transfer {
                transfer_engine,
                scheduler: self.transfer_scheduler.clone(),
            },
        ))
    }

    /// Add a compute node running `task`
    pub fn add_compute_node(
        &self,
        name: impl Into<String>,
        task: Box<dyn ComputeTask>,
    ) -> EngineResult<()> {
        self.graph.add_node(Node::new(
            name,
            NodeKind::Compute {
                task: Arc::from(task),
                context: self.transfer_context.clone(),
            },
        ))
    }

    /// Add a CPU node running `task`
    pub fn add_cpu_node(&self, name: impl Into<String>, task: Box<dyn CpuTask>) -> EngineResult<()> {
        self.graph
            .add_node(Node::new(name, NodeKind::Cpu { task: Arc::from(task) }))
    }

    /// Add a present node for `swapchain`
    pub fn add_present_node(
        &self,
        name: impl Into<String>,
        swapchain: Arc<Swapchain>,
        window: Arc<dyn WindowBridge>,
    ) -> EngineResult<()> {
        self.graph.add_node(Node::new(
            name,
            NodeKind::Present {
                swapchain,
                context: self.present_context.clone(),
                window,
            },
        ))
    }

    /// Add a structural placeholder node
    pub fn add_empty_node(&self, name: impl Into<String>) -> EngineResult<()> {
        self.graph.add_node(Node::new(name, NodeKind::Empty))
    }

    /// Link `from` to `to` with an in-frame dependency
    pub fn add_cpu_sync_link(&self, from: &str, to: &str) -> EngineResult<LinkBuilder<'_>> {
        self.add_link(from, to, LinkType::CpuSync)
    }

    /// Link `from` to `to` with a cross-frame (pipelining) dependency
    pub fn add_cpu_async_link(&self, from: &str, to: &str) -> EngineResult<LinkBuilder<'_>> {
        self.add_link(from, to, LinkType::CpuAsync)
    }

    /// Take the built graph out, restarting the builder under a new name
    pub fn reset(&mut self, new_name: impl Into<String>) -> Graph {
        std::mem::replace(&mut self.graph, Graph::new(new_name))
    }

    fn add_link(&self, from: &str, to: &str, link_type: LinkType) -> EngineResult<LinkBuilder<'_>> {
        self.graph.apply_changes()?;
        self.graph
            .add_edge(Link::new(from, to, link_type, SyncObjectSpec::default()))?;
        Ok(LinkBuilder::new(
            &self.graph,
            from.to_string(),
            to.to_string(),
        ))
    }
}
