//! # Graph Engine
//!
//! A Vulkan render-graph runtime with parallel, pipelined frame execution.
//!
//! ## Features
//!
//! - **Render graph**: typed nodes and links with staged, atomic mutation
//! - **Timeline synchronization**: named semaphores with per-frame window
//!   offsetting, composable wait/signal operation groups
//! - **Pipelined frames**: K in-flight execution slots, each a task DAG run
//!   on a worker pool
//! - **Batched transfers**: staging-area coalescing of uploads and downloads
//! - **Swappable device dispatch**: real Vulkan through `ash`, or a software
//!   dispatch for headless runs and tests
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use graph_engine::prelude::*;
//!
//! # fn demo(device: LogicalDevice, swapchain: Arc<Swapchain>,
//! #         window: Arc<dyn WindowBridge>,
//! #         render_ctx: Arc<CommandContext>, present_ctx: Arc<CommandContext>,
//! #         transfer_ctx: Arc<SingleShotCommandContext>,
//! #         renderer: Box<dyn Renderer>) -> EngineResult<()> {
//! let config = RenderEngineConfig::default();
//! let mut engine =
//!     ParallelRenderEngine::new(device, render_ctx, present_ctx, transfer_ctx, config);
//!
//! let mut builder = engine.create_render_graph_builder("forward");
//! builder.add_cpu_node(
//!     "acquire",
//!     Box::new(ImageAcquireTask::new(window.clone(), swapchain.clone(), "draw")),
//! )?;
//! builder.add_render_node("draw", renderer, TrackingMode::On)?;
//! builder.add_present_node("present", swapchain, window)?;
//! builder
//!     .add_cpu_sync_link("acquire", "draw")?
//!     .with_signal_wait_semaphore(
//!         ImageAcquireTask::IMAGE_AVAILABLE_SEMAPHORE_NAME,
//!         vk::PipelineStageFlags2::ALL_COMMANDS,
//!         vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
//!     );
//! builder
//!     .add_cpu_sync_link("draw", "present")?
//!     .with_signal_wait_semaphore(
//!         RENDER_FINISHED_SEMAPHORE_NAME,
//!         vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
//!         vk::PipelineStageFlags2::ALL_COMMANDS,
//!     );
//! engine.set_render_graph(builder.reset("done"))?;
//!
//! loop {
//!     engine.render()?;
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod debug;
pub mod device;
pub mod engine;
pub mod error;
pub mod graph;
pub mod queue;
pub mod resources;
pub mod runtime;
pub mod synchronization;
pub mod transfer;
pub mod window;

/// Commonly used types in one import
pub mod prelude {
    pub use crate::config::RenderEngineConfig;
    pub use crate::device::{DeviceDispatch, LogicalDevice};
    pub use crate::engine::{ParallelRenderEngine, RenderGraphBuilder, RENDER_FINISHED_SEMAPHORE_NAME};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::graph::{
        ComputeTask, CpuTask, ExecutionContext, Graph, ImageAcquireTask, LinkType, Renderer,
        TrackingMode,
    };
    pub use crate::queue::{CommandContext, QueueLoadBalancer, SingleShotCommandContext};
    pub use crate::synchronization::{sync_groups, SyncObject, SyncOperations, SyncPrimitives};
    pub use crate::transfer::{DataTransferScheduler, DATA_TRANSFER_FINISH_SEMAPHORE};
    pub use crate::window::{Swapchain, WindowBridge};
}
