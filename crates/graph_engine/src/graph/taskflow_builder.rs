//! Materializes a frozen graph into a runnable task DAG
//!
//! One builder invocation produces the taskflow and execution context of one
//! in-flight slot. Task bodies resolve their synchronization at run time:
//! waits come from the internal group of every inbound link, signals from
//! the external group of every outbound link, unioned, restricted to the
//! node's queue family, and handed to the node's job.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use crate::device::{LogicalDevice, PresentInfo, PresentOutcome, SubmitInfo};
use crate::error::{EngineError, EngineResult};
use crate::queue::{QueueSubmit, QueueSubmitTracker};
use crate::runtime::{TaskId, Taskflow};
use crate::synchronization::{
    sync_groups, SyncFeedbackService, SyncObject, SyncObjectId, SyncOperations,
};

use super::{ExecutionContext, Graph, Job, LinkType, Node, NodeKind, TrackingMode};

/// Builds one slot's taskflow from a frozen graph
pub struct TaskflowBuilder;

impl TaskflowBuilder {
    /// Materialize `graph` into a taskflow plus the slot's execution context.
    ///
    /// Refuses graphs whose frame-root nodes have inbound links or whose
    /// present nodes have outbound links.
    pub fn create_taskflow(
        graph: &Arc<Graph>,
        logical_device: &LogicalDevice,
        feedback_service: &Arc<SyncFeedbackService>,
    ) -> EngineResult<(Taskflow, Arc<ExecutionContext>)> {
        Self::validate_shape(graph)?;

        // One sync object per link: slot-private for in-frame links, the
        // link's shared object for cross-frame links.
        let mut sync_objects = HashMap::new();
        let mut slot_private = Vec::new();
        for link in graph.links() {
            let object = match link.link_type() {
                LinkType::CpuSync => {
                    let object = link.instantiate_sync_object(logical_device)?;
                    slot_private.push(object.clone());
                    object
                }
                LinkType::CpuAsync => link.shared_sync_object(logical_device)?,
            };
            sync_objects.insert(link.id(), object);
        }
        let execution_context = Arc::new(ExecutionContext::new(sync_objects, slot_private));

        let mut taskflow = Taskflow::new();
        let mut task_ids: HashMap<String, TaskId> = HashMap::new();
        for name in graph.node_names() {
            let node = graph.find_node(&name).ok_or_else(|| {
                EngineError::GraphConstruction {
                    reason: format!("node '{name}' vanished while building"),
                }
            })?;
            let job = Arc::new(Self::build_job(
                &node,
                graph,
                &execution_context,
                logical_device,
                feedback_service,
            ));
            if let Some(tracker) = job.queue_tracker() {
                Self::register_feedback(&node, graph, &execution_context, feedback_service, tracker);
            }

            let graph_for_task = graph.clone();
            let context_for_task = execution_context.clone();
            let node_name = name.clone();
            let job_for_task = job.clone();
            let task_id = taskflow.add_task(name.clone(), move || {
                match Self::gather_operations(&graph_for_task, &node_name, &context_for_task) {
                    Ok(operations) => job_for_task.execute(&context_for_task, &operations),
                    Err(error) => {
                        log::error!("failed to resolve sync operations of '{node_name}': {error}");
                    }
                }
            });
            task_ids.insert(name, task_id);
        }

        // In-frame links become task edges; cross-frame links synchronize
        // through their shared timeline window instead.
        for link in graph.links() {
            if link.link_type() == LinkType::CpuSync {
                let from = task_ids[link.from_node()];
                let to = task_ids[link.to_node()];
                taskflow.add_dependency(from, to);
            }
        }

        Ok((taskflow, execution_context))
    }

    fn validate_shape(graph: &Graph) -> EngineResult<()> {
        for name in graph.node_names() {
            let Some(node) = graph.find_node(&name) else {
                continue;
            };
            if node.is_frame_root() && !graph.find_edges_to(&name).is_empty() {
                return Err(EngineError::GraphConstruction {
                    reason: format!("image-acquire node '{name}' must be a root"),
                });
            }
            if node.is_present() && !graph.find_edges_from(&name).is_empty() {
                return Err(EngineError::GraphConstruction {
                    reason: format!("present node '{name}' must be a leaf"),
                });
            }
        }
        Ok(())
    }

    /// Resolve a node's submission-time operations for the current frame.
    ///
    /// Parallel edges between the same pair of nodes merge through the union
    /// here; root ordering is never assumed.
    fn gather_operations(
        graph: &Graph,
        node_name: &str,
        execution_context: &ExecutionContext,
    ) -> EngineResult<SyncOperations> {
        let mut operations = SyncOperations::default();
        for link in graph.find_edges_to(node_name) {
            let Some(object) = execution_context.sync_object(link.id()) else {
                continue;
            };
            let group = match link.link_type() {
                LinkType::CpuSync => object.operations_group(sync_groups::INTERNAL)?,
                LinkType::CpuAsync => object.operations_group_previous_window(
                    sync_groups::INTERNAL,
                    execution_context.frame_number() == 0,
                )?,
            };
            operations.union_with(&group);
        }
        for link in graph.find_edges_from(node_name) {
            let Some(object) = execution_context.sync_object(link.id()) else {
                continue;
            };
            operations.union_with(&object.operations_group(sync_groups::EXTERNAL)?);
        }
        Ok(operations)
    }

    fn register_feedback(
        node: &Node,
        graph: &Graph,
        execution_context: &ExecutionContext,
        feedback_service: &SyncFeedbackService,
        tracker: &Arc<QueueSubmitTracker>,
    ) {
        for link in graph.find_edges_from(node.name()) {
            if let Some(object) = execution_context.sync_object(link.id()) {
                feedback_service.register_tracker(object.id(), node.name(), tracker.clone());
            }
        }
    }

    fn build_job(
        node: &Node,
        graph: &Arc<Graph>,
        execution_context: &Arc<ExecutionContext>,
        logical_device: &LogicalDevice,
        feedback_service: &Arc<SyncFeedbackService>,
    ) -> Job {
        let name = node.name().to_string();
        match node.kind() {
            NodeKind::Render {
                context,
                renderer,
                tracking_mode,
            } => {
                let tracker = match tracking_mode {
                    TrackingMode::On => {
                        Some(Arc::new(QueueSubmitTracker::new(logical_device.clone())))
                    }
                    TrackingMode::Off => None,
                };
                let context = context.clone();
                let renderer = renderer.clone();
                Job::new(
                    name,
                    Box::new(move |ctx, operations, tracker| {
                        let Some(image_index) = ctx.render_target_index() else {
                            return Ok(());
                        };
                        let frame = ctx.frame_number();
                        let mut renderer = renderer
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        renderer.draw(image_index)?;
                        let submit = SubmitInfo {
                            command_buffers: renderer.command_buffers(frame),
                            ..SubmitInfo::default()
                        };
                        let operations = operations
                            .union(&renderer.sync_operations(frame))
                            .restrict(context.as_ref());
                        match tracker {
                            Some(tracker) => {
                                tracker.queue_submit(submit, &operations, context.as_ref())?;
                            }
                            None => {
                                context.queue_submit(submit, &operations, vk::Fence::null())?;
                            }
                        }
                        ctx.set_draw_call_recorded(true);
                        Ok(())
                    }),
                    tracker,
                )
            }
            NodeKind::Transfer {
                transfer_engine,
                scheduler,
            } => {
                let transfer_engine = transfer_engine.clone();
                let scheduler = scheduler.clone();
                Job::new(
                    name,
                    Box::new(move |_ctx, operations, _tracker| {
                        let operations = operations.restrict(transfer_engine.context().as_ref());
                        scheduler.execute_tasks(&operations, &transfer_engine)
                    }),
                    None,
                )
            }
            NodeKind::Compute { task, context } => {
                let task = task.clone();
                let context = context.clone();
                Job::new(
                    name,
                    Box::new(move |ctx, operations, _tracker| {
                        let operations = operations.restrict(context.as_ref());
                        task.run(ctx, &operations)
                    }),
                    None,
                )
            }
            NodeKind::Cpu { task } => {
                let task = task.clone();
                Job::new(
                    name,
                    Box::new(move |ctx, operations, _tracker| {
                        if task.is_active() {
                            task.run(ctx, operations)
                        } else {
                            Ok(())
                        }
                    }),
                    None,
                )
            }
            NodeKind::Present {
                swapchain,
                context,
                window,
            } => {
                // Producers whose completion the present verifies through the
                // feedback service, resolved once against the frozen graph.
                let producer_feedback: Vec<(SyncObjectId, String)> = graph
                    .find_edges_to(node.name())
                    .into_iter()
                    .filter_map(|link| {
                        execution_context
                            .sync_object(link.id())
                            .map(|object: Arc<SyncObject>| {
                                (object.id(), link.from_node().to_string())
                            })
                    })
                    .collect();
                let swapchain = swapchain.clone();
                let context = context.clone();
                let window = window.clone();
                let feedback_service = feedback_service.clone();
                let logical_device = logical_device.clone();
                Job::new(
                    name,
                    Box::new(move |ctx, operations, _tracker| {
                        let Some(image_index) = ctx.render_target_index() else {
                            return Ok(());
                        };
                        for (object_id, producer) in &producer_feedback {
                            if let Some(tracker) = feedback_service.get(*object_id, producer) {
                                tracker.wait()?;
                            }
                        }
                        let timeline_waits = operations.timeline_waits();
                        if !timeline_waits.is_empty() {
                            logical_device
                                .dispatch()
                                .wait_semaphores(&timeline_waits, u64::MAX)?;
                        }
                        let present = PresentInfo {
                            swapchain: swapchain.handle(),
                            image_index,
                            wait_semaphores: operations.binary_wait_semaphores(),
                        };
                        match context.queue_present(present) {
                            Ok(PresentOutcome::Optimal) => Ok(()),
                            Ok(PresentOutcome::Suboptimal) => {
                                log::warn!("presented on a suboptimal swapchain; requesting rebuild");
                                window.request_swapchain_rebuild();
                                Ok(())
                            }
                            Err(EngineError::SwapchainOutOfDate) => {
                                log::warn!("swapchain out of date at present; skipping the frame");
                                window.request_swapchain_rebuild();
                                Ok(())
                            }
                            Err(error) => Err(error),
                        }
                    }),
                    None,
                )
            }
            NodeKind::Empty => Job::new(name, Box::new(|_, _, _| Ok(())), None),
        }
    }
}
