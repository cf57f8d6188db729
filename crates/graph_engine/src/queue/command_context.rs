//! Command-buffer factories and the queue-submit funnel
//!
//! Two variants exist: [`CommandContext`] keeps one long-lived pool per
//! back-buffer frame (render/present work), [`SingleShotCommandContext`]
//! creates a transient pool per submission and reclaims it once the
//! submission's fence signals (transfer/compute work).

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::{LogicalDevice, PresentInfo, PresentOutcome, SubmitInfo};
use crate::error::{EngineError, EngineResult};
use crate::synchronization::{PipelineStageCheck, SyncOperations};

use super::QueueLoadBalancer;

/// The queue-submit entry point shared by all context variants
pub trait QueueSubmit {
    /// Submit `submit` with the given sync operations; `fence` may be null,
    /// in which case the operations' own fence (if any) is attached.
    fn queue_submit(
        &self,
        submit: SubmitInfo,
        sync_operations: &SyncOperations,
        fence: vk::Fence,
    ) -> EngineResult<()>;
}

/// Stage bits every queue family accepts
fn always_supported() -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::TOP_OF_PIPE
        | vk::PipelineStageFlags2::BOTTOM_OF_PIPE
        | vk::PipelineStageFlags2::ALL_COMMANDS
        | vk::PipelineStageFlags2::HOST
}

fn graphics_stages() -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::VERTEX_INPUT
        | vk::PipelineStageFlags2::INDEX_INPUT
        | vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
        | vk::PipelineStageFlags2::VERTEX_SHADER
        | vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER
        | vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER
        | vk::PipelineStageFlags2::GEOMETRY_SHADER
        | vk::PipelineStageFlags2::FRAGMENT_SHADER
        | vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
        | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags2::ALL_GRAPHICS
}

fn transfer_stages() -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::TRANSFER
        | vk::PipelineStageFlags2::COPY
        | vk::PipelineStageFlags2::BLIT
        | vk::PipelineStageFlags2::RESOLVE
        | vk::PipelineStageFlags2::CLEAR
}

/// Family-shared core: device, family index, capability flags, balancer
struct QueueContext {
    logical_device: LogicalDevice,
    queue_family_index: u32,
    queue_flags: vk::QueueFlags,
    load_balancer: Arc<QueueLoadBalancer>,
}

impl QueueContext {
    fn submit(
        &self,
        mut submit: SubmitInfo,
        sync_operations: &SyncOperations,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        sync_operations.fill_info(&mut submit);
        let fence = if fence == vk::Fence::null() {
            sync_operations.fence().unwrap_or_else(vk::Fence::null)
        } else {
            fence
        };
        let lease = self.load_balancer.get_queue();
        self.logical_device
            .dispatch()
            .queue_submit(lease.queue(), submit, fence)
    }

    fn present(&self, present: PresentInfo) -> EngineResult<PresentOutcome> {
        let lease = self.load_balancer.get_queue();
        self.logical_device.dispatch().queue_present(lease.queue(), present)
    }

    fn is_pipeline_stage_supported(&self, stage: vk::PipelineStageFlags2) -> bool {
        let remaining = stage & !always_supported();
        if remaining.intersects(graphics_stages()) && !self.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        {
            return false;
        }
        if remaining.intersects(vk::PipelineStageFlags2::COMPUTE_SHADER)
            && !self.queue_flags.contains(vk::QueueFlags::COMPUTE)
        {
            return false;
        }
        if remaining.intersects(vk::PipelineStageFlags2::DRAW_INDIRECT)
            && !self
                .queue_flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            return false;
        }
        if remaining.intersects(transfer_stages())
            && !self.queue_flags.intersects(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            )
        {
            return false;
        }
        true
    }
}

/// Long-lived command context with one pool per back-buffer frame
pub struct CommandContext {
    queue_context: QueueContext,
    frame_pools: Vec<vk::CommandPool>,
}

impl CommandContext {
    /// Create a context with `back_buffer_count` reusable pools
    pub fn new(
        logical_device: LogicalDevice,
        queue_family_index: u32,
        queue_flags: vk::QueueFlags,
        load_balancer: Arc<QueueLoadBalancer>,
        back_buffer_count: u32,
    ) -> EngineResult<Self> {
        let mut frame_pools = Vec::with_capacity(back_buffer_count as usize);
        for _ in 0..back_buffer_count {
            frame_pools.push(
                logical_device
                    .dispatch()
                    .create_command_pool(queue_family_index, false)?,
            );
        }
        Ok(Self {
            queue_context: QueueContext {
                logical_device,
                queue_family_index,
                queue_flags,
                load_balancer,
            },
            frame_pools,
        })
    }

    /// Allocate a command buffer from the pool of `frame`
    pub fn create_command_buffer(&self, frame: usize) -> EngineResult<vk::CommandBuffer> {
        let pool = self
            .frame_pools
            .get(frame % self.frame_pools.len().max(1))
            .copied()
            .ok_or_else(|| EngineError::InvalidOperation {
                reason: "command context created without pools".to_string(),
            })?;
        self.queue_context
            .logical_device
            .dispatch()
            .allocate_command_buffer(pool)
    }

    /// Present on one of the family's queues
    pub fn queue_present(&self, present: PresentInfo) -> EngineResult<PresentOutcome> {
        self.queue_context.present(present)
    }

    /// Queue family this context submits to
    pub fn queue_family_index(&self) -> u32 {
        self.queue_context.queue_family_index
    }

    /// The device the context lives on
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.queue_context.logical_device
    }
}

impl QueueSubmit for CommandContext {
    fn queue_submit(
        &self,
        submit: SubmitInfo,
        sync_operations: &SyncOperations,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        self.queue_context.submit(submit, sync_operations, fence)
    }
}

impl PipelineStageCheck for CommandContext {
    fn is_pipeline_stage_supported(&self, stage: vk::PipelineStageFlags2) -> bool {
        self.queue_context.is_pipeline_stage_supported(stage)
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        for pool in &self.frame_pools {
            self.queue_context
                .logical_device
                .dispatch()
                .destroy_command_pool(*pool);
        }
    }
}

struct TransientPool {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: Option<vk::Fence>,
}

/// Per-submission command context with transient pools.
///
/// Each allocated buffer gets its own transient pool; once the submission
/// carrying the buffer has a signaled fence the pool is reclaimed on the next
/// allocation or on drop.
pub struct SingleShotCommandContext {
    queue_context: QueueContext,
    transient_pools: Mutex<Vec<TransientPool>>,
}

impl SingleShotCommandContext {
    /// Create a single-shot context on a queue family
    pub fn new(
        logical_device: LogicalDevice,
        queue_family_index: u32,
        queue_flags: vk::QueueFlags,
        load_balancer: Arc<QueueLoadBalancer>,
    ) -> Self {
        Self {
            queue_context: QueueContext {
                logical_device,
                queue_family_index,
                queue_flags,
                load_balancer,
            },
            transient_pools: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a fresh one-shot command buffer
    pub fn create_command_buffer(&self) -> EngineResult<vk::CommandBuffer> {
        self.reclaim_completed()?;
        let dispatch = self.queue_context.logical_device.dispatch();
        let pool = dispatch.create_command_pool(self.queue_context.queue_family_index, true)?;
        let command_buffer = match dispatch.allocate_command_buffer(pool) {
            Ok(command_buffer) => command_buffer,
            Err(error) => {
                dispatch.destroy_command_pool(pool);
                return Err(error);
            }
        };
        self.transient_pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(TransientPool {
                pool,
                command_buffer,
                fence: None,
            });
        Ok(command_buffer)
    }

    /// Destroy pools whose submission fences have signaled
    pub fn reclaim_completed(&self) -> EngineResult<()> {
        let dispatch = self.queue_context.logical_device.dispatch();
        let mut pools = self
            .transient_pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut kept = Vec::with_capacity(pools.len());
        for entry in pools.drain(..) {
            let completed = match entry.fence {
                Some(fence) => dispatch.fence_status(fence).unwrap_or(false),
                None => false,
            };
            if completed {
                dispatch.destroy_command_pool(entry.pool);
            } else {
                kept.push(entry);
            }
        }
        *pools = kept;
        Ok(())
    }

    /// Queue family this context submits to
    pub fn queue_family_index(&self) -> u32 {
        self.queue_context.queue_family_index
    }

    /// The device the context lives on
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.queue_context.logical_device
    }
}

impl QueueSubmit for SingleShotCommandContext {
    fn queue_submit(
        &self,
        submit: SubmitInfo,
        sync_operations: &SyncOperations,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        let effective_fence = if fence == vk::Fence::null() {
            sync_operations.fence().unwrap_or_else(vk::Fence::null)
        } else {
            fence
        };
        let command_buffers = submit.command_buffers.clone();
        self.queue_context.submit(submit, sync_operations, fence)?;
        if effective_fence != vk::Fence::null() {
            let mut pools = self
                .transient_pools
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for entry in pools.iter_mut() {
                if command_buffers.contains(&entry.command_buffer) {
                    entry.fence = Some(effective_fence);
                }
            }
        }
        Ok(())
    }
}

impl PipelineStageCheck for SingleShotCommandContext {
    fn is_pipeline_stage_supported(&self, stage: vk::PipelineStageFlags2) -> bool {
        self.queue_context.is_pipeline_stage_supported(stage)
    }
}

impl Drop for SingleShotCommandContext {
    fn drop(&mut self) {
        let dispatch = self.queue_context.logical_device.dispatch();
        let pools = self
            .transient_pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let pending: Vec<vk::Fence> = pools.iter().filter_map(|entry| entry.fence).collect();
        if !pending.is_empty() {
            let _ = dispatch.wait_for_fences(&pending, true, u64::MAX);
        }
        for entry in pools.iter() {
            dispatch.destroy_command_pool(entry.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;

    fn context_with_flags(queue_flags: vk::QueueFlags) -> CommandContext {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 1));
        CommandContext::new(device, 0, queue_flags, balancer, 2).unwrap()
    }

    #[test]
    fn transfer_only_family_rejects_graphics_stages() {
        let context = context_with_flags(vk::QueueFlags::TRANSFER);
        assert!(context.is_pipeline_stage_supported(vk::PipelineStageFlags2::COPY));
        assert!(context.is_pipeline_stage_supported(vk::PipelineStageFlags2::ALL_COMMANDS));
        assert!(!context.is_pipeline_stage_supported(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        ));
        assert!(!context.is_pipeline_stage_supported(vk::PipelineStageFlags2::COMPUTE_SHADER));
    }

    #[test]
    fn graphics_family_accepts_the_render_stages() {
        let context = context_with_flags(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        );
        assert!(context.is_pipeline_stage_supported(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        ));
        assert!(context.is_pipeline_stage_supported(vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert!(context.is_pipeline_stage_supported(vk::PipelineStageFlags2::TRANSFER));
    }

    #[test]
    fn submit_attaches_the_operations_fence_when_none_is_given() {
        let dispatch = HeadlessDispatch::new();
        let device = LogicalDevice::new(dispatch.clone());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 1));
        let context = CommandContext::new(
            device.clone(),
            0,
            vk::QueueFlags::GRAPHICS,
            balancer,
            1,
        )
        .unwrap();

        let fence = device.dispatch().create_fence(false).unwrap();
        let operations = SyncOperations::with_fence(fence);
        context
            .queue_submit(SubmitInfo::default(), &operations, vk::Fence::null())
            .unwrap();
        assert!(device.dispatch().fence_status(fence).unwrap());
    }

    #[test]
    fn single_shot_pools_are_reclaimed_after_the_fence_signals() {
        let dispatch = HeadlessDispatch::new();
        let device = LogicalDevice::new(dispatch.clone());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 1));
        let context =
            SingleShotCommandContext::new(device.clone(), 0, vk::QueueFlags::TRANSFER, balancer);

        let command_buffer = context.create_command_buffer().unwrap();
        device.dispatch().begin_command_buffer(command_buffer, true).unwrap();
        device.dispatch().end_command_buffer(command_buffer).unwrap();

        let fence = device.dispatch().create_fence(false).unwrap();
        context
            .queue_submit(
                SubmitInfo::with_command_buffer(command_buffer),
                &SyncOperations::default(),
                fence,
            )
            .unwrap();
        context.reclaim_completed().unwrap();
        assert_eq!(
            context
                .transient_pools
                .lock()
                .unwrap()
                .len(),
            0
        );
    }
}
