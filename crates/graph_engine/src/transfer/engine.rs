//! One-shot transfer submission

use std::sync::Arc;

use ash::vk;

use crate::device::{LogicalDevice, SubmitInfo};
use crate::error::EngineResult;
use crate::queue::{QueueSubmit, SingleShotCommandContext};
use crate::synchronization::SyncOperations;

/// Records and submits one transfer command buffer at a time.
///
/// Each call allocates a fresh one-shot buffer from the transfer context,
/// hands it to `record`, submits with the given operations, and blocks on
/// the operations' fence so the staging memory is safe to reuse afterwards.
pub struct TransferEngine {
    transfer_context: Arc<SingleShotCommandContext>,
}

impl TransferEngine {
    /// Engine over a single-shot transfer context
    pub fn new(transfer_context: Arc<SingleShotCommandContext>) -> Self {
        Self { transfer_context }
    }

    /// Record and submit one transfer
    pub fn transfer(
        &self,
        sync_operations: &SyncOperations,
        record: impl FnOnce(&LogicalDevice, vk::CommandBuffer),
    ) -> EngineResult<()> {
        let logical_device = self.transfer_context.logical_device().clone();
        let command_buffer = self.transfer_context.create_command_buffer()?;
        logical_device
            .dispatch()
            .begin_command_buffer(command_buffer, true)?;
        record(&logical_device, command_buffer);
        logical_device.dispatch().end_command_buffer(command_buffer)?;

        self.transfer_context.queue_submit(
            SubmitInfo::with_command_buffer(command_buffer),
            sync_operations,
            vk::Fence::null(),
        )?;
        if let Some(fence) = sync_operations.fence() {
            logical_device
                .dispatch()
                .wait_for_fences(&[fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Queue family the transfers run on
    pub fn queue_family_index(&self) -> u32 {
        self.transfer_context.queue_family_index()
    }

    /// The underlying transfer context
    pub fn context(&self) -> &Arc<SingleShotCommandContext> {
        &self.transfer_context
    }
}
