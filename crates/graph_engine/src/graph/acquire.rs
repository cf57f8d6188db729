//! Frame-opening swapchain image acquisition

use std::sync::Arc;

use ash::vk;

use crate::error::{EngineError, EngineResult};
use crate::synchronization::SyncOperations;
use crate::window::{Swapchain, WindowBridge};

use super::{CpuTask, ExecutionContext};

/// CPU node task selecting the frame's swapchain image.
///
/// Always a root of the frame: it writes the selected index into the
/// execution context and signals the link's `image-available` semaphore
/// through the acquire call, so the consuming render node can wait on it at
/// color-attachment output. An out-of-date swapchain skips the frame and
/// raises a rebuild request instead of failing it.
pub struct ImageAcquireTask {
    window: Arc<dyn WindowBridge>,
    swapchain: Arc<Swapchain>,
    image_user_node_name: String,
}

impl ImageAcquireTask {
    /// Well-known name of the semaphore this task signals
    pub const IMAGE_AVAILABLE_SEMAPHORE_NAME: &'static str = "image-available";

    /// Task acquiring from `swapchain`; `image_user_node_name` names the
    /// render node consuming the image (diagnostics only)
    pub fn new(
        window: Arc<dyn WindowBridge>,
        swapchain: Arc<Swapchain>,
        image_user_node_name: impl Into<String>,
    ) -> Self {
        Self {
            window,
            swapchain,
            image_user_node_name: image_user_node_name.into(),
        }
    }
}

impl CpuTask for ImageAcquireTask {
    fn run(
        &self,
        execution_context: &ExecutionContext,
        sync_operations: &SyncOperations,
    ) -> EngineResult<()> {
        let semaphore = sync_operations
            .binary_signal_semaphores()
            .first()
            .copied()
            .unwrap_or_else(vk::Semaphore::null);

        match self.swapchain.acquire_next_image(semaphore) {
            Ok(outcome) => {
                if outcome.suboptimal {
                    self.window.request_swapchain_rebuild();
                }
                execution_context.set_render_target_index(outcome.image_index);
                Ok(())
            }
            Err(EngineError::SwapchainOutOfDate) => {
                log::warn!(
                    "swapchain out of date while acquiring for '{}'; requesting rebuild",
                    self.image_user_node_name
                );
                execution_context.clear_render_target_index();
                self.window.request_swapchain_rebuild();
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn is_frame_root(&self) -> bool {
        true
    }
}
