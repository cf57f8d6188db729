//! Per-submission fence tracking

use std::sync::Mutex;

use ash::vk;

use crate::device::{LogicalDevice, SubmitInfo};
use crate::error::EngineResult;
use crate::synchronization::SyncOperations;

use super::QueueSubmit;

/// Tracks the fences of a context's or node's submissions.
///
/// Every tracked submit gets a fresh unsignaled fence, so completion of past
/// submissions can be awaited or polled without touching the submissions'
/// own synchronization.
pub struct QueueSubmitTracker {
    logical_device: LogicalDevice,
    fences: Mutex<Vec<vk::Fence>>,
}

impl QueueSubmitTracker {
    /// Tracker bound to a device
    pub fn new(logical_device: LogicalDevice) -> Self {
        Self {
            logical_device,
            fences: Mutex::new(Vec::new()),
        }
    }

    /// Submit through `context` with a fresh tracking fence attached
    pub fn queue_submit(
        &self,
        submit: SubmitInfo,
        sync_operations: &SyncOperations,
        context: &impl QueueSubmit,
    ) -> EngineResult<()> {
        let fence = self.logical_device.dispatch().create_fence(false)?;
        if let Err(error) = context.queue_submit(submit, sync_operations, fence) {
            self.logical_device.dispatch().destroy_fence(fence);
            return Err(error);
        }
        self.fences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(fence);
        Ok(())
    }

    /// Wait for all tracked submissions to complete
    pub fn wait(&self) -> EngineResult<()> {
        let fences = self
            .fences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if fences.is_empty() {
            return Ok(());
        }
        self.logical_device
            .dispatch()
            .wait_for_fences(&fences, true, u64::MAX)
    }

    /// Poll how many tracked submissions have completed
    pub fn query_num_of_success(&self) -> u32 {
        let fences = self
            .fences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        fences
            .iter()
            .filter(|fence| {
                self.logical_device
                    .dispatch()
                    .fence_status(**fence)
                    .unwrap_or(false)
            })
            .count() as u32
    }

    /// Number of tracked submissions
    pub fn num_of_fences(&self) -> u32 {
        self.fences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len() as u32
    }

    /// Whether every tracked submission has completed
    pub fn is_complete(&self) -> bool {
        self.query_num_of_success() == self.num_of_fences()
    }

    /// Wait for everything tracked, then destroy the fences
    pub fn clear(&self) -> EngineResult<()> {
        self.wait()?;
        let mut fences = self
            .fences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for fence in fences.drain(..) {
            self.logical_device.dispatch().destroy_fence(fence);
        }
        Ok(())
    }
}

impl Drop for QueueSubmitTracker {
    fn drop(&mut self) {
        if let Err(error) = self.clear() {
            log::error!("failed to drain submit tracker on drop: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use crate::queue::{CommandContext, QueueLoadBalancer};
    use std::sync::Arc;

    fn tracked_context() -> (HeadlessDispatch, LogicalDevice, CommandContext) {
        let dispatch = HeadlessDispatch::new();
        let device = LogicalDevice::new(dispatch.clone());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 1));
        let context =
            CommandContext::new(device.clone(), 0, vk::QueueFlags::GRAPHICS, balancer, 1).unwrap();
        (dispatch, device, context)
    }

    #[test]
    fn every_submit_is_tracked_and_completes() {
        let (_, device, context) = tracked_context();
        let tracker = QueueSubmitTracker::new(device);
        for _ in 0..3 {
            tracker
                .queue_submit(SubmitInfo::default(), &SyncOperations::default(), &context)
                .unwrap();
        }
        assert_eq!(tracker.num_of_fences(), 3);
        assert_eq!(tracker.query_num_of_success(), 3);
        assert!(tracker.is_complete());
    }

    #[test]
    fn clear_destroys_all_tracking_fences() {
        let (dispatch, device, context) = tracked_context();
        let tracker = QueueSubmitTracker::new(device);
        tracker
            .queue_submit(SubmitInfo::default(), &SyncOperations::default(), &context)
            .unwrap();
        assert_eq!(dispatch.live_fence_count(), 1);
        tracker.clear().unwrap();
        assert_eq!(tracker.num_of_fences(), 0);
        assert_eq!(dispatch.live_fence_count(), 0);
    }
}
