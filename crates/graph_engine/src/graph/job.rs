//! Per-node jobs and per-slot execution state

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::EngineResult;
use crate::queue::QueueSubmitTracker;
use crate::synchronization::{SyncObject, SyncOperations};
use crate::topic_log;

use crate::debug::RenderGraphExecutionTopic;

use super::LinkId;

/// Mutable state of one in-flight slot.
///
/// Holds the slot's render-target index, the draw-recorded flag, and one
/// sync object per graph link (slot-private for in-frame links, shared for
/// cross-frame links). Index reads take the shared lock since node tasks
/// read it concurrently.
pub struct ExecutionContext {
    render_target_index: RwLock<Option<u32>>,
    draw_call_recorded: AtomicBool,
    frame_number: AtomicU64,
    sync_objects: HashMap<LinkId, Arc<SyncObject>>,
    slot_private_objects: Vec<Arc<SyncObject>>,
}

impl ExecutionContext {
    /// Context owning the given link sync objects.
    ///
    /// `slot_private` lists the subset whose timelines step with this slot's
    /// frames (shared cross-frame objects step with the engine instead).
    pub fn new(
        sync_objects: HashMap<LinkId, Arc<SyncObject>>,
        slot_private: Vec<Arc<SyncObject>>,
    ) -> Self {
        Self {
            render_target_index: RwLock::new(None),
            draw_call_recorded: AtomicBool::new(false),
            frame_number: AtomicU64::new(0),
            sync_objects,
            slot_private_objects: slot_private,
        }
    }

    /// The current swapchain image index, if a frame is in progress
    pub fn render_target_index(&self) -> Option<u32> {
        *self
            .render_target_index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether an image index has been selected this frame
    pub fn has_render_target_index(&self) -> bool {
        self.render_target_index().is_some()
    }

    /// Select the swapchain image for this frame
    pub fn set_render_target_index(&self, index: u32) {
        *self
            .render_target_index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(index);
    }

    /// Drop the image selection (acquire failure path)
    pub fn clear_render_target_index(&self) {
        *self
            .render_target_index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Whether a draw reached submission this frame
    pub fn is_draw_call_recorded(&self) -> bool {
        self.draw_call_recorded.load(Ordering::Relaxed)
    }

    /// Mark that a draw reached submission
    pub fn set_draw_call_recorded(&self, recorded: bool) {
        self.draw_call_recorded.store(recorded, Ordering::Relaxed);
    }

    /// Engine-global frame number of the slot's current run
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    /// Set by the engine right before the slot is dispatched
    pub fn set_frame_number(&self, frame: u64) {
        self.frame_number.store(frame, Ordering::Release);
    }

    /// Sync object backing a link in this slot
    pub fn sync_object(&self, link: LinkId) -> Option<Arc<SyncObject>> {
        self.sync_objects.get(&link).cloned()
    }

    /// All sync objects of the slot
    pub fn all_sync_objects(&self) -> Vec<Arc<SyncObject>> {
        self.sync_objects.values().cloned().collect()
    }

    /// The slot-private objects whose timelines advance per slot frame
    pub fn slot_private_sync_objects(&self) -> &[Arc<SyncObject>] {
        &self.slot_private_objects
    }

    /// Clear the image selection, but only when the slot produced output
    /// last frame; a skipped frame keeps its state untouched.
    pub fn reset(&self) {
        if self.is_draw_call_recorded() {
            self.clear_render_target_index();
            self.set_draw_call_recorded(false);
        }
    }
}

type JobFn = Box<
    dyn Fn(&ExecutionContext, &SyncOperations, Option<&QueueSubmitTracker>) -> EngineResult<()>
        + Send
        + Sync,
>;

/// One node's executable closure plus its optional submit tracker.
///
/// Execution never propagates errors: a faulty node logs and the frame
/// continues, so a single bad submission cannot wedge the pipeline.
pub struct Job {
    name: String,
    job: JobFn,
    queue_tracker: Option<Arc<QueueSubmitTracker>>,
}

impl Job {
    /// Job from a closure, optionally tracked
    pub fn new(
        name: impl Into<String>,
        job: JobFn,
        queue_tracker: Option<Arc<QueueSubmitTracker>>,
    ) -> Self {
        Self {
            name: name.into(),
            job,
            queue_tracker,
        }
    }

    /// Node name this job belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached tracker, if tracking is on
    pub fn queue_tracker(&self) -> Option<&Arc<QueueSubmitTracker>> {
        self.queue_tracker.as_ref()
    }

    /// Run the closure for one frame; failures are logged, not raised
    pub fn execute(&self, execution_context: &ExecutionContext, sync_operations: &SyncOperations) {
        if let Some(tracker) = &self.queue_tracker {
            if let Err(error) = tracker.clear() {
                log::error!("job '{}': failed to clear submit tracker: {error}", self.name);
            }
        }
        topic_log!(
            RenderGraphExecutionTopic,
            "job '{}' frame {}",
            self.name,
            execution_context.frame_number()
        );
        let result = (self.job)(
            execution_context,
            sync_operations,
            self.queue_tracker.as_deref(),
        );
        if let Err(error) = result {
            log::error!("error occurred during job execution of '{}': {error}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(HashMap::new(), Vec::new())
    }

    #[test]
    fn reset_clears_the_index_only_after_a_recorded_draw() {
        let context = context();
        context.set_render_target_index(1);

        // Frame skipped: nothing was drawn, the selection stays.
        context.reset();
        assert_eq!(context.render_target_index(), Some(1));

        context.set_draw_call_recorded(true);
        context.reset();
        assert_eq!(context.render_target_index(), None);
        assert!(!context.is_draw_call_recorded());
    }

    #[test]
    fn job_failures_do_not_propagate() {
        let job = Job::new(
            "faulty",
            Box::new(|_, _, _| {
                Err(crate::error::EngineError::InvalidOperation {
                    reason: "injected".to_string(),
                })
            }),
            None,
        );
        job.execute(&context(), &SyncOperations::default());
    }
}
