//! Submit-time wait/signal composition

use ash::vk;

use crate::device::{SemaphoreSubmit, SubmitInfo};
use crate::error::EngineResult;

use super::SyncPrimitives;

/// Whether a queue family supports a pipeline stage.
///
/// Implemented by the command contexts; [`SyncOperations::restrict`] uses it
/// to drop entries a queue family cannot express.
pub trait PipelineStageCheck {
    /// True when submissions on this context may use `stage`
    fn is_pipeline_stage_supported(&self, stage: vk::PipelineStageFlags2) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OperationEntry {
    semaphore: vk::Semaphore,
    stage_mask: vk::PipelineStageFlags2,
    /// Absolute timeline value; `None` marks a binary entry
    value: Option<u64>,
}

impl OperationEntry {
    fn submit_entry(&self) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore: self.semaphore,
            value: self.value.unwrap_or(0),
            stage_mask: self.stage_mask,
        }
    }
}

/// Composable description of one submission's synchronization.
///
/// Pure value semantics: cheap to clone, unioned freely. Timeline values are
/// resolved against the owning primitives' offset at insertion time, so an
/// operations value is a snapshot of a specific timeline window.
#[derive(Debug, Clone, Default)]
pub struct SyncOperations {
    waits: Vec<OperationEntry>,
    signals: Vec<OperationEntry>,
    fence: Option<vk::Fence>,
}

impl SyncOperations {
    /// Operations carrying only a fence
    pub fn with_fence(fence: vk::Fence) -> Self {
        Self {
            fence: Some(fence),
            ..Self::default()
        }
    }

    /// Wait on a binary semaphore in `stage_mask`
    pub fn add_wait(
        &mut self,
        primitives: &SyncPrimitives,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> EngineResult<()> {
        let semaphore = primitives.semaphore(semaphore_name)?;
        self.waits.push(OperationEntry {
            semaphore,
            stage_mask,
            value: None,
        });
        Ok(())
    }

    /// Wait on a timeline semaphore; `value` is relative and resolves to
    /// `offset + value` against the primitives' current window.
    pub fn add_wait_value(
        &mut self,
        primitives: &SyncPrimitives,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> EngineResult<()> {
        let semaphore = primitives.semaphore(semaphore_name)?;
        let absolute = primitives.timeline_offset(semaphore_name)? + value;
        self.waits.push(OperationEntry {
            semaphore,
            stage_mask,
            value: Some(absolute),
        });
        Ok(())
    }

    /// Wait on a timeline semaphore at an already absolute value.
    ///
    /// Bypasses offset resolution; used when the caller has computed the
    /// target window itself (cross-frame waits).
    pub fn add_wait_absolute(
        &mut self,
        primitives: &SyncPrimitives,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        absolute_value: u64,
    ) -> EngineResult<()> {
        let semaphore = primitives.semaphore(semaphore_name)?;
        self.waits.push(OperationEntry {
            semaphore,
            stage_mask,
            value: Some(absolute_value),
        });
        Ok(())
    }

    /// Signal a binary semaphore in `stage_mask`
    pub fn add_signal(
        &mut self,
        primitives: &SyncPrimitives,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> EngineResult<()> {
        let semaphore = primitives.semaphore(semaphore_name)?;
        self.signals.push(OperationEntry {
            semaphore,
            stage_mask,
            value: None,
        });
        Ok(())
    }

    /// Signal a timeline semaphore at `offset + value`
    pub fn add_signal_value(
        &mut self,
        primitives: &SyncPrimitives,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> EngineResult<()> {
        let semaphore = primitives.semaphore(semaphore_name)?;
        let absolute = primitives.timeline_offset(semaphore_name)? + value;
        self.signals.push(OperationEntry {
            semaphore,
            stage_mask,
            value: Some(absolute),
        });
        Ok(())
    }

    /// Append the wait and signal entries to a submission
    pub fn fill_info(&self, submit_info: &mut SubmitInfo) {
        submit_info
            .waits
            .extend(self.waits.iter().map(OperationEntry::submit_entry));
        submit_info
            .signals
            .extend(self.signals.iter().map(OperationEntry::submit_entry));
    }

    /// Whether a fence is attached
    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// The attached fence, if any
    pub fn fence(&self) -> Option<vk::Fence> {
        self.fence
    }

    /// Merge `other`'s entries after this value's own, order preserved.
    ///
    /// At most one side may carry a fence; two fences cannot back a single
    /// submission and indicate a bug in the caller.
    pub fn union_with(&mut self, other: &Self) -> &mut Self {
        assert!(
            self.fence.is_none() || other.fence.is_none(),
            "fence conflict while unioning sync operations"
        );
        self.waits.extend(other.waits.iter().copied());
        self.signals.extend(other.signals.iter().copied());
        if self.fence.is_none() {
            self.fence = other.fence;
        }
        self
    }

    /// Non-destructive union
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.union_with(other);
        result
    }

    /// Shift all stored timeline values by `offset`.
    ///
    /// Used to replay a pre-built operation block in a later timeline window.
    /// Binary entries carry no value and are unaffected.
    pub fn shift_timeline_values(&mut self, offset: u64) {
        for entry in self.waits.iter_mut().chain(self.signals.iter_mut()) {
            if let Some(value) = entry.value.as_mut() {
                *value += offset;
            }
        }
    }

    /// Keep only the entries whose stage mask the context's queue family
    /// supports. The result is always a subset of `self`.
    #[must_use]
    pub fn restrict(&self, context: &impl PipelineStageCheck) -> Self {
        let mut result = self.clone();
        result
            .waits
            .retain(|entry| context.is_pipeline_stage_supported(entry.stage_mask));
        result
            .signals
            .retain(|entry| context.is_pipeline_stage_supported(entry.stage_mask));
        result
    }

    /// Drop all entries and the fence
    pub fn clear(&mut self) {
        self.waits.clear();
        self.signals.clear();
        self.fence = None;
    }

    /// True when no entries and no fence are present
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.signals.is_empty() && self.fence.is_none()
    }

    /// Handles of all binary wait entries (what a present call waits on)
    pub fn binary_wait_semaphores(&self) -> Vec<vk::Semaphore> {
        self.waits
            .iter()
            .filter(|entry| entry.value.is_none())
            .map(|entry| entry.semaphore)
            .collect()
    }

    /// Handles of all binary signal entries (what an acquire call signals)
    pub fn binary_signal_semaphores(&self) -> Vec<vk::Semaphore> {
        self.signals
            .iter()
            .filter(|entry| entry.value.is_none())
            .map(|entry| entry.semaphore)
            .collect()
    }

    /// `(semaphore, value)` pairs of all timeline wait entries
    pub fn timeline_waits(&self) -> Vec<(vk::Semaphore, u64)> {
        self.waits
            .iter()
            .filter_map(|entry| entry.value.map(|value| (entry.semaphore, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use crate::device::LogicalDevice;

    struct StageSupport(vk::PipelineStageFlags2);

    impl PipelineStageCheck for StageSupport {
        fn is_pipeline_stage_supported(&self, stage: vk::PipelineStageFlags2) -> bool {
            self.0.contains(stage)
        }
    }

    fn primitives() -> SyncPrimitives {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let mut primitives = SyncPrimitives::create_empty(device);
        primitives.create_semaphore("binary-a").unwrap();
        primitives.create_semaphore("binary-b").unwrap();
        primitives.create_timeline_semaphore("timeline", 0, 4).unwrap();
        primitives
    }

    #[test]
    fn union_concatenates_entries_in_order() {
        let primitives = primitives();
        let mut a = SyncOperations::default();
        a.add_wait(&primitives, "binary-a", vk::PipelineStageFlags2::ALL_COMMANDS)
            .unwrap();
        let mut b = SyncOperations::default();
        b.add_wait(&primitives, "binary-b", vk::PipelineStageFlags2::ALL_COMMANDS)
            .unwrap();
        b.add_signal(&primitives, "binary-a", vk::PipelineStageFlags2::ALL_COMMANDS)
            .unwrap();

        let mut submit = SubmitInfo::default();
        a.union(&b).fill_info(&mut submit);
        assert_eq!(submit.waits.len(), 2);
        assert_eq!(
            submit.waits[0].semaphore,
            primitives.semaphore("binary-a").unwrap()
        );
        assert_eq!(
            submit.waits[1].semaphore,
            primitives.semaphore("binary-b").unwrap()
        );
        assert_eq!(submit.signals.len(), 1);
    }

    #[test]
    #[should_panic(expected = "fence conflict")]
    fn union_of_two_fences_is_a_programmer_error() {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let fence_a = device.dispatch().create_fence(false).unwrap();
        let fence_b = device.dispatch().create_fence(false).unwrap();
        let mut a = SyncOperations::with_fence(fence_a);
        let b = SyncOperations::with_fence(fence_b);
        a.union_with(&b);
    }

    #[test]
    fn timeline_values_resolve_against_the_current_offset() {
        let primitives = primitives();
        let stage = vk::PipelineStageFlags2::ALL_COMMANDS;

        let mut frame0 = SyncOperations::default();
        frame0.add_wait_value(&primitives, "timeline", stage, 2).unwrap();
        primitives.step_timeline("timeline").unwrap();
        let mut frame1 = SyncOperations::default();
        frame1.add_wait_value(&primitives, "timeline", stage, 2).unwrap();
        primitives.step_timeline("timeline").unwrap();
        let mut frame2 = SyncOperations::default();
        frame2.add_wait_value(&primitives, "timeline", stage, 2).unwrap();

        let values: Vec<u64> = [frame0, frame1, frame2]
            .iter()
            .map(|ops| ops.timeline_waits()[0].1)
            .collect();
        assert_eq!(values, vec![2, 6, 10]);
    }

    #[test]
    fn restrict_keeps_only_supported_stages() {
        let primitives = primitives();
        let mut ops = SyncOperations::default();
        ops.add_wait(&primitives, "binary-a", vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap();
        ops.add_wait(&primitives, "binary-b", vk::PipelineStageFlags2::COPY)
            .unwrap();
        ops.add_signal(&primitives, "binary-a", vk::PipelineStageFlags2::COMPUTE_SHADER)
            .unwrap();

        let support = StageSupport(
            vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::COMPUTE_SHADER,
        );
        let restricted = ops.restrict(&support);

        let mut submit = SubmitInfo::default();
        restricted.fill_info(&mut submit);
        assert_eq!(submit.waits.len(), 1);
        assert_eq!(
            submit.waits[0].semaphore,
            primitives.semaphore("binary-b").unwrap()
        );
        assert_eq!(submit.signals.len(), 1);
    }

    #[test]
    fn shift_moves_timeline_entries_only() {
        let primitives = primitives();
        let stage = vk::PipelineStageFlags2::ALL_COMMANDS;
        let mut ops = SyncOperations::default();
        ops.add_wait(&primitives, "binary-a", stage).unwrap();
        ops.add_signal_value(&primitives, "timeline", stage, 1).unwrap();
        ops.shift_timeline_values(8);
        assert!(ops.timeline_waits().is_empty());
        let mut submit = SubmitInfo::default();
        ops.fill_info(&mut submit);
        assert_eq!(submit.signals[0].value, 9);
        assert_eq!(submit.waits[0].value, 0);
    }
}
