//! Named fence and semaphore ownership

use std::collections::HashMap;
use std::sync::Mutex;

use ash::vk;

use crate::device::LogicalDevice;
use crate::error::{EngineError, EngineResult};
use crate::topic_log;

use crate::debug::SynchronizationTopic;

/// Bookkeeping for one timeline semaphore.
///
/// `offset` is the accumulated base value; per-frame relative values are
/// added to it to form absolute signal/wait values. It only ever grows.
#[derive(Debug, Clone, Copy)]
struct TimelineSemaphoreData {
    timeline_width: u64,
    timeline_offset: u64,
    initial_value: u64,
}

/// Owns an optional fence and a named set of binary/timeline semaphores.
///
/// Move-only: handles are destroyed exactly once, on drop. The timeline
/// bookkeeping sits behind a mutex so offsets can be stepped through shared
/// references from executor threads.
pub struct SyncPrimitives {
    logical_device: LogicalDevice,
    semaphores: HashMap<String, vk::Semaphore>,
    timeline_data: Mutex<HashMap<String, TimelineSemaphoreData>>,
    fence: Option<vk::Fence>,
}

impl SyncPrimitives {
    /// Primitives without a fence
    pub fn create_empty(logical_device: LogicalDevice) -> Self {
        Self {
            logical_device,
            semaphores: HashMap::new(),
            timeline_data: Mutex::new(HashMap::new()),
            fence: None,
        }
    }

    /// Primitives owning a fence, optionally created signaled
    pub fn create_with_fence(logical_device: LogicalDevice, signaled: bool) -> EngineResult<Self> {
        let fence = logical_device.dispatch().create_fence(signaled)?;
        Ok(Self {
            logical_device,
            semaphores: HashMap::new(),
            timeline_data: Mutex::new(HashMap::new()),
            fence: Some(fence),
        })
    }

    /// Create a binary semaphore under `name`
    pub fn create_semaphore(&mut self, name: impl Into<String>) -> EngineResult<()> {
        let name = name.into();
        let semaphore = self.logical_device.dispatch().create_binary_semaphore()?;
        topic_log!(SynchronizationTopic, "created binary semaphore '{name}'");
        self.semaphores.insert(name, semaphore);
        Ok(())
    }

    /// Create a timeline semaphore under `name`.
    ///
    /// `timeline_width` is the amount the offset advances per
    /// [`step_timeline`](Self::step_timeline) call; relative values recorded
    /// against this semaphore must stay below it.
    pub fn create_timeline_semaphore(
        &mut self,
        name: impl Into<String>,
        initial_value: u64,
        timeline_width: u64,
    ) -> EngineResult<()> {
        let name = name.into();
        let semaphore = self
            .logical_device
            .dispatch()
            .create_timeline_semaphore(initial_value)?;
        topic_log!(
            SynchronizationTopic,
            "created timeline semaphore '{name}' (initial {initial_value}, width {timeline_width})"
        );
        self.semaphores.insert(name.clone(), semaphore);
        self.timeline_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                name,
                TimelineSemaphoreData {
                    timeline_width,
                    timeline_offset: 0,
                    initial_value,
                },
            );
        Ok(())
    }

    /// Look up a semaphore handle
    pub fn semaphore(&self, name: &str) -> EngineResult<vk::Semaphore> {
        self.semaphores
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownSemaphore {
                name: name.to_string(),
            })
    }

    /// Whether a semaphore of any kind exists under `name`
    pub fn has_semaphore(&self, name: &str) -> bool {
        self.semaphores.contains_key(name)
    }

    /// Whether `name` refers to a timeline semaphore
    pub fn has_timeline_semaphore(&self, name: &str) -> bool {
        self.timeline_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of all timeline semaphores
    pub fn timeline_semaphore_names(&self) -> Vec<String> {
        self.timeline_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Current accumulated offset of a timeline semaphore
    pub fn timeline_offset(&self, name: &str) -> EngineResult<u64> {
        self.timeline_entry(name).map(|data| data.timeline_offset)
    }

    /// Step width of a timeline semaphore
    pub fn timeline_width(&self, name: &str) -> EngineResult<u64> {
        self.timeline_entry(name).map(|data| data.timeline_width)
    }

    /// Value the timeline semaphore was created with
    pub fn timeline_initial_value(&self, name: &str) -> EngineResult<u64> {
        self.timeline_entry(name).map(|data| data.initial_value)
    }

    /// Advance the timeline offset by one width and return the width.
    ///
    /// This is the single mechanism converting per-frame relative values into
    /// absolute, monotonically increasing timeline values. Overflow of the
    /// projected value is fatal; the semaphore has to be recreated.
    pub fn step_timeline(&self, name: &str) -> EngineResult<u64> {
        let mut data = self
            .timeline_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = data
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownSemaphore {
                name: name.to_string(),
            })?;
        let stepped = entry
            .timeline_offset
            .checked_add(entry.timeline_width)
            .ok_or_else(|| EngineError::TimelineOverflow {
                name: name.to_string(),
            })?;
        entry.timeline_offset = stepped;
        Ok(entry.timeline_width)
    }

    /// The owned fence, if this set carries one
    pub fn fence(&self) -> Option<vk::Fence> {
        self.fence
    }

    /// The device the handles live on
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.logical_device
    }

    fn timeline_entry(&self, name: &str) -> EngineResult<TimelineSemaphoreData> {
        self.timeline_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownSemaphore {
                name: name.to_string(),
            })
    }
}

impl Drop for SyncPrimitives {
    fn drop(&mut self) {
        let dispatch = self.logical_device.dispatch();
        if let Some(fence) = self.fence.take() {
            dispatch.destroy_fence(fence);
        }
        for semaphore in self.semaphores.values() {
            dispatch.destroy_semaphore(*semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;

    fn device() -> (HeadlessDispatch, LogicalDevice) {
        let dispatch = HeadlessDispatch::new();
        let device = LogicalDevice::new(dispatch.clone());
        (dispatch, device)
    }

    #[test]
    fn step_advances_offset_by_exactly_one_width() {
        let (_, device) = device();
        let mut primitives = SyncPrimitives::create_empty(device);
        primitives.create_timeline_semaphore("frame", 0, 4).unwrap();

        let mut previous = primitives.timeline_offset("frame").unwrap();
        assert_eq!(previous, 0);
        for _ in 0..32 {
            let width = primitives.step_timeline("frame").unwrap();
            assert_eq!(width, 4);
            let offset = primitives.timeline_offset("frame").unwrap();
            assert_eq!(offset, previous + 4);
            previous = offset;
        }
    }

    #[test]
    fn step_near_the_end_of_the_range_is_fatal() {
        let (_, device) = device();
        let mut primitives = SyncPrimitives::create_empty(device);
        primitives
            .create_timeline_semaphore("frame", 0, u64::MAX / 2 + 1)
            .unwrap();
        primitives.step_timeline("frame").unwrap();
        assert!(matches!(
            primitives.step_timeline("frame"),
            Err(EngineError::TimelineOverflow { .. })
        ));
    }

    #[test]
    fn handles_are_destroyed_on_drop() {
        let (dispatch, device) = device();
        {
            let mut primitives = SyncPrimitives::create_with_fence(device, false).unwrap();
            primitives.create_semaphore("binary").unwrap();
            primitives.create_timeline_semaphore("timeline", 0, 1).unwrap();
            assert_eq!(dispatch.live_semaphore_count(), 2);
            assert_eq!(dispatch.live_fence_count(), 1);
        }
        assert_eq!(dispatch.live_semaphore_count(), 0);
        assert_eq!(dispatch.live_fence_count(), 0);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let (_, device) = device();
        let primitives = SyncPrimitives::create_empty(device);
        assert!(matches!(
            primitives.semaphore("missing"),
            Err(EngineError::UnknownSemaphore { .. })
        ));
        assert!(matches!(
            primitives.step_timeline("missing"),
            Err(EngineError::UnknownSemaphore { .. })
        ));
    }
}
