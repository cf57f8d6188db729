//! Per-submission feedback lookup

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::EngineResult;
use crate::queue::QueueSubmitTracker;

use super::SyncObjectId;

type FeedbackMapping = HashMap<String, Arc<QueueSubmitTracker>>;

/// Registry of submit trackers keyed by sync object and name.
///
/// The graph builder registers a node's tracker under the sync objects of
/// its outgoing links; consumers (the present node, or the application) look
/// the tracker up to ask whether the producer's past submissions completed.
#[derive(Default)]
pub struct SyncFeedbackService {
    feedbacks: RwLock<HashMap<SyncObjectId, FeedbackMapping>>,
}

impl SyncFeedbackService {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the tracker registered under `(key, name)`
    pub fn get(&self, key: SyncObjectId, name: &str) -> Option<Arc<QueueSubmitTracker>> {
        self.feedbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .and_then(|mapping| mapping.get(name))
            .cloned()
    }

    /// Register (or replace) a tracker under `(key, name)`
    pub fn register_tracker(
        &self,
        key: SyncObjectId,
        name: impl Into<String>,
        tracker: Arc<QueueSubmitTracker>,
    ) {
        self.feedbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(key)
            .or_default()
            .insert(name.into(), tracker);
    }

    /// Drain and destroy the fences of every registered tracker
    pub fn clear_fences(&self) -> EngineResult<()> {
        let feedbacks = self
            .feedbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for mapping in feedbacks.values() {
            for tracker in mapping.values() {
                tracker.clear()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use crate::device::LogicalDevice;
    use crate::synchronization::SyncObject;

    #[test]
    fn trackers_are_found_under_their_key_and_name() {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let object = SyncObject::create_empty(device.clone());
        let service = SyncFeedbackService::new();
        let tracker = Arc::new(QueueSubmitTracker::new(device));

        service.register_tracker(object.id(), "draw", tracker.clone());
        assert!(service.get(object.id(), "draw").is_some());
        assert!(service.get(object.id(), "other").is_none());
    }
}
