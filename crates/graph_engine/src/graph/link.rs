//! Typed links between graph nodes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::LogicalDevice;
use crate::error::EngineResult;
use crate::synchronization::{SyncObject, SyncObjectSpec};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a link, stable across clones of the graph's view of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

/// CPU-side dependency flavor of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// The consumer waits for the producer's signal within the same frame
    CpuSync,
    /// The consumer waits for the producer's signal of the previous frame
    CpuAsync,
}

/// A directed, typed edge owning its synchronization recipe.
///
/// `CpuSync` links are instantiated per in-flight slot so slots never alias;
/// `CpuAsync` links instantiate one object shared by all slots, because the
/// cross-frame handshake must outlive any single slot.
pub struct Link {
    id: LinkId,
    from: String,
    to: String,
    link_type: LinkType,
    sync_object_spec: SyncObjectSpec,
    shared_sync_object: Arc<Mutex<Option<Arc<SyncObject>>>>,
}

impl Link {
    /// Edge between two named nodes
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        link_type: LinkType,
        sync_object_spec: SyncObjectSpec,
    ) -> Self {
        Self {
            id: LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)),
            from: from.into(),
            to: to.into(),
            link_type,
            sync_object_spec,
            shared_sync_object: Arc::new(Mutex::new(None)),
        }
    }

    /// Stable identity
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Producer node name
    pub fn from_node(&self) -> &str {
        &self.from
    }

    /// Consumer node name
    pub fn to_node(&self) -> &str {
        &self.to
    }

    /// Dependency flavor
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// The synchronization recipe
    pub fn sync_object_spec(&self) -> &SyncObjectSpec {
        &self.sync_object_spec
    }

    /// Mutable recipe access (graph building only)
    pub fn sync_object_spec_mut(&mut self) -> &mut SyncObjectSpec {
        &mut self.sync_object_spec
    }

    /// Instantiate a slot-private sync object from the recipe
    pub fn instantiate_sync_object(
        &self,
        logical_device: &LogicalDevice,
    ) -> EngineResult<Arc<SyncObject>> {
        Ok(Arc::new(self.sync_object_spec.instantiate(logical_device)?))
    }

    /// The one sync object shared by all slots, created on first use
    pub fn shared_sync_object(
        &self,
        logical_device: &LogicalDevice,
    ) -> EngineResult<Arc<SyncObject>> {
        let mut slot = self
            .shared_sync_object
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(object) = slot.as_ref() {
            return Ok(object.clone());
        }
        let object = Arc::new(self.sync_object_spec.instantiate(logical_device)?);
        *slot = Some(object.clone());
        Ok(object)
    }
}

impl Clone for Link {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            from: self.from.clone(),
            to: self.to.clone(),
            link_type: self.link_type,
            sync_object_spec: self.sync_object_spec.clone(),
            // Clones are views of the same edge and share the cross-frame
            // object cache.
            shared_sync_object: self.shared_sync_object.clone(),
        }
    }
}
