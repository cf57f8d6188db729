//! Pending upload and download work items

use std::sync::Arc;

use crate::device::{BufferAllocation, LogicalDevice};
use crate::error::{EngineError, EngineResult};
use crate::resources::{Image, Texture};
use crate::synchronization::{sync_groups, SyncObject, SyncOperations};

use super::{TransferEngine, DATA_TRANSFER_FINISH_SEMAPHORE};

/// Capability token proving a task is started by the scheduler, not directly
pub struct StartToken {
    _private: (),
}

impl StartToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Staging buffer kept alive until the transfer's final timeline signal
#[derive(Default)]
pub struct Storage {
    staging: Option<(LogicalDevice, BufferAllocation)>,
}

impl Storage {
    /// Adopt a staging allocation; freed when the storage drops
    pub fn store_staging_data(&mut self, logical_device: LogicalDevice, staging: BufferAllocation) {
        self.staging = Some((logical_device, staging));
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some((logical_device, staging)) = self.staging.take() {
            logical_device.dispatch().destroy_buffer(&staging);
        }
    }
}

type UploadFn = Box<
    dyn FnOnce(SyncOperations, &TransferEngine, &mut Storage) -> EngineResult<Vec<SyncObject>>
        + Send,
>;

/// One pending upload.
///
/// The recorded closure owns the payload; starting it creates the staging
/// buffer, records the copy, submits, and returns the sync objects proving
/// completion. The last object always carries the well-known
/// `data-transfer-finish` timeline so observers can wait on value 1.
pub struct UploadTask {
    task: Option<UploadFn>,
    transfer_objects: Vec<SyncObject>,
    storage: Storage,
}

impl UploadTask {
    /// Wrap an upload closure
    pub fn new(task: UploadFn) -> Self {
        Self {
            task: Some(task),
            transfer_objects: Vec::new(),
            storage: Storage::default(),
        }
    }

    /// Whether the task has been submitted
    pub fn is_started(&self) -> bool {
        self.task.is_none()
    }

    /// Submit the upload (scheduler only)
    pub fn start(
        &mut self,
        _token: StartToken,
        in_operations: SyncOperations,
        transfer_engine: &TransferEngine,
    ) -> EngineResult<()> {
        let task = self.task.take().ok_or_else(|| EngineError::InvalidOperation {
            reason: "upload task started twice".to_string(),
        })?;
        self.transfer_objects = task(in_operations, transfer_engine, &mut self.storage)?;
        let finished_object = self.transfer_objects.last().ok_or_else(|| {
            EngineError::Transfer {
                reason: "transfer produced no sync object to wait on".to_string(),
            }
        })?;
        if !finished_object
            .primitives()
            .has_timeline_semaphore(DATA_TRANSFER_FINISH_SEMAPHORE)
        {
            return Err(EngineError::Transfer {
                reason: format!(
                    "last transfer sync object lacks the '{DATA_TRANSFER_FINISH_SEMAPHORE}' timeline"
                ),
            });
        }
        Ok(())
    }

    /// Consumer-side operations of the finished transfer
    pub fn sync_operations(&self) -> EngineResult<SyncOperations> {
        let object = self.transfer_objects.last().ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "sync operations requested before the upload started".to_string(),
            }
        })?;
        object.operations_group(sync_groups::EXTERNAL)
    }

    /// Whether the finish timeline reached value 1
    pub fn is_finished(&self) -> bool {
        self.transfer_objects
            .last()
            .and_then(|object| object.semaphore_value(DATA_TRANSFER_FINISH_SEMAPHORE).ok())
            .is_some_and(|value| value >= 1)
    }
}

type DownloadFn =
    Box<dyn FnOnce(SyncOperations, &TransferEngine) -> EngineResult<Vec<SyncObject>> + Send>;

/// One pending download into a texture's staging buffer
pub struct DownloadTask {
    task: Option<DownloadFn>,
    transfer_objects: Vec<SyncObject>,
    texture: Arc<Texture>,
}

impl DownloadTask {
    /// Wrap a download closure for `texture`
    pub fn new(task: DownloadFn, texture: Arc<Texture>) -> Self {
        Self {
            task: Some(task),
            transfer_objects: Vec::new(),
            texture,
        }
    }

    /// Whether the task has been submitted
    pub fn is_started(&self) -> bool {
        self.task.is_none()
    }

    /// Submit the download (scheduler only)
    pub fn start(
        &mut self,
        _token: StartToken,
        in_operations: SyncOperations,
        transfer_engine: &TransferEngine,
    ) -> EngineResult<()> {
        let task = self.task.take().ok_or_else(|| EngineError::InvalidOperation {
            reason: "download task started twice".to_string(),
        })?;
        self.transfer_objects = task(in_operations, transfer_engine)?;
        let finished_object = self.transfer_objects.last().ok_or_else(|| {
            EngineError::Transfer {
                reason: "transfer produced no sync object to wait on".to_string(),
            }
        })?;
        if !finished_object
            .primitives()
            .has_timeline_semaphore(DATA_TRANSFER_FINISH_SEMAPHORE)
        {
            return Err(EngineError::Transfer {
                reason: format!(
                    "last transfer sync object lacks the '{DATA_TRANSFER_FINISH_SEMAPHORE}' timeline"
                ),
            });
        }
        Ok(())
    }

    /// Consumer-side operations of the finished transfer
    pub fn sync_operations(&self) -> EngineResult<SyncOperations> {
        let object = self.transfer_objects.last().ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "sync operations requested before the download started".to_string(),
            }
        })?;
        object.operations_group(sync_groups::EXTERNAL)
    }

    /// Whether the finish timeline reached value 1
    pub fn is_finished(&self) -> bool {
        self.transfer_objects
            .last()
            .and_then(|object| object.semaphore_value(DATA_TRANSFER_FINISH_SEMAPHORE).ok())
            .is_some_and(|value| value >= 1)
    }

    /// Block until the download finished, then read the payload back
    pub fn wait_image(&self) -> EngineResult<Image> {
        let object = self.transfer_objects.last().ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "image requested before the download started".to_string(),
            }
        })?;
        object.wait_semaphore(DATA_TRANSFER_FINISH_SEMAPHORE, 1)?;
        self.texture.read_staging()
    }
}
