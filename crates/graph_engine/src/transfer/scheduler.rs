//! Staging-area coalescing of uploads and downloads

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use ash::vk;

use crate::device::{LogicalDevice, MemoryLocation};
use crate::error::EngineResult;
use crate::queue::SingleShotCommandContext;
use crate::resources::{Buffer, BufferId, BufferState, Image, Texture, TextureId, TextureState};
use crate::synchronization::{sync_groups, SyncObject, SyncOperations, SyncPrimitives};
use crate::topic_log;

use crate::debug::DataTransferTopic;

use super::{DownloadTask, StartToken, TransferEngine, UploadTask};

/// Timeline semaphore every finished transfer signals at value 1
pub const DATA_TRANSFER_FINISH_SEMAPHORE: &str = "data-transfer-finish";

enum RetiredTask {
    Upload(Arc<Mutex<UploadTask>>),
    Download(Arc<Mutex<DownloadTask>>),
}

impl RetiredTask {
    fn is_finished(&self) -> bool {
        match self {
            Self::Upload(task) => task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_finished(),
            Self::Download(task) => task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_finished(),
        }
    }
}

#[derive(Default)]
struct StagingAreas {
    buffer_uploads: HashMap<BufferId, Arc<Mutex<UploadTask>>>,
    texture_uploads: HashMap<TextureId, Arc<Mutex<UploadTask>>>,
    texture_downloads: HashMap<TextureId, Arc<Mutex<DownloadTask>>>,
}

/// Coalesces per-resource transfer requests into one batched execution.
///
/// At most one pending upload and one pending download exist per resource;
/// re-scheduling replaces the earlier pending task, so only the latest
/// payload reaches the device. One mutex covers all staging maps as a unit.
pub struct DataTransferScheduler {
    logical_device: LogicalDevice,
    staging: Mutex<StagingAreas>,
    retired: Mutex<Vec<RetiredTask>>,
}

impl DataTransferScheduler {
    /// Scheduler bound to a device
    pub fn new(logical_device: LogicalDevice) -> Self {
        Self {
            logical_device,
            staging: Mutex::new(StagingAreas::default()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Schedule (or replace) the upload of `data` into `buffer`.
    ///
    /// `final_state` names the first consumer; its stage becomes the stage of
    /// the consumer-side wait entry on the finish timeline.
    pub fn upload_buffer(
        &self,
        buffer: &Arc<Buffer>,
        data: Vec<u8>,
        _dst_context: &Arc<SingleShotCommandContext>,
        final_state: BufferState,
    ) -> Weak<Mutex<UploadTask>> {
        let logical_device = self.logical_device.clone();
        let destination = buffer.clone();
        let task = UploadTask::new(Box::new(move |in_operations, transfer_engine, storage| {
            let dispatch = logical_device.dispatch();
            let staging = dispatch.create_buffer(
                data.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::HostVisible,
            )?;
            dispatch.write_memory(staging.memory, 0, &data)?;

            let finish = finish_sync_object(&logical_device, final_state.pipeline_stage)?;
            let operations = in_operations.union(&finish.operations_group(sync_groups::INTERNAL)?);
            let size = data.len() as u64;
            transfer_engine.transfer(&operations, |device, command_buffer| {
                device.dispatch().cmd_copy_buffer(
                    command_buffer,
                    staging.buffer,
                    destination.handle(),
                    size,
                );
            })?;
            storage.store_staging_data(logical_device.clone(), staging);
            Ok(vec![finish])
        }));
        let task = Arc::new(Mutex::new(task));
        let weak = Arc::downgrade(&task);
        let mut staging = self.lock_staging();
        if staging.buffer_uploads.insert(buffer.id(), task).is_some() {
            topic_log!(DataTransferTopic, "coalesced upload for buffer {:?}", buffer.id());
        }
        weak
    }

    /// Typed-slice upload convenience over [`upload_buffer`](Self::upload_buffer)
    pub fn upload_buffer_typed<T: bytemuck::Pod>(
        &self,
        buffer: &Arc<Buffer>,
        data: &[T],
        dst_context: &Arc<SingleShotCommandContext>,
        final_state: BufferState,
    ) -> Weak<Mutex<UploadTask>> {
        self.upload_buffer(
            buffer,
            bytemuck::cast_slice(data).to_vec(),
            dst_context,
            final_state,
        )
    }

    /// Schedule (or replace) the upload of `image` into `texture`
    pub fn upload_texture(
        &self,
        texture: &Arc<Texture>,
        image: Image,
        _dst_context: &Arc<SingleShotCommandContext>,
        final_state: TextureState,
        sync_operations: SyncOperations,
    ) -> Weak<Mutex<UploadTask>> {
        let logical_device = self.logical_device.clone();
        let destination = texture.clone();
        let task = UploadTask::new(Box::new(move |in_operations, transfer_engine, storage| {
            let dispatch = logical_device.dispatch();
            let staging = dispatch.create_buffer(
                image.data().len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::HostVisible,
            )?;
            dispatch.write_memory(staging.memory, 0, image.data())?;

            let finish = finish_sync_object(&logical_device, final_state.pipeline_stage)?;
            let operations = in_operations
                .union(&sync_operations)
                .union(&finish.operations_group(sync_groups::INTERNAL)?);
            let description = *image.description();
            transfer_engine.transfer(&operations, |device, command_buffer| {
                device.dispatch().cmd_copy_buffer_to_image(
                    command_buffer,
                    staging.buffer,
                    destination.image(),
                    &description,
                );
            })?;
            storage.store_staging_data(logical_device.clone(), staging);
            Ok(vec![finish])
        }));
        let task = Arc::new(Mutex::new(task));
        let weak = Arc::downgrade(&task);
        let mut staging = self.lock_staging();
        if staging.texture_uploads.insert(texture.id(), task).is_some() {
            topic_log!(DataTransferTopic, "coalesced upload for texture {:?}", texture.id());
        }
        weak
    }

    /// Schedule (or replace) a download of `texture` into its staging buffer
    pub fn download_texture(
        &self,
        texture: &Arc<Texture>,
        sync_operations: SyncOperations,
    ) -> Weak<Mutex<DownloadTask>> {
        let logical_device = self.logical_device.clone();
        let source = texture.clone();
        let task = DownloadTask::new(
            Box::new(move |in_operations, transfer_engine| {
                let finish =
                    finish_sync_object(&logical_device, vk::PipelineStageFlags2::ALL_COMMANDS)?;
                let operations = in_operations
                    .union(&sync_operations)
                    .union(&finish.operations_group(sync_groups::INTERNAL)?);
                let description = *source.description();
                let staging = *source.staging_buffer();
                transfer_engine.transfer(&operations, |device, command_buffer| {
                    device.dispatch().cmd_copy_image_to_buffer(
                        command_buffer,
                        source.image(),
                        staging.buffer,
                        &description,
                    );
                })?;
                Ok(vec![finish])
            }),
            texture.clone(),
        );
        let task = Arc::new(Mutex::new(task));
        let weak = Arc::downgrade(&task);
        let mut staging = self.lock_staging();
        if staging
            .texture_downloads
            .insert(texture.id(), task)
            .is_some()
        {
            topic_log!(
                DataTransferTopic,
                "coalesced download for texture {:?}",
                texture.id()
            );
        }
        weak
    }

    /// Whether any transfer is pending
    pub fn has_any_task(&self) -> bool {
        let staging = self.lock_staging();
        !staging.buffer_uploads.is_empty()
            || !staging.texture_uploads.is_empty()
            || !staging.texture_downloads.is_empty()
    }

    /// Drain both staging areas in one batched execution.
    ///
    /// Each task submits with the union of `sync_operations` and its own
    /// requirements, gated by a shared execution fence. A failed submission
    /// is fatal: tasks submitted before it have already been drained through
    /// the fence, then the error surfaces.
    pub fn execute_tasks(
        &self,
        sync_operations: &SyncOperations,
        transfer_engine: &TransferEngine,
    ) -> EngineResult<()> {
        self.reclaim_finished();

        let (uploads, downloads) = {
            let mut staging = self.lock_staging();
            let buffer_uploads: Vec<Arc<Mutex<UploadTask>>> =
                staging.buffer_uploads.drain().map(|(_, task)| task).collect();
            let texture_uploads: Vec<Arc<Mutex<UploadTask>>> =
                staging.texture_uploads.drain().map(|(_, task)| task).collect();
            let uploads: Vec<Arc<Mutex<UploadTask>>> = buffer_uploads
                .into_iter()
                .chain(texture_uploads)
                .collect();
            let downloads: Vec<Arc<Mutex<DownloadTask>>> = staging
                .texture_downloads
                .drain()
                .map(|(_, task)| task)
                .collect();
            (uploads, downloads)
        };
        if uploads.is_empty() && downloads.is_empty() {
            return Ok(());
        }
        topic_log!(
            DataTransferTopic,
            "executing {} uploads / {} downloads",
            uploads.len(),
            downloads.len()
        );

        let execution_primitives =
            SyncPrimitives::create_with_fence(self.logical_device.clone(), false)?;
        let fence = execution_primitives
            .fence()
            .expect("execution primitives created with a fence");

        let mut retired = Vec::new();
        let mut failure = None;
        for task in uploads {
            self.logical_device.dispatch().reset_fences(&[fence])?;
            let operations = sync_operations.union(&SyncOperations::with_fence(fence));
            let started = task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .start(StartToken::new(), operations, transfer_engine);
            match started {
                Ok(()) => retired.push(RetiredTask::Upload(task)),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if failure.is_none() {
            for task in downloads {
                self.logical_device.dispatch().reset_fences(&[fence])?;
                let operations = sync_operations.union(&SyncOperations::with_fence(fence));
                let started = task
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .start(StartToken::new(), operations, transfer_engine);
                match started {
                    Ok(()) => retired.push(RetiredTask::Download(task)),
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }

        // Storage of executed tasks stays alive until their finish timeline
        // is observed at value 1.
        self.retired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(retired);

        match failure {
            Some(error) => {
                log::error!("data transfer failed: {error}");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Drop retired tasks whose finish timeline reached value 1
    pub fn reclaim_finished(&self) {
        self.retired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|task| !task.is_finished());
    }

    fn lock_staging(&self) -> std::sync::MutexGuard<'_, StagingAreas> {
        self.staging
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Sync object every transfer ends with: the finish timeline, signaled at
/// value 1 by the transfer (internal group) and waitable from outside
/// (external group).
fn finish_sync_object(
    logical_device: &LogicalDevice,
    consumer_stage: vk::PipelineStageFlags2,
) -> EngineResult<SyncObject> {
    let mut object = SyncObject::create_empty(logical_device.clone());
    object.create_timeline_semaphore(DATA_TRANSFER_FINISH_SEMAPHORE, 0, 1)?;
    object.add_signal_value_operation_to_group(
        sync_groups::INTERNAL,
        DATA_TRANSFER_FINISH_SEMAPHORE,
        vk::PipelineStageFlags2::TRANSFER,
        1,
    )?;
    object.add_wait_value_operation_to_group(
        sync_groups::EXTERNAL,
        DATA_TRANSFER_FINISH_SEMAPHORE,
        consumer_stage,
        1,
    )?;
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use crate::queue::QueueLoadBalancer;

    fn transfer_setup() -> (
        HeadlessDispatch,
        LogicalDevice,
        Arc<SingleShotCommandContext>,
        TransferEngine,
        DataTransferScheduler,
    ) {
        let dispatch = HeadlessDispatch::new();
        let device = LogicalDevice::new(dispatch.clone());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 1, 1));
        let context = Arc::new(SingleShotCommandContext::new(
            device.clone(),
            1,
            vk::QueueFlags::TRANSFER,
            balancer,
        ));
        let engine = TransferEngine::new(context.clone());
        let scheduler = DataTransferScheduler::new(device.clone());
        (dispatch, device, context, engine, scheduler)
    }

    fn final_state() -> BufferState {
        BufferState {
            pipeline_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            queue_family_index: 0,
        }
    }

    #[test]
    fn repeated_uploads_for_one_buffer_coalesce_to_the_latest_payload() {
        let (dispatch, device, context, engine, scheduler) = transfer_setup();
        let buffer = Arc::new(
            Buffer::new(device, 64, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap(),
        );

        let submits_before = dispatch.submit_count();
        scheduler.upload_buffer(&buffer, vec![0x00; 64], &context, final_state());
        scheduler.upload_buffer(&buffer, vec![0xFF; 64], &context, final_state());
        scheduler
            .execute_tasks(&SyncOperations::default(), &engine)
            .unwrap();

        assert_eq!(dispatch.submit_count() - submits_before, 1);
        assert_eq!(
            dispatch.memory_bytes(buffer.memory()).unwrap(),
            vec![0xFF; 64]
        );
    }

    #[test]
    fn finish_timeline_reaches_value_one() {
        let (_, device, context, engine, scheduler) = transfer_setup();
        let buffer = Arc::new(
            Buffer::new(device, 16, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap(),
        );

        let task = scheduler.upload_buffer(&buffer, vec![7; 16], &context, final_state());
        scheduler
            .execute_tasks(&SyncOperations::default(), &engine)
            .unwrap();

        let task = task.upgrade().expect("task retained until reclaimed");
        let task = task.lock().unwrap();
        assert!(task.is_started());
        assert!(task.is_finished());
        assert!(!task.sync_operations().unwrap().timeline_waits().is_empty());
    }

    #[test]
    fn execute_with_empty_staging_areas_is_a_no_op() {
        let (dispatch, _, _, engine, scheduler) = transfer_setup();
        assert!(!scheduler.has_any_task());
        scheduler
            .execute_tasks(&SyncOperations::default(), &engine)
            .unwrap();
        assert_eq!(dispatch.submit_count(), 0);
    }

    #[test]
    fn texture_download_reads_back_the_device_payload() {
        let (dispatch, device, context, engine, scheduler) = transfer_setup();
        let description = crate::device::ImageDescription {
            width: 2,
            height: 2,
            depth: 1,
            format: vk::Format::R8G8B8A8_UNORM,
        };
        let texture = Arc::new(
            Texture::new(device, description, vk::ImageUsageFlags::SAMPLED).unwrap(),
        );

        let payload: Vec<u8> = (0u8..16).collect();
        scheduler.upload_texture(
            &texture,
            Image::new(description, payload.clone()),
            &context,
            TextureState {
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                pipeline_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                queue_family_index: 0,
            },
            SyncOperations::default(),
        );
        let download = scheduler.download_texture(&texture, SyncOperations::default());
        scheduler
            .execute_tasks(&SyncOperations::default(), &engine)
            .unwrap();

        let download = download.upgrade().unwrap();
        let image = download.lock().unwrap().wait_image().unwrap();
        assert_eq!(image.data(), payload.as_slice());
        drop(dispatch);
    }
}
