//! Device texture wrapper and host-side image payload

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::device::{
    BufferAllocation, ImageAllocation, ImageDescription, LogicalDevice, MemoryLocation,
};
use crate::error::EngineResult;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique texture identity; the transfer staging areas key on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

/// Layout and ownership a texture ends up in after a transfer
#[derive(Debug, Clone, Copy)]
pub struct TextureState {
    /// Image layout after the transfer
    pub layout: vk::ImageLayout,
    /// Stage of the first consumer after the transfer
    pub pipeline_stage: vk::PipelineStageFlags2,
    /// Family that owns the image after the transfer
    pub queue_family_index: u32,
}

/// Host-side image payload moved in and out of textures
#[derive(Debug, Clone)]
pub struct Image {
    description: ImageDescription,
    data: Vec<u8>,
}

impl Image {
    /// Payload from raw bytes; `data` must match the description's byte size
    pub fn new(description: ImageDescription, data: Vec<u8>) -> Self {
        Self { description, data }
    }

    /// Shape and format of the payload
    pub fn description(&self) -> &ImageDescription {
        &self.description
    }

    /// Raw bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the raw bytes (readback path)
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}

/// Device image with a dedicated readback staging buffer
pub struct Texture {
    id: TextureId,
    logical_device: LogicalDevice,
    allocation: ImageAllocation,
    staging: BufferAllocation,
    description: ImageDescription,
}

impl Texture {
    /// Create a sampled/transfer image and its host-visible staging buffer
    pub fn new(
        logical_device: LogicalDevice,
        description: ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> EngineResult<Self> {
        let allocation = logical_device.dispatch().create_image(
            &description,
            usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let staging = logical_device.dispatch().create_buffer(
            description.byte_size(),
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::HostVisible,
        )?;
        Ok(Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            logical_device,
            allocation,
            staging,
            description,
        })
    }

    /// Stable identity of this texture
    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Image handle
    pub fn image(&self) -> vk::Image {
        self.allocation.image
    }

    /// The texture's own host-visible staging buffer (readback target)
    pub fn staging_buffer(&self) -> &BufferAllocation {
        &self.staging
    }

    /// Shape and format
    pub fn description(&self) -> &ImageDescription {
        &self.description
    }

    /// The device the texture lives on
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.logical_device
    }

    /// Copy the staging buffer's bytes into a fresh payload
    pub fn read_staging(&self) -> EngineResult<Image> {
        let mut data = vec![0u8; self.description.byte_size() as usize];
        self.logical_device
            .dispatch()
            .read_memory(self.staging.memory, 0, &mut data)?;
        Ok(Image::new(self.description, data))
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.logical_device.dispatch().destroy_image(&self.allocation);
        self.logical_device.dispatch().destroy_buffer(&self.staging);
    }
}
