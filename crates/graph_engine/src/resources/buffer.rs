//! Device buffer wrapper

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::device::{BufferAllocation, LogicalDevice, MemoryLocation};
use crate::error::EngineResult;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique buffer identity; the transfer staging areas key on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

/// Pipeline state a buffer ends up in after a transfer
#[derive(Debug, Clone, Copy)]
pub struct BufferState {
    /// Stage of the first consumer after the transfer
    pub pipeline_stage: vk::PipelineStageFlags2,
    /// Family that owns the buffer after the transfer
    pub queue_family_index: u32,
}

/// Device-local buffer with RAII cleanup
pub struct Buffer {
    id: BufferId,
    logical_device: LogicalDevice,
    allocation: BufferAllocation,
}

impl Buffer {
    /// Create a device-local buffer of `size` bytes
    pub fn new(
        logical_device: LogicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> EngineResult<Self> {
        let allocation = logical_device.dispatch().create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::DeviceLocal,
        )?;
        Ok(Self {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            logical_device,
            allocation,
        })
    }

    /// Stable identity of this buffer
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.allocation.buffer
    }

    /// Backing memory handle
    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation.memory
    }

    /// Allocation size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    /// The device the buffer lives on
    pub fn logical_device(&self) -> &LogicalDevice {
        &self.logical_device
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.logical_device.dispatch().destroy_buffer(&self.allocation);
    }
}
